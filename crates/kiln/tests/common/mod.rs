#![allow(dead_code)]

use std::sync::Arc;

use kiln::engine::Engine;
use kiln::primitive::{
    ActivationFunc, ActivationParams, ConvolutionParams, EltwiseOp, PrimitiveDescriptor,
    PrimitiveKind,
};
use kiln::tensor::{DType, Format, Layout, TensorDims};
use kiln_ref_engine::RefEngine;

pub fn engine() -> Arc<dyn Engine> {
    RefEngine::new().into_arc()
}

pub fn input(id: &str, b: i64, f: i64, y: i64, x: i64, dt: DType) -> PrimitiveDescriptor {
    PrimitiveDescriptor::new(
        id,
        vec![],
        PrimitiveKind::InputLayout {
            layout: Layout::new(dt, Format::Bfyx, TensorDims::bfyx(b, f, y, x)),
        },
    )
}

pub fn data_f32(id: &str, dims: TensorDims, values: &[f32]) -> PrimitiveDescriptor {
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(values.len() as i64, dims.count(), "payload must fill dims");
    PrimitiveDescriptor::new(
        id,
        vec![],
        PrimitiveKind::Data {
            layout: Layout::new(DType::F32, Format::Bfyx, dims),
            payload: Arc::new(payload),
        },
    )
}

pub fn data_f32_fill(id: &str, dims: TensorDims, value: f32) -> PrimitiveDescriptor {
    let values = vec![value; dims.count() as usize];
    data_f32(id, dims, &values)
}

pub fn conv(
    id: &str,
    input: &str,
    weights: &str,
    stride: i64,
    pad: i64,
) -> PrimitiveDescriptor {
    PrimitiveDescriptor::new(
        id,
        vec![input.into(), weights.into()],
        PrimitiveKind::Convolution(ConvolutionParams {
            stride: [stride, stride, 1],
            pad: [pad, pad, 0],
            ..Default::default()
        }),
    )
}

pub fn activation(id: &str, input: &str, func: ActivationFunc) -> PrimitiveDescriptor {
    PrimitiveDescriptor::new(
        id,
        vec![input.into()],
        PrimitiveKind::Activation {
            func,
            params: ActivationParams::default(),
        },
    )
}

pub fn eltwise(id: &str, a: &str, b: &str, op: EltwiseOp) -> PrimitiveDescriptor {
    PrimitiveDescriptor::new(id, vec![a.into(), b.into()], PrimitiveKind::Eltwise { op })
}

pub fn reorder_same(id: &str, input: &str, layout: Layout) -> PrimitiveDescriptor {
    PrimitiveDescriptor::new(
        id,
        vec![input.into()],
        PrimitiveKind::Reorder { target: layout },
    )
}

pub fn payload_as_f32(desc: &PrimitiveDescriptor) -> Vec<f32> {
    match &desc.kind {
        PrimitiveKind::Data { payload, .. } => payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        other => panic!("expected a data node, got {:?}", other.tag()),
    }
}
