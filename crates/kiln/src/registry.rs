//! Process-wide primitive registry.
//!
//! Each primitive kind registers its arity, a layout-inference callback and
//! an optional fusing-parameters accessor. Built-in kinds are registered on
//! first access; registration is one-shot and re-registering a kind is a
//! no-op, so the registry can be populated from any thread without
//! coordination.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::{GraphError, GraphResult};
use crate::primitive::{
    ActivationFunc, ActivationParams, EltwiseOp, KindTag, PoolMode, PrimitiveDescriptor,
    PrimitiveKind,
};
use crate::sliding_window::{self, SworMode};
use crate::tensor::{Axis, DType, Layout, TensorDims};

/// Kernel-selector-facing parameters of a fusable primitive.
#[derive(Debug, Clone)]
pub enum FuseParams {
    Activation {
        func: ActivationFunc,
        params: ActivationParams,
    },
    Eltwise {
        op: EltwiseOp,
    },
    Quantize {
        levels: u32,
    },
}

pub type InferFn = fn(&PrimitiveDescriptor, &[Layout]) -> GraphResult<Layout>;
pub type FuseParamsFn = fn(&PrimitiveDescriptor) -> Option<FuseParams>;

/// Static behavior registered for one primitive kind.
#[derive(Clone, Copy)]
pub struct KindInfo {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub infer_layout: InferFn,
    pub fuse_params: Option<FuseParamsFn>,
}

static REGISTRY: Lazy<RwLock<HashMap<KindTag, KindInfo>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    register_builtin(&mut map);
    RwLock::new(map)
});

/// Registers a kind. Returns false (and changes nothing) if the kind is
/// already registered.
pub fn register(tag: KindTag, info: KindInfo) -> bool {
    let mut map = REGISTRY.write().expect("primitive registry poisoned");
    if map.contains_key(&tag) {
        return false;
    }
    map.insert(tag, info);
    true
}

pub fn kind_info(tag: KindTag) -> GraphResult<KindInfo> {
    REGISTRY
        .read()
        .expect("primitive registry poisoned")
        .get(&tag)
        .copied()
        .ok_or_else(|| {
            GraphError::Configuration(format!("primitive kind {} is not registered", tag.as_str()))
        })
}

/// Runs the registered layout inference for a descriptor, after arity checks.
pub fn infer_layout(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let info = kind_info(desc.kind_tag())?;
    if inputs.len() < info.min_inputs || inputs.len() > info.max_inputs {
        return Err(GraphError::InvariantViolation(format!(
            "{}: expected {}..={} inputs, got {}",
            desc.id,
            info.min_inputs,
            info.max_inputs,
            inputs.len()
        )));
    }
    (info.infer_layout)(desc, inputs)
}

fn register_builtin(map: &mut HashMap<KindTag, KindInfo>) {
    let mut add = |tag: KindTag, min: usize, max: usize, infer: InferFn, fp: Option<FuseParamsFn>| {
        map.insert(
            tag,
            KindInfo {
                min_inputs: min,
                max_inputs: max,
                infer_layout: infer,
                fuse_params: fp,
            },
        );
    };

    add(KindTag::InputLayout, 0, 0, infer_declared, None);
    add(KindTag::Data, 0, 0, infer_declared, None);
    add(KindTag::MutableData, 0, 1, infer_declared, None);
    add(KindTag::Convolution, 2, 5, infer_convolution, None);
    add(KindTag::BinaryConvolution, 2, 3, infer_convolution, None);
    add(KindTag::Deconvolution, 2, 3, infer_deconvolution, None);
    add(KindTag::Pooling, 1, 1, infer_pooling, None);
    add(
        KindTag::Activation,
        1,
        1,
        infer_passthrough,
        Some(fuse_params_activation),
    );
    add(KindTag::Eltwise, 2, 8, infer_eltwise, Some(fuse_params_eltwise));
    add(KindTag::Quantize, 5, 9, infer_quantize, Some(fuse_params_quantize));
    add(KindTag::Reorder, 1, 1, infer_reorder, None);
    add(KindTag::Reshape, 1, 1, infer_reshape, None);
    add(KindTag::Permute, 1, 1, infer_permute, None);
    add(KindTag::Concatenation, 1, 16, infer_concatenation, None);
    add(KindTag::Crop, 1, 1, infer_crop, None);
    add(KindTag::Split, 1, 1, infer_passthrough, None);
    add(KindTag::FullyConnected, 2, 3, infer_fully_connected, None);
    add(KindTag::Gemm, 2, 3, infer_gemm, None);
    add(KindTag::StridedSlice, 1, 4, infer_strided_slice, None);
    add(KindTag::Border, 1, 1, infer_border, None);
    add(KindTag::PriorBox, 0, 2, infer_declared, None);
    add(KindTag::Softmax, 1, 1, infer_passthrough, None);
    add(KindTag::Assign, 1, 1, infer_passthrough, None);
    add(KindTag::ReadValue, 1, 1, infer_passthrough, None);
    add(KindTag::GenericLayer, 1, 1, infer_reorder, None);
}

fn declared_layout(desc: &PrimitiveDescriptor) -> Option<&Layout> {
    match &desc.kind {
        PrimitiveKind::InputLayout { layout } => Some(layout),
        PrimitiveKind::Data { layout, .. } => Some(layout),
        PrimitiveKind::MutableData { layout } => Some(layout),
        PrimitiveKind::PriorBox { output_layout } => Some(output_layout),
        _ => None,
    }
}

fn infer_declared(desc: &PrimitiveDescriptor, _inputs: &[Layout]) -> GraphResult<Layout> {
    declared_layout(desc).cloned().ok_or_else(|| {
        GraphError::InvariantViolation(format!("{}: kind carries no declared layout", desc.id))
    })
}

fn infer_passthrough(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let input = first_input(desc, inputs)?;
    Ok(Layout::new(input.data_type, input.format, input.size))
}

fn infer_convolution(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let (params, binary) = match &desc.kind {
        PrimitiveKind::Convolution(p) => (p, false),
        PrimitiveKind::BinaryConvolution(p) => (p, true),
        _ => unreachable!("registered for convolution kinds only"),
    };
    let input = first_input(desc, inputs)?;
    let weights = &inputs[1];
    let spatial = match params.output_size {
        Some(size) => size.spatial,
        None => sliding_window::output_range(
            SworMode::All,
            input.size.spatial,
            weights.size.spatial,
            params.pad,
            params.stride,
            params.dilation,
        ),
    };
    let data_type = if binary { DType::F32 } else { input.data_type };
    Ok(Layout::new(
        data_type,
        input.format,
        TensorDims::new(input.size.batch, weights.size.batch, spatial),
    ))
}

fn infer_deconvolution(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let params = match &desc.kind {
        PrimitiveKind::Deconvolution(p) => p,
        _ => unreachable!("registered for deconvolution only"),
    };
    let input = first_input(desc, inputs)?;
    let weights = &inputs[1];
    let spatial = match params.output_size {
        Some(size) => size.spatial,
        None => {
            let mut out = [1i64; 3];
            for axis in 0..3 {
                out[axis] = (input.size.spatial[axis] - 1) * params.stride[axis]
                    + weights.size.spatial[axis]
                    - 2 * params.pad[axis];
            }
            out
        }
    };
    Ok(Layout::new(
        input.data_type,
        input.format,
        TensorDims::new(input.size.batch, weights.size.batch, spatial),
    ))
}

fn infer_pooling(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let params = match &desc.kind {
        PrimitiveKind::Pooling(p) => p,
        _ => unreachable!("registered for pooling only"),
    };
    let input = first_input(desc, inputs)?;
    let spatial = match params.output_size {
        Some(size) => size.spatial,
        None => sliding_window::output_range(
            SworMode::ExceedOnceData,
            input.size.spatial,
            params.size,
            params.pad,
            params.stride,
            [1, 1, 1],
        ),
    };
    Ok(Layout::new(
        input.data_type,
        input.format,
        TensorDims::new(input.size.batch, input.size.feature, spatial),
    ))
}

fn infer_eltwise(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let first = first_input(desc, inputs)?;
    let mut size = first.size;
    let mut data_type = first.data_type;
    for input in &inputs[1..] {
        size = TensorDims::max(&size, &input.size);
        data_type = DType::max_type(data_type, input.data_type);
    }
    for input in inputs {
        for (have, need) in [
            (input.size.batch, size.batch),
            (input.size.feature, size.feature),
            (input.size.spatial[0], size.spatial[0]),
            (input.size.spatial[1], size.spatial[1]),
            (input.size.spatial[2], size.spatial[2]),
        ] {
            if have != need && have != 1 {
                return Err(GraphError::IncompatibleLayout {
                    node: desc.id.clone(),
                    details: format!("eltwise input extent {have} does not broadcast to {need}"),
                });
            }
        }
    }
    Ok(Layout::new(data_type, first.format, size))
}

fn infer_quantize(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let params = match &desc.kind {
        PrimitiveKind::Quantize(p) => p,
        _ => unreachable!("registered for quantize only"),
    };
    let input = first_input(desc, inputs)?;
    let data_type = params.out_data_type.unwrap_or(input.data_type);
    Ok(Layout::new(data_type, input.format, input.size))
}

fn infer_reorder(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let target = match &desc.kind {
        PrimitiveKind::Reorder { target } => target,
        PrimitiveKind::GenericLayer { target } => target,
        _ => unreachable!("registered for reorder kinds only"),
    };
    let input = first_input(desc, inputs)?;
    if target.size.count() != input.size.count() {
        return Err(GraphError::IncompatibleLayout {
            node: desc.id.clone(),
            details: format!(
                "reorder changes element count: {} -> {}",
                input.size.count(),
                target.size.count()
            ),
        });
    }
    Ok(target.clone())
}

fn infer_reshape(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let out_size = match &desc.kind {
        PrimitiveKind::Reshape { out_size } => *out_size,
        _ => unreachable!("registered for reshape only"),
    };
    let input = first_input(desc, inputs)?;
    if out_size.count() != input.size.count() {
        return Err(GraphError::IncompatibleLayout {
            node: desc.id.clone(),
            details: format!(
                "reshape changes element count: {} -> {}",
                input.size.count(),
                out_size.count()
            ),
        });
    }
    Ok(Layout::new(input.data_type, input.format, out_size))
}

fn infer_permute(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let order = match &desc.kind {
        PrimitiveKind::Permute { order } => *order,
        _ => unreachable!("registered for permute only"),
    };
    let input = first_input(desc, inputs)?;
    let axes = [Axis::Batch, Axis::Feature, Axis::X, Axis::Y, Axis::Z];
    let mut size = input.size;
    for (dst, src) in axes.iter().zip(order.iter()) {
        size.set_axis(*dst, input.size.axis(*src));
    }
    Ok(Layout::new(input.data_type, input.format, size))
}

fn infer_concatenation(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let axis = match &desc.kind {
        PrimitiveKind::Concatenation { axis } => *axis,
        _ => unreachable!("registered for concatenation only"),
    };
    let first = first_input(desc, inputs)?;
    let mut size = first.size;
    let mut total = 0i64;
    for input in inputs {
        total += input.size.axis(axis);
        let mut rest = input.size;
        rest.set_axis(axis, 0);
        let mut expect = size;
        expect.set_axis(axis, 0);
        if rest != expect {
            return Err(GraphError::IncompatibleLayout {
                node: desc.id.clone(),
                details: "concatenation inputs differ outside the concat axis".into(),
            });
        }
    }
    size.set_axis(axis, total);
    Ok(Layout::new(first.data_type, first.format, size))
}

fn infer_crop(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let reference = match &desc.kind {
        PrimitiveKind::Crop { reference, .. } => *reference,
        _ => unreachable!("registered for crop only"),
    };
    let input = first_input(desc, inputs)?;
    Ok(Layout::new(input.data_type, input.format, reference))
}

fn infer_fully_connected(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let input = first_input(desc, inputs)?;
    let weights = &inputs[1];
    Ok(Layout::new(
        input.data_type,
        input.format,
        TensorDims::bfyx(input.size.batch, weights.size.batch, 1, 1),
    ))
}

fn infer_gemm(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let a = first_input(desc, inputs)?;
    let b = &inputs[1];
    // Matrices live in the spatial y (rows) / x (cols) axes.
    let size = TensorDims::new(
        a.size.batch,
        a.size.feature,
        [b.size.spatial[0], a.size.spatial[1], 1],
    );
    Ok(Layout::new(
        DType::max_type(a.data_type, b.data_type),
        a.format,
        size,
    ))
}

fn infer_strided_slice(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let params = match &desc.kind {
        PrimitiveKind::StridedSlice(p) => p,
        _ => unreachable!("registered for strided_slice only"),
    };
    let input = first_input(desc, inputs)?;
    let axes = [Axis::Batch, Axis::Feature, Axis::X, Axis::Y, Axis::Z];
    let mut size = input.size;
    for axis in axes {
        let begin = params.begin.axis(axis);
        let end = params.end.axis(axis);
        let stride = params.strides.axis(axis).max(1);
        size.set_axis(axis, ((end - begin) + stride - 1) / stride);
    }
    Ok(Layout::new(input.data_type, input.format, size))
}

fn infer_border(desc: &PrimitiveDescriptor, inputs: &[Layout]) -> GraphResult<Layout> {
    let (lower, upper) = match &desc.kind {
        PrimitiveKind::Border {
            pad_lower,
            pad_upper,
        } => (*pad_lower, *pad_upper),
        _ => unreachable!("registered for border only"),
    };
    let input = first_input(desc, inputs)?;
    Ok(Layout::new(
        input.data_type,
        input.format,
        input.size.add(&lower).add(&upper),
    ))
}

fn first_input<'a>(desc: &PrimitiveDescriptor, inputs: &'a [Layout]) -> GraphResult<&'a Layout> {
    inputs.first().ok_or_else(|| {
        GraphError::InvariantViolation(format!("{}: layout inference requires an input", desc.id))
    })
}

fn fuse_params_activation(desc: &PrimitiveDescriptor) -> Option<FuseParams> {
    match &desc.kind {
        PrimitiveKind::Activation { func, params } => Some(FuseParams::Activation {
            func: *func,
            params: *params,
        }),
        _ => None,
    }
}

fn fuse_params_eltwise(desc: &PrimitiveDescriptor) -> Option<FuseParams> {
    match &desc.kind {
        PrimitiveKind::Eltwise { op } => Some(FuseParams::Eltwise { op: *op }),
        _ => None,
    }
}

fn fuse_params_quantize(desc: &PrimitiveDescriptor) -> Option<FuseParams> {
    match &desc.kind {
        PrimitiveKind::Quantize(p) => Some(FuseParams::Quantize { levels: p.levels }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Format;

    fn conv_desc(stride: i64, pad: i64) -> PrimitiveDescriptor {
        PrimitiveDescriptor::new(
            "conv",
            vec!["input".into(), "weights".into()],
            PrimitiveKind::Convolution(crate::primitive::ConvolutionParams {
                stride: [stride, stride, 1],
                pad: [pad, pad, 0],
                ..Default::default()
            }),
        )
    }

    #[test]
    fn convolution_layout_follows_sliding_window() {
        let input = Layout::new(DType::F16, Format::Bfyx, TensorDims::bfyx(1, 3, 224, 224));
        let weights = Layout::new(DType::F16, Format::Bfyx, TensorDims::bfyx(64, 3, 3, 3));
        let out = infer_layout(&conv_desc(2, 1), &[input, weights]).expect("inference");
        assert_eq!(out.size, TensorDims::bfyx(1, 64, 112, 112));
        assert_eq!(out.data_type, DType::F16);
    }

    #[test]
    fn registration_is_one_shot() {
        let info = kind_info(KindTag::Convolution).expect("builtin registered");
        assert!(!register(KindTag::Convolution, info));
    }

    #[test]
    fn eltwise_broadcast_rejects_mismatched_extents() {
        let a = Layout::new(DType::F32, Format::Bfyx, TensorDims::bfyx(1, 8, 4, 4));
        let b = Layout::new(DType::F32, Format::Bfyx, TensorDims::bfyx(1, 3, 4, 4));
        let desc = PrimitiveDescriptor::new(
            "sum",
            vec!["a".into(), "b".into()],
            PrimitiveKind::Eltwise { op: EltwiseOp::Add },
        );
        assert!(infer_layout(&desc, &[a, b]).is_err());
    }
}
