//! Rewrites range-based quantize nodes into scale-shift form.
//!
//! From the four range inputs this pass derives per-element input/output
//! scales and shifts, attaches them as extra data inputs (slots 5..8), and
//! records on the node which of those tensors are per-tensor constants and
//! which stages the kernel can skip. The fusing engine's drop table reads
//! exactly this state.

use std::sync::Arc;

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{NodeId, Program, QuantizeOpt};
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::{DType, Layout};

#[derive(Default)]
pub struct PrepareQuantization;

impl Pass for PrepareQuantization {
    fn name(&self) -> &'static str {
        "prepare_quantization"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let quantizes: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::Quantize))
            .collect();

        for q in quantizes {
            // already in scale-shift form, or ranges are not compile-time data
            if program.node(q).dependencies().len() != 5 {
                continue;
            }
            let levels = match &program.node(q).desc().kind {
                PrimitiveKind::Quantize(p) => p.levels,
                _ => continue,
            };
            let Some(in_lo) = data_payload_f32(program, q, 1) else {
                continue;
            };
            let Some(in_hi) = data_payload_f32(program, q, 2) else {
                continue;
            };
            let Some(out_lo) = data_payload_f32(program, q, 3) else {
                continue;
            };
            let Some(out_hi) = data_payload_f32(program, q, 4) else {
                continue;
            };

            let max_levels = (levels - 1) as f32;
            let in_scale = zip_broadcast(&in_lo, &in_hi, |lo, hi| max_levels / (hi - lo));
            let in_shift = zip_broadcast(&in_lo, &in_scale, |lo, scale| -lo * scale);
            let out_scale = zip_broadcast(&out_lo, &out_hi, |lo, hi| (hi - lo) / max_levels);
            let out_shift = out_lo.clone();

            let input_dt = program.dep_layout(q, 0)?.data_type;
            let mut opt = QuantizeOpt {
                scale_shift_opt: true,
                need_clamp: !(levels == 256 && input_dt.is_quantized()),
                need_pre_shift: in_shift.iter().any(|&v| v != 0.0),
                need_post_scale: out_scale.iter().any(|&v| v != 1.0),
                need_post_shift: out_shift.iter().any(|&v| v != 0.0),
                per_tensor_input_scale: uniform(&in_scale),
                per_tensor_input_shift: uniform(&in_shift),
                per_tensor_output_scale: uniform(&out_scale),
                per_tensor_output_shift: uniform(&out_shift),
                per_tensor_output_range: uniform(&out_lo) && uniform(&out_hi),
                output_lo: 0.0,
                output_hi: 0.0,
            };
            if opt.per_tensor_output_range {
                opt.output_lo = out_lo[0];
                opt.output_hi = out_hi[0];
            }

            let q_id = program.node(q).id().clone();
            for (suffix, values) in [
                ("in_scale", &in_scale),
                ("in_shift", &in_shift),
                ("out_scale", &out_scale),
                ("out_shift", &out_shift),
            ] {
                let node = attach_data(program, &format!("{q_id}_{suffix}"), values);
                program.add_connection(node, q);
            }
            program.node_mut(q).set_quantize_opt(opt);
        }
        Ok(())
    }
}

fn data_payload_f32(program: &Program, node: NodeId, dep_idx: usize) -> Option<Vec<f32>> {
    let dep = *program.node(node).dependencies().get(dep_idx)?;
    match &program.node(dep).desc().kind {
        PrimitiveKind::Data { payload, .. } if payload.len() % 4 == 0 && !payload.is_empty() => {
            Some(
                payload
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            )
        }
        _ => None,
    }
}

/// Elementwise combine with length-1 broadcast on either side.
fn zip_broadcast(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| f(a[i.min(a.len() - 1)], b[i.min(b.len() - 1)]))
        .collect()
}

fn uniform(values: &[f32]) -> bool {
    values.windows(2).all(|w| w[0] == w[1])
}

fn attach_data(program: &mut Program, id: &str, values: &[f32]) -> NodeId {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let layout = Layout::new(
        DType::F32,
        crate::tensor::Format::Bfyx,
        crate::tensor::TensorDims::bfyx(1, values.len() as i64, 1, 1),
    );
    program.get_or_create(PrimitiveDescriptor::new(
        id,
        Vec::new(),
        PrimitiveKind::Data {
            layout,
            payload: Arc::new(bytes),
        },
    ))
}
