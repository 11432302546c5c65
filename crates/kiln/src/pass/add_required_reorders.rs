//! Last-chance layout legalization: kinds that only address plain buffers
//! get a reorder in front of any blocked input that earlier passes left
//! behind.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::{Format, Layout};

#[derive(Default)]
pub struct AddRequiredReorders;

impl Pass for AddRequiredReorders {
    fn name(&self) -> &'static str {
        "add_required_reorders"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for node in order {
            if !program.is_alive(node) || !requires_plain_inputs(program.node(node).kind_tag()) {
                continue;
            }
            let dep_count = program.node(node).dependencies().len();
            for idx in 0..dep_count {
                let layout = program.dep_layout(node, idx)?;
                if !layout.format.is_blocked() {
                    continue;
                }
                let neutral = if layout.format.spatial_rank() == 3 {
                    Format::Bfzyx
                } else {
                    Format::Bfyx
                };
                let src_id = {
                    let dep = program.node(node).dependencies()[idx];
                    program.node(dep).id().clone()
                };
                let reorder_desc = PrimitiveDescriptor::new(
                    format!("{}_required_reorder_{}", program.node(node).id(), idx),
                    vec![src_id],
                    PrimitiveKind::Reorder {
                        target: Layout::new(layout.data_type, neutral, layout.size),
                    },
                );
                let reorder = program.get_or_create(reorder_desc);
                program.add_intermediate(reorder, node, idx, true, false)?;
                program.node_mut(node).invalidate_output_layout();
                program.invalidate_users_layouts(node);
                program.get_output_layout(node)?;
            }
        }
        Ok(())
    }
}

fn requires_plain_inputs(tag: KindTag) -> bool {
    matches!(
        tag,
        KindTag::FullyConnected
            | KindTag::Gemm
            | KindTag::Reshape
            | KindTag::Crop
            | KindTag::StridedSlice
            | KindTag::Border
            | KindTag::Permute
            | KindTag::Softmax
    )
}
