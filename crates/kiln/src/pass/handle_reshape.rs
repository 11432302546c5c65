//! Splits reshapes away from blocked formats.
//!
//! A reshape reinterprets the linear element order, which only holds in
//! plain formats; when its input arrives blocked, the reshape is fenced with
//! a reorder to the neutral plain format and downstream format selection
//! reorders back if it wants to.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::{Format, Layout};

#[derive(Default)]
pub struct HandleReshape;

impl Pass for HandleReshape {
    fn name(&self) -> &'static str {
        "handle_reshape"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let reshapes: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::Reshape))
            .collect();

        for reshape in reshapes {
            if program.node(reshape).dependencies().is_empty() {
                continue;
            }
            let input_layout = program.dep_layout(reshape, 0)?;
            if !input_layout.format.is_blocked() {
                continue;
            }
            let neutral = if input_layout.format.spatial_rank() == 3 {
                Format::Bfzyx
            } else {
                Format::Bfyx
            };
            let src_id = {
                let dep = program.node(reshape).dependencies()[0];
                program.node(dep).id().clone()
            };
            let reorder_desc = PrimitiveDescriptor::new(
                format!("{}_input_plain", program.node(reshape).id()),
                vec![src_id],
                PrimitiveKind::Reorder {
                    target: Layout::new(input_layout.data_type, neutral, input_layout.size),
                },
            );
            let reorder = program.get_or_create(reorder_desc);
            program.add_intermediate(reorder, reshape, 0, true, false)?;
            program.node_mut(reshape).invalidate_output_layout();
            program.invalidate_users_layouts(reshape);
            program.get_output_layout(reshape)?;
        }
        Ok(())
    }
}
