//! Folds prior-box primitives into plain data nodes: their results depend
//! only on compile-time shapes, so they are evaluated once on the host and
//! never reach the device graph as computations.

use std::sync::Arc;

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};

#[derive(Default)]
pub struct CalculatePriorBoxes;

impl Pass for CalculatePriorBoxes {
    fn name(&self) -> &'static str {
        "calculate_prior_boxes"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::Init
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let prior_boxes: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::PriorBox))
            .collect();

        for pb in prior_boxes {
            let desc = program.node(pb).desc().clone();
            let layout = program.get_output_layout(pb)?;
            let engine = program.engine().clone();
            let payload = engine.evaluate_constant(&desc, &[])?;

            let data_desc = PrimitiveDescriptor::new(
                format!("_prior_box_result_{}", desc.id),
                Vec::new(),
                PrimitiveKind::Data {
                    layout,
                    payload: Arc::new(payload),
                },
            );
            let data_node = program.get_or_create(data_desc);

            // drop the shape-only inputs, then let replace hand the users over
            loop {
                let dep = match program.node(pb).dependencies().first() {
                    Some(&d) => d,
                    None => break,
                };
                program.remove_connection(dep, pb);
                program.remove_if_dangling(dep)?;
            }
            program.replace(pb, data_node)?;
        }
        Ok(())
    }
}
