//! Recomputes the constant and data-flow flags in topological order.
//!
//! Each marking helper assumes its dependencies are already marked, so the
//! pass as a whole is correct exactly because it walks the processing order.
//! Running it twice changes nothing.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;

#[derive(Default)]
pub struct MarkNodes;

impl Pass for MarkNodes {
    fn name(&self) -> &'static str {
        "mark_nodes"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::Init
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for node in order {
            program.mark_if_constant(node);
            program.mark_if_data_flow(node);
        }
        Ok(())
    }
}
