//! Reconciles loop-body id mappings after optimization.
//!
//! A body program is executed by an enclosing loop that addresses nodes by
//! their original topology ids. Optimization renames and removes nodes, so
//! the externally visible mapping is rebuilt here: every optimized-out id is
//! resolved through the survivors chain to a live node.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;

#[derive(Default)]
pub struct UpdateLoopPrimitiveMap;

impl Pass for UpdateLoopPrimitiveMap {
    fn name(&self) -> &'static str {
        "update_loop_primitive_map"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PostOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        if !program.is_body_program() {
            return Ok(());
        }
        let mut map = Vec::new();
        for (removed, survivors) in program.optimized_out() {
            if program.contains_id(removed) {
                continue;
            }
            // first survivor that is still alive wins; fused chains list the
            // final host there
            if let Some(live) = survivors.iter().find(|s| program.contains_id(s)) {
                map.push((removed.clone(), live.clone()));
            }
        }
        program.loop_primitive_map = map;
        Ok(())
    }
}
