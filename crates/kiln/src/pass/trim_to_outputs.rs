//! Prunes every node that cannot reach an output: reverse BFS from the
//! output set, then bulk-remove the unmarked remainder.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;

#[derive(Default)]
pub struct TrimToOutputs;

impl Pass for TrimToOutputs {
    fn name(&self) -> &'static str {
        "trim_to_outputs"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        for node in program.node_ids() {
            program.node_mut(node).user_mark = false;
        }

        let mut stack: Vec<_> = program.outputs().to_vec();
        while let Some(node) = stack.pop() {
            if program.node(node).user_mark {
                continue;
            }
            program.node_mut(node).user_mark = true;
            stack.extend(program.node(node).dependencies().iter().copied());
        }

        let to_remove: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| !program.node(n).user_mark)
            .collect();
        program.remove_nodes(to_remove);
        Ok(())
    }
}
