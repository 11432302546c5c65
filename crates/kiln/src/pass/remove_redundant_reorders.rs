//! Deletes reorders that do not change the bytes and collapses reorder
//! chains. The pass reaches a fixed point, so running it again is a no-op;
//! the pipeline relies on that and schedules it several times.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::KindTag;

pub struct RemoveRedundantReorders {
    /// Allows collapsing consecutive reorders into one.
    pub enable_reorder_fusing: bool,
    /// Runs in the post-optimize phase (after implementation selection).
    pub post_compile: bool,
    /// Also removes reorders directly in front of network outputs.
    pub remove_output_reorders: bool,
}

impl Pass for RemoveRedundantReorders {
    fn name(&self) -> &'static str {
        "remove_redundant_reorders"
    }

    fn phase(&self) -> PassPhase {
        if self.post_compile {
            PassPhase::PostOptimize
        } else {
            PassPhase::PreOptimize
        }
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let mut changed = true;
        while changed {
            changed = false;
            for reorder in program.node_ids() {
                if !program.is_alive(reorder)
                    || !program.node(reorder).is_kind(KindTag::Reorder)
                {
                    continue;
                }
                let node = program.node(reorder);
                if node.has_fused_primitives() || !node.fused_activations().is_empty() {
                    continue;
                }
                if node.dependencies().len() != 1 {
                    continue;
                }
                if node.is_output() && !self.remove_output_reorders {
                    continue;
                }

                // collapse chains: a single-user reorder feeding this one
                // contributes nothing, the final target wins
                if self.enable_reorder_fusing {
                    let prev = node.dependencies()[0];
                    let prev_node = program.node(prev);
                    if prev_node.is_kind(KindTag::Reorder)
                        && prev_node.users().len() == 1
                        && !prev_node.is_output()
                        && !prev_node.has_fused_primitives()
                    {
                        if program.extract_and_remove(prev)? {
                            program.node_mut(reorder).invalidate_output_layout();
                            program.get_output_layout(reorder)?;
                            changed = true;
                            continue;
                        }
                    }
                }

                let input_layout = program.dep_layout(reorder, 0)?;
                let output_layout = program.get_output_layout(reorder)?;
                if !input_layout.compatible(&output_layout) {
                    continue;
                }
                if program.extract_and_remove(reorder)? {
                    changed = true;
                }
            }
        }
        Ok(())
    }
}
