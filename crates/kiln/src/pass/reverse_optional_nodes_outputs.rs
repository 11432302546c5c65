//! Keeps externally observable state alive: a mutable-data node whose users
//! were all optimized away would otherwise look dangling and lose its
//! buffer, yet the outside world can still read it.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::KindTag;

#[derive(Default)]
pub struct ReverseOptionalNodesOutputs;

impl Pass for ReverseOptionalNodesOutputs {
    fn name(&self) -> &'static str {
        "reverse_optional_nodes_outputs"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let stateful: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| {
                let node = program.node(n);
                matches!(node.kind_tag(), KindTag::MutableData | KindTag::Assign)
                    && node.is_endpoint()
                    && !node.is_output()
            })
            .collect();
        for node in stateful {
            program.node_mut(node).output = true;
            program.outputs.push(node);
        }
        Ok(())
    }
}
