//! Reorders bias inputs of convolution and fully-connected nodes into the
//! plain format their kernels read, ahead of compilation.

use super::reorder_inputs::ReorderFactory;
use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::KindTag;
use crate::tensor::{Format, Layout};

const BIAS_INPUT_IDX: usize = 2;

pub struct PreOptimizeBias<'a> {
    pub rf: &'a mut ReorderFactory,
}

impl Pass for PreOptimizeBias<'_> {
    fn name(&self) -> &'static str {
        "pre_optimize_bias"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let hosts: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| {
                matches!(
                    program.node(n).kind_tag(),
                    KindTag::Convolution | KindTag::FullyConnected | KindTag::Deconvolution
                )
            })
            .collect();

        for host in hosts {
            if program.node(host).dependencies().len() <= BIAS_INPUT_IDX {
                continue;
            }
            let bias_layout = program.dep_layout(host, BIAS_INPUT_IDX)?;
            if bias_layout.format == Format::Bfyx && bias_layout.padding.is_zero() {
                continue;
            }
            let target = Layout::new(bias_layout.data_type, Format::Bfyx, bias_layout.size);
            let reorder = self
                .rf
                .insert_reorder(program, host, BIAS_INPUT_IDX, target)?;
            program.mark_if_constant(reorder);
            program.node_mut(host).invalidate_output_layout();
            program.get_output_layout(host)?;
        }
        Ok(())
    }
}
