//! Post-compilation fixups driven by the selected implementations: input
//! reorders for fully-connected kernels and weight reorders into the format
//! each implementation asked for.

use super::compile_graph::select_impl_for;
use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::{Format, Layout};

/// Fully-connected kernels flatten their input; a blocked input would be
/// read with the wrong strides, so it is reordered to plain after selection
/// and the implementation is chosen again.
#[derive(Default)]
pub struct PostInputReorder;

impl Pass for PostInputReorder {
    fn name(&self) -> &'static str {
        "post_input_reorder"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PostOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let fcs: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::FullyConnected))
            .collect();

        for fc in fcs {
            if program.node(fc).dependencies().is_empty() {
                continue;
            }
            let input_layout = program.dep_layout(fc, 0)?;
            if !input_layout.format.is_blocked() {
                continue;
            }
            let src_id = {
                let dep = program.node(fc).dependencies()[0];
                program.node(dep).id().clone()
            };
            let reorder_desc = PrimitiveDescriptor::new(
                format!("{}_input_reorder", program.node(fc).id()),
                vec![src_id],
                PrimitiveKind::Reorder {
                    target: Layout::new(input_layout.data_type, Format::Bfyx, input_layout.size),
                },
            );
            let reorder = program.get_or_create(reorder_desc);
            program.add_intermediate(reorder, fc, 0, true, false)?;
            program.node_mut(fc).invalidate_output_layout();
            program.get_output_layout(fc)?;

            let reorder_impl = select_impl_for(program, reorder)?;
            program.kernel_names.push(reorder_impl.kernel_name.clone());
            program.node_mut(reorder).selected_impl = Some(reorder_impl);
            let fc_impl = select_impl_for(program, fc)?;
            program.node_mut(fc).selected_impl = Some(fc_impl);
        }
        Ok(())
    }
}

/// Inserts a generic-layer node on the weights edge wherever the selected
/// implementation declared a weights-reorder requirement. The new node is
/// constant, so a later constant-propagation run folds the conversion into
/// the stored weights.
#[derive(Default)]
pub struct PostOptimizeWeights;

const WEIGHTS_INPUT_IDX: usize = 1;

impl Pass for PostOptimizeWeights {
    fn name(&self) -> &'static str {
        "post_optimize_weights"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PostOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let hosts: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| {
                matches!(
                    program.node(n).kind_tag(),
                    KindTag::Convolution
                        | KindTag::BinaryConvolution
                        | KindTag::Deconvolution
                        | KindTag::FullyConnected
                )
            })
            .collect();

        for host in hosts {
            let target = match program
                .node(host)
                .selected_impl()
                .and_then(|i| i.weights_reorder.clone())
            {
                Some(t) => t,
                None => continue,
            };
            if program.node(host).dependencies().len() <= WEIGHTS_INPUT_IDX {
                continue;
            }
            let current = program.dep_layout(host, WEIGHTS_INPUT_IDX)?;
            if current.identical(&target) {
                continue;
            }
            let src_id = {
                let dep = program.node(host).dependencies()[WEIGHTS_INPUT_IDX];
                program.node(dep).id().clone()
            };
            let generic_desc = PrimitiveDescriptor::new(
                format!("{}_weights_reorder", program.node(host).id()),
                vec![src_id],
                PrimitiveKind::GenericLayer { target },
            );
            let generic = program.get_or_create(generic_desc);
            program.add_intermediate(generic, host, WEIGHTS_INPUT_IDX, true, false)?;
            program.mark_if_constant(generic);

            let generic_impl = select_impl_for(program, generic)?;
            program.kernel_names.push(generic_impl.kernel_name.clone());
            program.node_mut(generic).selected_impl = Some(generic_impl);
        }
        Ok(())
    }
}
