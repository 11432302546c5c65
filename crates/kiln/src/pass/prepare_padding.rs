//! Computes the input padding sliding-window consumers actually need and
//! plants it on their producers.
//!
//! A convolution with pad != 0 reads outside its input's logical extent;
//! rather than branch in the kernel, the producer's buffer is padded. Plain
//! producers merge the padding into their output layout; graph inputs get an
//! explicit padding reorder because their buffers arrive from outside.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::sliding_window;
use crate::tensor::{Layout, Padding, TensorDims};

pub struct PreparePadding {
    pub output_size_handling_enabled: bool,
}

impl Pass for PreparePadding {
    fn name(&self) -> &'static str {
        "prepare_padding"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for node in order {
            if !program.is_alive(node) {
                continue;
            }
            let desc = program.node(node).desc().clone();
            let (pad, stride, dilation, filter_spatial) = match &desc.kind {
                PrimitiveKind::Convolution(p) | PrimitiveKind::BinaryConvolution(p) => {
                    if !self.output_size_handling_enabled && p.output_size.is_some() {
                        continue;
                    }
                    let weights = program.dep_layout(node, 1)?;
                    (p.pad, p.stride, p.dilation, weights.size.spatial)
                }
                PrimitiveKind::Pooling(p) => {
                    if !self.output_size_handling_enabled && p.output_size.is_some() {
                        continue;
                    }
                    (p.pad, p.stride, [1, 1, 1], p.size)
                }
                _ => continue,
            };
            if pad == [0, 0, 0] {
                continue;
            }

            let input_layout = program.dep_layout(node, 0)?;
            let output_layout = program.get_output_layout(node)?;
            let consumed = sliding_window::consumed_input_range(
                output_layout.size.spatial,
                filter_spatial,
                stride,
                dilation,
            );
            let mut lower = [0i64; 3];
            let mut upper = [0i64; 3];
            for axis in 0..3 {
                lower[axis] = pad[axis].max(0);
                upper[axis] =
                    (consumed[axis] - pad[axis] - input_layout.size.spatial[axis]).max(0);
            }
            let needed = Padding::new(
                TensorDims::new(0, 0, lower),
                TensorDims::new(0, 0, upper),
            );
            if needed.is_zero() {
                continue;
            }
            let prev = program.node(node).dependencies()[0];
            apply_needed_padding(program, node, prev, needed)?;
        }
        Ok(())
    }
}

/// Merges `needed` into the producer's output padding, or fronts a padding
/// reorder when the producer is an external buffer.
fn apply_needed_padding(
    program: &mut Program,
    node: NodeId,
    prev: NodeId,
    needed: Padding,
) -> GraphResult<()> {
    let prev_layout = program.get_output_layout(prev)?;
    if prev_layout.padding == Padding::max(&prev_layout.padding, &needed) {
        return Ok(());
    }

    if matches!(
        program.node(prev).kind_tag(),
        KindTag::InputLayout | KindTag::MutableData
    ) {
        let target = Layout::new(prev_layout.data_type, prev_layout.format, prev_layout.size)
            .with_padding(needed);
        let reorder_desc = PrimitiveDescriptor::new(
            format!("reorder_input_{}", program.node(node).id()),
            vec![program.node(prev).id().clone()],
            PrimitiveKind::Reorder { target },
        );
        let reorder = program.get_or_create(reorder_desc);
        program.add_intermediate_between(reorder, node, prev, true, false)?;
        return Ok(());
    }

    program.node_mut(prev).merge_output_padding(needed);
    Ok(())
}
