//! Materializes asymmetric convolution input padding as explicit border
//! nodes. Symmetric padding stays inside the convolution descriptor; only
//! when the above/below amounts differ does the kernel need a real border
//! buffer in front of it.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::TensorDims;

#[derive(Default)]
pub struct HandleInputPadding;

impl Pass for HandleInputPadding {
    fn name(&self) -> &'static str {
        "handle_input_padding"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let convs: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| {
                matches!(
                    &program.node(n).desc().kind,
                    PrimitiveKind::Convolution(_) | PrimitiveKind::BinaryConvolution(_)
                )
            })
            .collect();

        for conv in convs {
            let desc = program.node(conv).desc().clone();
            let params = match &desc.kind {
                PrimitiveKind::Convolution(p) | PrimitiveKind::BinaryConvolution(p) => p.clone(),
                _ => continue,
            };
            let (Some(above), Some(below)) = (params.pad_above, params.pad_below) else {
                continue;
            };
            if above == below {
                continue;
            }

            let border_desc = PrimitiveDescriptor::new(
                format!("{}_input_padding", desc.id),
                vec![desc.inputs[0].clone()],
                PrimitiveKind::Border {
                    pad_lower: TensorDims::new(0, 0, below),
                    pad_upper: TensorDims::new(0, 0, above),
                },
            );
            let border = program.get_or_create(border_desc);
            program.add_intermediate(border, conv, 0, true, false)?;

            // padding is now carried by the border node
            let node = program.node_mut(conv);
            if let PrimitiveKind::Convolution(p) | PrimitiveKind::BinaryConvolution(p) =
                &mut node.desc.kind
            {
                p.pad = [0, 0, 0];
                p.pad_above = None;
                p.pad_below = None;
            }
            node.invalidate_output_layout();
            program.invalidate_users_layouts(conv);
        }
        Ok(())
    }
}
