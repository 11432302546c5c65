//! Converts unit-stride strided-slice nodes into crops, which downstream
//! passes can fold into padding or run in place.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::TensorDims;

#[derive(Default)]
pub struct StridedSliceOptimize;

impl Pass for StridedSliceOptimize {
    fn name(&self) -> &'static str {
        "strided_slice_optimize"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let slices: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::StridedSlice))
            .collect();

        for slice in slices {
            let desc = program.node(slice).desc().clone();
            let params = match &desc.kind {
                PrimitiveKind::StridedSlice(p) => p.clone(),
                _ => continue,
            };
            if params.strides != TensorDims::ones() {
                continue;
            }
            let reference = TensorDims::new(
                params.end.batch - params.begin.batch,
                params.end.feature - params.begin.feature,
                [
                    params.end.spatial[0] - params.begin.spatial[0],
                    params.end.spatial[1] - params.begin.spatial[1],
                    params.end.spatial[2] - params.begin.spatial[2],
                ],
            );
            let crop_desc = PrimitiveDescriptor::new(
                format!("{}_as_crop", desc.id),
                desc.inputs.clone(),
                PrimitiveKind::Crop {
                    reference,
                    offsets: params.begin,
                },
            );
            let crop = program.get_or_create(crop_desc);
            program.replace(slice, crop)?;
        }
        Ok(())
    }
}
