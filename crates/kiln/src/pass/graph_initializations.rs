//! First pass of the pipeline: expand split primitives into per-output
//! crops, establish the default output set, and compute the initial
//! processing order.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::Program;
use crate::primitive::{KindTag, PrimitiveKind};
use crate::tensor::{Axis, TensorDims};

#[derive(Default)]
pub struct GraphInitializations;

impl Pass for GraphInitializations {
    fn name(&self) -> &'static str {
        "graph_initializations"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::Init
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        expand_splits(program)?;
        mark_default_outputs(program);
        program.calculate_bfs_processing_order();
        Ok(())
    }
}

/// Replaces every split node by one crop per declared output. The crops were
/// created next to the split when the topology was prepared; here they get
/// their real extents and the split itself is retired.
fn expand_splits(program: &mut Program) -> GraphResult<()> {
    let splits: Vec<_> = program
        .node_ids()
        .into_iter()
        .filter(|&n| program.node(n).is_kind(KindTag::Split))
        .collect();

    for split in splits {
        let desc = program.node(split).desc().clone();
        let (output_ids, output_offsets) = match &desc.kind {
            PrimitiveKind::Split {
                output_ids,
                output_offsets,
            } => (output_ids.clone(), output_offsets.clone()),
            _ => continue,
        };
        let input_layout = program.dep_layout(split, 0)?;
        let split_axis = split_axis_of(&output_offsets);

        let mut crop_ids = Vec::with_capacity(output_ids.len());
        for (i, out_id) in output_ids.iter().enumerate() {
            let crop_id = format!("{}:{}", desc.id, out_id);
            let offset = output_offsets[i];
            let mut reference = input_layout.size;
            let extent = match output_offsets.get(i + 1) {
                Some(next) => next.axis(split_axis) - offset.axis(split_axis),
                None => input_layout.size.axis(split_axis) - offset.axis(split_axis),
            };
            reference.set_axis(split_axis, extent);

            let crop_node = program.get_node_id(&crop_id)?;
            program.node_mut(crop_node).desc.kind = PrimitiveKind::Crop {
                reference,
                offsets: offset,
            };
            crop_ids.push(crop_id);
        }

        program.add_optimized_primitive_info(desc.id.clone(), crop_ids);
        program.remove_all_connections(split);
        program.remove_if_dangling(split)?;
    }
    Ok(())
}

/// The axis along which the split offsets advance; feature when the offsets
/// are all zero (single-output degenerate split).
fn split_axis_of(offsets: &[TensorDims]) -> Axis {
    for axis in [Axis::Feature, Axis::Batch, Axis::Y, Axis::X, Axis::Z] {
        if offsets.iter().any(|o| o.axis(axis) != 0) {
            return axis;
        }
    }
    Axis::Feature
}

/// Every endpoint is exposed to the outside unless the front end said
/// otherwise.
fn mark_default_outputs(program: &mut Program) {
    if !program.outputs().is_empty() {
        return;
    }
    let endpoints: Vec<_> = program
        .node_ids()
        .into_iter()
        .filter(|&n| program.node(n).is_endpoint())
        .collect();
    for node in endpoints {
        program.node_mut(node).output = true;
        program.outputs.push(node);
    }
}
