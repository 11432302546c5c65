//! In-place buffer fusing: concatenations whose inputs can write straight
//! into slices of the concat buffer, and crops that can read a padded view
//! of their producer, stop being copies.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::primitive::{KindTag, PrimitiveKind};
use crate::tensor::{Axis, Padding, TensorDims};

#[derive(Default)]
pub struct PrepareBufferFusing;

impl Pass for PrepareBufferFusing {
    fn name(&self) -> &'static str {
        "prepare_buffer_fusing"
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
            match program.node(node).kind_tag() {
                KindTag::Concatenation => try_concat_in_place(program, node)?,
                KindTag::Crop => try_crop_in_place(program, node)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Marks a feature concatenation in-place and turns each input's output
/// padding into its slice position inside the shared buffer.
fn try_concat_in_place(program: &mut Program, concat: NodeId) -> GraphResult<()> {
    let axis = match &program.node(concat).desc().kind {
        PrimitiveKind::Concatenation { axis } => *axis,
        _ => return Ok(()),
    };
    if axis != Axis::Feature || program.node(concat).has_fused_primitives() {
        return Ok(());
    }

    let deps = program.node(concat).dependencies().to_vec();
    if deps.is_empty() {
        return Ok(());
    }
    let out_layout = program.get_output_layout(concat)?;
    if out_layout.format.is_blocked() {
        return Ok(());
    }
    for (idx, &dep) in deps.iter().enumerate() {
        let layout = program.dep_layout(concat, idx)?;
        let n = program.node(dep);
        if layout.format != out_layout.format
            || n.users().len() != 1
            || n.is_output()
            || n.can_be_optimized()
            || n.is_constant()
        {
            return Ok(());
        }
    }

    program.node_mut(concat).can_be_optimized = true;
    let total = out_layout.size.feature;
    let mut offset = 0i64;
    for (idx, &dep) in deps.iter().enumerate() {
        let feature = program.dep_layout(concat, idx)?.size.feature;
        let slice_padding = Padding::new(
            TensorDims::new(0, offset, [0, 0, 0]),
            TensorDims::new(0, total - offset - feature, [0, 0, 0]),
        );
        program.node_mut(dep).merge_output_padding(slice_padding);
        offset += feature;
    }
    Ok(())
}

/// A crop over the feature axis of a plain buffer is a padded view.
fn try_crop_in_place(program: &mut Program, crop: NodeId) -> GraphResult<()> {
    let (reference, offsets) = match &program.node(crop).desc().kind {
        PrimitiveKind::Crop { reference, offsets } => (*reference, *offsets),
        _ => return Ok(()),
    };
    if program.node(crop).is_output() || program.node(crop).has_fused_primitives() {
        return Ok(());
    }
    if program.node(crop).dependencies().len() != 1 {
        return Ok(());
    }
    let input_layout = program.dep_layout(crop, 0)?;
    if input_layout.format.is_blocked() || !input_layout.padding.is_zero() {
        return Ok(());
    }
    // only feature-axis views keep a contiguous stride pattern
    let spatial_match = reference.spatial == input_layout.size.spatial
        && reference.batch == input_layout.size.batch;
    let offset_is_feature_only =
        offsets.batch == 0 && offsets.spatial == [0, 0, 0];
    if !spatial_match || !offset_is_feature_only {
        return Ok(());
    }
    program.node_mut(crop).can_be_optimized = true;
    Ok(())
}
