//! Fixes the input order of feature concatenations for blocked layouts.
//!
//! Runs immediately after reorder insertion as a known workaround: blocked
//! concat kernels want block-aligned inputs first, and swapping inputs is
//! only legal when the single consumer is a convolution whose weights are
//! compile-time data, because the weights' input channels must be permuted
//! to match.

use std::sync::Arc;

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::primitive::{KindTag, PrimitiveKind};
use crate::tensor::Axis;

const FEATURE_BLOCK: i64 = 16;

#[derive(Default)]
pub struct ConcatInputOrder;

impl Pass for ConcatInputOrder {
    fn name(&self) -> &'static str {
        "concat_input_order"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let concats: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| {
                matches!(
                    &program.node(n).desc().kind,
                    PrimitiveKind::Concatenation { axis: Axis::Feature }
                )
            })
            .collect();

        for concat in concats {
            if let Some((order, features)) = reorderable(program, concat)? {
                apply_input_order(program, concat, &order, &features)?;
            }
        }
        Ok(())
    }
}

/// Decides whether swapping is legal and profitable; returns the new input
/// permutation and the per-input feature counts.
fn reorderable(
    program: &mut Program,
    concat: NodeId,
) -> GraphResult<Option<(Vec<usize>, Vec<i64>)>> {
    let deps = program.node(concat).dependencies().to_vec();
    if deps.len() < 2 {
        return Ok(None);
    }
    // single convolution consumer with data weights
    let users = program.node(concat).users().to_vec();
    if users.len() != 1 {
        return Ok(None);
    }
    let conv = users[0];
    if !program.node(conv).is_kind(KindTag::Convolution) {
        return Ok(None);
    }
    let weights = match program.node(conv).dependencies().get(1) {
        Some(&w) => w,
        None => return Ok(None),
    };
    if !program.node(weights).is_kind(KindTag::Data) {
        return Ok(None);
    }

    let mut features = Vec::with_capacity(deps.len());
    for idx in 0..deps.len() {
        features.push(program.dep_layout(concat, idx)?.size.feature);
    }
    let aligned = |f: i64| f % FEATURE_BLOCK == 0;
    if features.iter().all(|&f| aligned(f)) {
        return Ok(None);
    }
    // stable partition: aligned inputs first
    let mut order: Vec<usize> = (0..deps.len()).collect();
    order.sort_by_key(|&i| !aligned(features[i]));
    if order.iter().enumerate().all(|(pos, &i)| pos == i) {
        return Ok(None);
    }
    Ok(Some((order, features)))
}

fn apply_input_order(
    program: &mut Program,
    concat: NodeId,
    order: &[usize],
    features: &[i64],
) -> GraphResult<()> {
    // permute the concat's dependency and declared-input lists together
    {
        let node = program.node_mut(concat);
        let old_deps = node.dependencies.clone();
        node.dependencies = order.iter().map(|&i| old_deps[i]).collect();
        if node.desc.inputs.len() == old_deps.len() {
            let old_inputs = node.desc.inputs.clone();
            node.desc.inputs = order.iter().map(|&i| old_inputs[i].clone()).collect();
        }
    }

    // permute the consumer's weight input channels the same way
    let conv = program.node(concat).users()[0];
    let weights = program.node(conv).dependencies()[1];
    let (layout, payload) = match &program.node(weights).desc().kind {
        PrimitiveKind::Data { layout, payload } => (layout.clone(), payload.clone()),
        _ => return Ok(()),
    };
    let elem = layout.data_type.size_in_bytes();
    let ofm = layout.size.batch.max(1) as usize;
    let spatial =
        (layout.size.spatial[0] * layout.size.spatial[1] * layout.size.spatial[2]).max(1) as usize;
    let ifm_total: i64 = features.iter().sum();
    if (ofm as i64 * ifm_total * spatial as i64 * elem as i64) as usize != payload.len() {
        return Ok(());
    }

    let mut offsets = Vec::with_capacity(features.len());
    let mut acc = 0i64;
    for &f in features {
        offsets.push(acc);
        acc += f;
    }
    let row = ifm_total as usize * spatial * elem;
    let mut permuted = vec![0u8; payload.len()];
    for o in 0..ofm {
        let mut dst = o * row;
        for &i in order {
            let start = o * row + offsets[i] as usize * spatial * elem;
            let len = features[i] as usize * spatial * elem;
            permuted[dst..dst + len].copy_from_slice(&payload[start..start + len]);
            dst += len;
        }
    }
    if let PrimitiveKind::Data { payload, .. } = &mut program.node_mut(weights).desc.kind {
        *payload = Arc::new(permuted);
    }
    Ok(())
}
