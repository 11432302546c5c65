//! Convolution/eltwise stride interplay.
//!
//! When every consumer of an eltwise is a 1x1 convolution with stride > 1,
//! the convolutions sample a strided subset of the eltwise output, so the
//! eltwise may compute only that subset (`eltwise_shrinking`). The reverse
//! rewrite (`eltwise_remove_stride`) folds a leftover stride back into 1x1
//! producer convolutions so the eltwise sees dense inputs again.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::primitive::{KindTag, PrimitiveKind};

#[derive(Default)]
pub struct EltwiseShrinking;

impl Pass for EltwiseShrinking {
    fn name(&self) -> &'static str {
        "eltwise_shrinking"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let eltwises: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::Eltwise))
            .collect();

        for elt in eltwises {
            if program.node(elt).eltwise_stride.is_some() || program.node(elt).users().is_empty() {
                continue;
            }
            let users = program.node(elt).users().to_vec();
            let Some(stride) = common_1x1_conv_stride(program, elt, &users)? else {
                continue;
            };
            if stride == [1, 1, 1] {
                continue;
            }

            // consumers now read a dense buffer
            for &conv in &users {
                if let PrimitiveKind::Convolution(p) = &mut program.node_mut(conv).desc.kind {
                    p.stride = [1, 1, 1];
                }
                program.node_mut(conv).invalidate_output_layout();
            }
            program.node_mut(elt).eltwise_stride = Some(stride);
            program.node_mut(elt).invalidate_output_layout();
            program.invalidate_users_layouts(elt);
        }
        Ok(())
    }
}

/// The shared stride of the users iff every user is a 1x1 convolution and
/// all strides agree.
fn common_1x1_conv_stride(
    program: &mut Program,
    elt: NodeId,
    users: &[NodeId],
) -> GraphResult<Option<[i64; 3]>> {
    let mut stride: Option<[i64; 3]> = None;
    for &user in users {
        let desc = program.node(user).desc().clone();
        let params = match &desc.kind {
            PrimitiveKind::Convolution(p) => p.clone(),
            _ => return Ok(None),
        };
        // the eltwise must feed the data input, not weights
        if program.node(user).dependencies().first() != Some(&elt) {
            return Ok(None);
        }
        let weights = program.dep_layout(user, 1)?;
        if weights.size.spatial[0] != 1 || weights.size.spatial[1] != 1 {
            return Ok(None);
        }
        match stride {
            None => stride = Some(params.stride),
            Some(s) if s == params.stride => {}
            _ => return Ok(None),
        }
    }
    Ok(stride)
}

#[derive(Default)]
pub struct EltwiseRemoveStride;

impl Pass for EltwiseRemoveStride {
    fn name(&self) -> &'static str {
        "eltwise_remove_stride"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let eltwises: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| {
                program.node(n).is_kind(KindTag::Eltwise)
                    && program.node(n).eltwise_stride.is_some()
            })
            .collect();

        for elt in eltwises {
            let stride = match program.node(elt).eltwise_stride {
                Some(s) => s,
                None => continue,
            };
            let deps = program.node(elt).dependencies().to_vec();
            // every producer must be a 1x1 convolution able to absorb the
            // stride; otherwise the eltwise keeps its strided read
            let mut all_absorb = true;
            for &dep in &deps {
                let node = program.node(dep);
                let absorbs = match &node.desc().kind {
                    PrimitiveKind::Convolution(p) => {
                        p.stride == [1, 1, 1] && node.users().len() == 1
                    }
                    _ => false,
                };
                if !absorbs {
                    all_absorb = false;
                    break;
                }
                let weights = program.dep_layout(dep, 1)?;
                if weights.size.spatial[0] != 1 || weights.size.spatial[1] != 1 {
                    all_absorb = false;
                    break;
                }
            }
            if !all_absorb {
                continue;
            }
            for &dep in &deps {
                if let PrimitiveKind::Convolution(p) = &mut program.node_mut(dep).desc.kind {
                    p.stride = stride;
                }
                program.node_mut(dep).invalidate_output_layout();
            }
            program.node_mut(elt).eltwise_stride = None;
            program.node_mut(elt).invalidate_output_layout();
            program.invalidate_users_layouts(elt);
        }
        Ok(())
    }
}
