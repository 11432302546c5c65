//! Fusion-related pre-optimization passes: deconvolution lowering, moving
//! fusable peers through movement ops, and the main peer-into-host fusion
//! sweep.
//!
//! Fusion runs before format selection. The reverse order would be simpler
//! (alignment would be known when judging candidates) but the observed
//! pipeline order is load-bearing for parity, so candidates are judged on
//! logical shapes only.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{FusingHistory, NodeId, Program};
use crate::primitive::{EltwiseOp, KindTag, PrimitiveDescriptor, PrimitiveKind};

/// Lowers unit-stride ungrouped deconvolutions into regular convolutions
/// with mirrored padding; the dense conv kernel zoo is far better tuned.
#[derive(Default)]
pub struct PreReplaceDeconv;

impl Pass for PreReplaceDeconv {
    fn name(&self) -> &'static str {
        "pre_replace_deconv"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let deconvs: Vec<_> = program
            .node_ids()
            .into_iter()
            .filter(|&n| program.node(n).is_kind(KindTag::Deconvolution))
            .collect();

        for deconv in deconvs {
            let desc = program.node(deconv).desc().clone();
            let params = match &desc.kind {
                PrimitiveKind::Deconvolution(p) => p.clone(),
                _ => continue,
            };
            if params.groups != 1 || params.stride != [1, 1, 1] || params.output_size.is_some() {
                continue;
            }
            let weights = program.dep_layout(deconv, 1)?;
            let mut pad = [0i64; 3];
            for axis in 0..3 {
                pad[axis] = weights.size.spatial[axis] - 1 - params.pad[axis];
            }
            let conv_desc = PrimitiveDescriptor::new(
                format!("{}_as_conv", desc.id),
                desc.inputs.clone(),
                PrimitiveKind::Convolution(crate::primitive::ConvolutionParams {
                    stride: [1, 1, 1],
                    pad,
                    ..Default::default()
                }),
            );
            let conv = program.get_or_create(conv_desc);
            program.replace(deconv, conv)?;
            program.node_mut(conv).invalidate_output_layout();
            program.invalidate_users_layouts(conv);
        }
        Ok(())
    }
}

/// Moves activation and quantize peers upward through single-user movement
/// nodes (reorder, reshape, permute) so they sit directly on their eventual
/// fusion host.
#[derive(Default)]
pub struct PreparePrimitiveFusingThrough;

impl Pass for PreparePrimitiveFusingThrough {
    fn name(&self) -> &'static str {
        "prepare_primitive_fusing_through"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let mut changed = true;
        while changed {
            changed = false;
            for peer in program.node_ids() {
                if !program.is_alive(peer) {
                    continue;
                }
                let node = program.node(peer);
                if !matches!(node.kind_tag(), KindTag::Activation | KindTag::Quantize) {
                    continue;
                }
                if node.is_output() || node.dependencies().len() != 1 {
                    continue;
                }
                let movement = node.dependencies()[0];
                let movement_node = program.node(movement);
                if !matches!(
                    movement_node.kind_tag(),
                    KindTag::Reorder | KindTag::Reshape | KindTag::Permute
                ) {
                    continue;
                }
                if movement_node.users().len() != 1 || movement_node.dependencies().is_empty() {
                    continue;
                }
                let producer = movement_node.dependencies()[0];
                if !is_fusion_host(program.node(producer).kind_tag()) {
                    continue;
                }

                if program.extract(peer)? {
                    program.add_intermediate_between(peer, movement, producer, true, false)?;
                    program.node_mut(peer).invalidate_output_layout();
                    program.node_mut(movement).invalidate_output_layout();
                    program.invalidate_users_layouts(peer);
                    changed = true;
                }
            }
        }
        Ok(())
    }
}

/// The main fusion sweep: absorbs activation, eltwise and quantize peers
/// into adjacent hosts via the fusing engine. Rejections are local; the
/// sweep simply moves on to the next candidate.
#[derive(Default)]
pub struct PreparePrimitiveFusing;

impl Pass for PreparePrimitiveFusing {
    fn name(&self) -> &'static str {
        "prepare_primitive_fusing"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let mut history = FusingHistory::new();
        let mut changed = true;
        while changed {
            changed = false;
            let order = program.processing_order().to_vec();
            for peer in order {
                if !program.is_alive(peer) {
                    continue;
                }
                let Some(host) = fusion_candidate(program, peer)? else {
                    continue;
                };
                match program.fuse_nodes(host, peer, &mut history) {
                    Ok(()) => changed = true,
                    Err(err) if err.is_recoverable() => continue,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }
}

fn is_fusion_host(tag: KindTag) -> bool {
    matches!(
        tag,
        KindTag::Convolution
            | KindTag::BinaryConvolution
            | KindTag::Deconvolution
            | KindTag::FullyConnected
            | KindTag::Gemm
            | KindTag::Pooling
            | KindTag::Eltwise
    )
}

/// Judges one peer; returns the host to fuse into, or None.
fn fusion_candidate(program: &mut Program, peer: NodeId) -> GraphResult<Option<NodeId>> {
    let node = program.node(peer);
    let tag = node.kind_tag();
    if !matches!(tag, KindTag::Activation | KindTag::Eltwise | KindTag::Quantize) {
        return Ok(None);
    }
    if node.dependencies().is_empty() {
        return Ok(None);
    }

    if tag == KindTag::Eltwise {
        let op = match &node.desc().kind {
            PrimitiveKind::Eltwise { op } => *op,
            _ => return Ok(None),
        };
        if !matches!(op, EltwiseOp::Add | EltwiseOp::Sub | EltwiseOp::Mul) {
            return Ok(None);
        }
    }
    if tag == KindTag::Quantize {
        match node.quantize_opt() {
            Some(opt) if opt.scale_shift_opt => {}
            _ => return Ok(None),
        }
    }

    let deps = node.dependencies().to_vec();
    for &host in &deps {
        let host_node = program.node(host);
        if !is_fusion_host(host_node.kind_tag()) {
            continue;
        }
        if host_node.is_output() {
            continue;
        }
        if host_node.users().len() != 1 || host_node.users()[0] != peer {
            continue;
        }
        // shapes must match exactly: the host kernel writes the peer's output
        let host_layout = program.get_output_layout(host)?;
        let peer_layout = program.get_output_layout(peer)?;
        if host_layout.size != peer_layout.size {
            continue;
        }
        // the peer's remaining inputs must not depend on the host through
        // another path, otherwise rewiring them onto the host forms a cycle
        let mut creates_cycle = false;
        for &other in program.node(peer).dependencies() {
            if other != host && program.path_exists(host, other) {
                creates_cycle = true;
                break;
            }
        }
        if creates_cycle {
            continue;
        }
        return Ok(Some(host));
    }
    Ok(None)
}
