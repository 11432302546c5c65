//! The fusing engine: absorbs a peer node's operation into a host node's
//! kernel, merging dependency sets and keeping the history bookkeeping other
//! fusions rely on.

use std::collections::HashMap;

use super::node::{FusedPrimitiveDesc, NodeId};
use super::program::Program;
use crate::error::{GraphError, GraphResult};
use crate::primitive::{ActivationFunc, ActivationParams, KindTag, PrimitiveId};
use crate::registry;
use crate::tensor::Padding;

/// For every node id, the peers fused below it with the dependency index the
/// peer occupied in that node's input list.
pub type FusingHistory = HashMap<PrimitiveId, Vec<(PrimitiveId, usize)>>;

impl Program {
    /// Fuses `peer` into `host`. On return the peer is destroyed, its
    /// surviving dependencies are appended to the host, and the host carries
    /// the peer's output layout merged with the worst-case padding.
    pub fn fuse_nodes(
        &mut self,
        host: NodeId,
        peer: NodeId,
        history: &mut FusingHistory,
    ) -> GraphResult<()> {
        let peer_layout = self.get_output_layout(peer)?;
        let peer_id = self.node(peer).id().clone();
        let host_id = self.node(host).id().clone();

        if self.node(peer).fused_activations().len() > 1 {
            return Err(GraphError::FusingRejected {
                node: peer_id,
                reason: "peer carries more than one fused activation".into(),
            });
        }

        let peer_desc = self.node(peer).desc().clone();
        let fuse_params = registry::kind_info(peer_desc.kind_tag())?
            .fuse_params
            .and_then(|accessor| accessor(&peer_desc));
        let input_layout = self.dep_layout(peer, 0)?;
        let (activation, activation_params) = match self.node(peer).fused_activations().first() {
            Some(fused) => (fused.func, fused.params),
            None => (ActivationFunc::None, ActivationParams::default()),
        };

        let host_padding = self.node(host).output_layout_or_dummy().padding;
        let needed_padding = Padding::max(&peer_layout.padding, &host_padding);

        let mut local_desc = FusedPrimitiveDesc {
            desc: peer_desc,
            fuse_params,
            input_layout,
            output_layout: peer_layout.clone(),
            activation,
            activation_params,
            dep_start_idx: self.node(host).dependencies().len(),
            total_num_deps: self.node(peer).dependencies().len(),
            deps: Vec::new(),
            fused_deps: HashMap::new(),
        };
        if let Some(prior) = history.get(&peer_id) {
            for (id, idx) in prior {
                local_desc.fused_deps.insert(id.clone(), *idx);
            }
        }

        // Append the peer's surviving dependencies to the host. Quantize
        // peers running the scale-shift-optimized kernel drop the inputs
        // that kernel never reads; see the drop table below.
        let peer_deps: Vec<NodeId> = self.node(peer).dependencies().to_vec();
        let quantize_opt = if self.node(peer).is_kind(KindTag::Quantize) {
            self.node(peer).quantize_opt().copied()
        } else {
            None
        };
        let mut deps_idx = 0usize;
        for (i, &dep) in peer_deps.iter().enumerate() {
            if dep == host {
                deps_idx += 1;
                continue;
            }
            if let Some(q) = quantize_opt {
                if q.scale_shift_opt && quantize_input_can_be_dropped(&q, i) {
                    continue;
                }
            }
            self.node_mut(host).dependencies.push(dep);
            local_desc
                .deps
                .push((self.node(dep).id().clone(), deps_idx));
            deps_idx += 1;
            self.node_mut(dep).users.push(host);
        }
        local_desc.total_num_deps = local_desc.total_num_deps.min(deps_idx);

        let inherited: Vec<FusedPrimitiveDesc> = self.node(peer).fused_primitives().to_vec();
        let host_node = self.node_mut(host);
        host_node.fused_primitives.push(local_desc);
        host_node.fused_primitives.extend(inherited);

        self.add_optimized_primitive_info(peer_id.clone(), vec![host_id]);

        // Record, for every user of the peer, which input slot the peer
        // occupied; later fusions into those users consult this.
        let peer_users: Vec<NodeId> = self.node(peer).users().to_vec();
        for user in &peer_users {
            let dep_idx = self
                .node(*user)
                .dependencies()
                .iter()
                .position(|&d| d == peer)
                .unwrap_or(0);
            history
                .entry(self.node(*user).id().clone())
                .or_default()
                .push((peer_id.clone(), dep_idx));
        }

        // Detach the peer and hand its user edges to the host.
        loop {
            let dep = match self.node(peer).dependencies().last() {
                Some(&d) => d,
                None => break,
            };
            self.remove_connection(dep, peer);
        }
        self.replace_all_usages(peer, host);

        // The host now produces the peer's result, so it inherits the
        // peer's exposure to the outside.
        if self.node(peer).is_output() {
            self.node_mut(peer).output = false;
            self.outputs.retain(|&o| o != peer);
            if !self.node(host).is_output() {
                self.node_mut(host).output = true;
                self.outputs.push(host);
            }
        }

        {
            let host_node = self.node_mut(host);
            host_node.set_output_layout(peer_layout);
            host_node.merge_output_padding(needed_padding);
        }
        self.invalidate_users_layouts(host);
        self.remove_if_dangling(peer)?;
        Ok(())
    }
}

/// The quantize-peer input drop table. Indices are into the peer's dependency
/// list: 0 data, 1/2 input range, 3/4 output range, 5 input scale, 6 input
/// shift, 7 output scale, 8 output shift. Only consulted when the
/// scale-shift-optimized kernel is active.
pub(crate) fn quantize_input_can_be_dropped(
    q: &super::node::QuantizeOpt,
    input_idx: usize,
) -> bool {
    let out_range_usage = q.per_tensor_output_range && q.output_lo < q.output_hi;
    let mut can_drop = false;
    // input range: covered by the per-tensor output range, or unused when
    // clamping is off
    can_drop |= (input_idx == 1 || input_idx == 2)
        && (out_range_usage || (!out_range_usage && !q.need_clamp));
    // output range: never read by the scale-shift kernel
    can_drop |= input_idx == 3 || input_idx == 4;
    // scales and shifts: dropped when per-tensor or not needed at all
    can_drop |= input_idx == 5 && q.per_tensor_input_scale;
    can_drop |= input_idx == 6 && (!q.need_pre_shift || q.per_tensor_input_shift);
    can_drop |= input_idx == 7 && (!q.need_post_scale || q.per_tensor_output_scale);
    can_drop |= input_idx == 8 && (!q.need_post_shift || q.per_tensor_output_shift);
    can_drop
}

#[cfg(test)]
mod tests {
    use super::quantize_input_can_be_dropped;
    use crate::graph::QuantizeOpt;

    fn base() -> QuantizeOpt {
        QuantizeOpt {
            scale_shift_opt: true,
            need_clamp: true,
            need_pre_shift: true,
            need_post_scale: true,
            need_post_shift: true,
            ..Default::default()
        }
    }

    #[test]
    fn data_input_is_never_dropped() {
        assert!(!quantize_input_can_be_dropped(&base(), 0));
    }

    #[test]
    fn input_range_dropped_under_per_tensor_output_range() {
        let mut q = base();
        q.per_tensor_output_range = true;
        q.output_lo = -1.0;
        q.output_hi = 1.0;
        assert!(quantize_input_can_be_dropped(&q, 1));
        assert!(quantize_input_can_be_dropped(&q, 2));
    }

    #[test]
    fn input_range_kept_when_clamping_without_output_range() {
        let q = base();
        assert!(!quantize_input_can_be_dropped(&q, 1));
        assert!(!quantize_input_can_be_dropped(&q, 2));
    }

    #[test]
    fn input_range_dropped_when_no_clamp() {
        let mut q = base();
        q.need_clamp = false;
        assert!(quantize_input_can_be_dropped(&q, 1));
        assert!(quantize_input_can_be_dropped(&q, 2));
    }

    #[test]
    fn degenerate_output_range_does_not_count_as_usage() {
        // lo >= hi disables the range even with the per-tensor flag set
        let mut q = base();
        q.per_tensor_output_range = true;
        q.output_lo = 1.0;
        q.output_hi = 1.0;
        assert!(!quantize_input_can_be_dropped(&q, 1));
    }

    #[test]
    fn output_range_always_dropped() {
        assert!(quantize_input_can_be_dropped(&base(), 3));
        assert!(quantize_input_can_be_dropped(&base(), 4));
    }

    #[test]
    fn input_scale_dropped_iff_per_tensor() {
        let mut q = base();
        assert!(!quantize_input_can_be_dropped(&q, 5));
        q.per_tensor_input_scale = true;
        assert!(quantize_input_can_be_dropped(&q, 5));
    }

    #[test]
    fn input_shift_dropped_when_per_tensor_or_unneeded() {
        let mut q = base();
        assert!(!quantize_input_can_be_dropped(&q, 6));
        q.per_tensor_input_shift = true;
        assert!(quantize_input_can_be_dropped(&q, 6));
        let mut q = base();
        q.need_pre_shift = false;
        assert!(quantize_input_can_be_dropped(&q, 6));
    }

    #[test]
    fn output_scale_dropped_when_per_tensor_or_unneeded() {
        let mut q = base();
        assert!(!quantize_input_can_be_dropped(&q, 7));
        q.per_tensor_output_scale = true;
        assert!(quantize_input_can_be_dropped(&q, 7));
        let mut q = base();
        q.need_post_scale = false;
        assert!(quantize_input_can_be_dropped(&q, 7));
    }

    #[test]
    fn output_shift_dropped_when_per_tensor_or_unneeded() {
        let mut q = base();
        assert!(!quantize_input_can_be_dropped(&q, 8));
        q.per_tensor_output_shift = true;
        assert!(quantize_input_can_be_dropped(&q, 8));
        let mut q = base();
        q.need_post_shift = false;
        assert!(quantize_input_can_be_dropped(&q, 8));
    }
}
