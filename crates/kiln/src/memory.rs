//! Device-memory usage estimation.
//!
//! Walks the graph the way the real allocator would — biggest outputs first,
//! through a synthetic pool honoring the restriction sets — and adds up what
//! would land on the device. Returns `(-1, -1)` as a sentinel when the
//! projected host allocation exceeds half of the process's virtual-memory
//! limit or the device's global memory; estimation must never take the
//! process down the way a real over-allocation would.

use crate::engine::{AllocationType, DeviceType};
use crate::graph::{NodeId, Program};
use crate::primitive::KindTag;

/// The estimator's sentinel result: limits would be exceeded.
pub const ESTIMATE_ABORTED: (i64, i64) = (-1, -1);

impl Program {
    /// Returns `(constant_bytes, device_bytes_used)`, or
    /// [`ESTIMATE_ABORTED`] when the projection blows past the memory
    /// limits.
    pub fn get_estimated_device_mem_usage(&self) -> (i64, i64) {
        let device_info = self.engine().device_info();
        let max_alloc_size = device_info.max_alloc_mem_size;
        let max_global_mem_size = device_info.max_global_mem_size;
        let cur_vmem = current_vmem_limit();

        let mut nodes_to_allocate: Vec<NodeId> = self.processing_order().to_vec();
        nodes_to_allocate.sort_by(|&lhs, &rhs| {
            let l = self.node(lhs).output_layout_or_dummy().bytes_count();
            let r = self.node(rhs).output_layout_or_dummy().bytes_count();
            r.cmp(&l)
        });

        let mut pool = SyntheticPool::default();
        let mut const_sum = 0i64;
        let mut host_alloc = 0u64;

        for node_id in nodes_to_allocate {
            let node = self.node(node_id);
            let out_size = node.output_layout_or_dummy().bytes_count();
            if out_size > max_alloc_size {
                host_alloc += out_size;
                continue;
            }

            let mut total_host = out_size
                + host_alloc
                + self.engine().used_memory(AllocationType::UsmHost);
            if device_info.device_type == DeviceType::IntegratedGpu {
                total_host += self.engine().used_memory(AllocationType::UsmDevice);
            }
            if (cur_vmem != -1 && total_host as i64 > cur_vmem / 2)
                || total_host >= max_global_mem_size
            {
                return ESTIMATE_ABORTED;
            }

            if node.can_be_optimized() {
                continue;
            }
            let single_generic_consumer = node.is_kind(KindTag::Data)
                && node.users().len() == 1
                && self
                    .node(node.users()[0])
                    .is_kind(KindTag::GenericLayer);
            if single_generic_consumer {
                continue;
            }
            let generic_from_data = node.is_kind(KindTag::GenericLayer)
                && node
                    .dependencies()
                    .first()
                    .map(|&d| self.node(d).is_kind(KindTag::Data))
                    .unwrap_or(false);
            if node.is_kind(KindTag::Data) || generic_from_data {
                const_sum += out_size as i64;
            } else if node
                .users()
                .first()
                .map(|&u| {
                    self.node(u).is_kind(KindTag::Concatenation)
                        && node.users().len() == 1
                        && self.node(u).can_be_optimized()
                })
                .unwrap_or(false)
            {
                // writes straight into the fused concat buffer
                continue;
            } else if node.is_kind(KindTag::MutableData) && node.dependencies().is_empty() {
                continue;
            } else {
                pool.allocate(self, node_id, out_size);
            }
        }

        (const_sum, pool.device_used as i64)
    }
}

/// Minimal stand-in for the runtime memory pool: blocks are reused whenever
/// the restriction sets of the current owners and the new tenant allow it.
#[derive(Default)]
struct SyntheticPool {
    blocks: Vec<Block>,
    device_used: u64,
}

struct Block {
    bytes: u64,
    owners: Vec<NodeId>,
}

impl SyntheticPool {
    fn allocate(&mut self, program: &Program, node: NodeId, bytes: u64) {
        let node_id_str = program.node(node).id().clone();
        let restricted = program.node(node).memory_dependencies();
        for block in self.blocks.iter_mut() {
            if block.bytes < bytes {
                continue;
            }
            let conflict = block.owners.iter().any(|&owner| {
                let owner_node = program.node(owner);
                restricted.contains(owner_node.id())
                    || owner_node.memory_dependencies().contains(&node_id_str)
            });
            if !conflict {
                block.owners.push(node);
                return;
            }
        }
        self.device_used += bytes;
        self.blocks.push(Block {
            bytes,
            owners: vec![node],
        });
    }
}

#[cfg(unix)]
fn current_vmem_limit() -> i64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we hand it
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) };
    if rc == 0 && limit.rlim_cur != libc::RLIM_INFINITY {
        limit.rlim_cur as i64
    } else {
        -1
    }
}

#[cfg(not(unix))]
fn current_vmem_limit() -> i64 {
    -1
}
