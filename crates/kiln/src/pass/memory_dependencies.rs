//! Memory-dependency analysis: builds each node's restriction set — the ids
//! whose output buffers must never alias this node's output. The external
//! memory pool consumes these sets when it shares device buffers.

use std::collections::HashMap;

use super::{Pass, PassPhase};
use crate::engine::QueueType;
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::primitive::KindTag;

/// Whether the node owns a pool allocation at all; constants and aliased
/// buffers never compete for pool memory.
fn allocates_from_pool(program: &Program, node: NodeId) -> bool {
    let n = program.node(node);
    n.is_in_data_flow()
        && !n.is_constant()
        && !n.can_be_optimized()
        && !matches!(n.kind_tag(), KindTag::Data | KindTag::MutableData)
}

fn add_mutual_restriction(program: &mut Program, a: NodeId, b: NodeId) {
    let id_a = program.node(a).id().clone();
    let id_b = program.node(b).id().clone();
    program.node_mut(a).add_memory_dependency(id_b);
    program.node_mut(b).add_memory_dependency(id_a);
}

/// Live range per node: defined at its own slot, last read at its last
/// user's slot.
fn live_ranges(program: &Program) -> (Vec<NodeId>, HashMap<NodeId, (usize, usize)>) {
    let order: Vec<NodeId> = program.processing_order().to_vec();
    let index_of: HashMap<NodeId, usize> = order
        .iter()
        .enumerate()
        .map(|(i, &n)| (n, i))
        .collect();
    let mut ranges = HashMap::new();
    for (idx, &node) in order.iter().enumerate() {
        let mut last = idx;
        for &user in program.node(node).users() {
            if let Some(&u_idx) = index_of.get(&user) {
                last = last.max(u_idx);
            }
        }
        ranges.insert(node, (idx, last));
    }
    (order, ranges)
}

/// Classic interval intersection over the processing order.
#[derive(Default)]
pub struct BasicMemoryDependencies;

impl Pass for BasicMemoryDependencies {
    fn name(&self) -> &'static str {
        "basic_memory_dependencies"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PostOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let (order, ranges) = live_ranges(program);
        // sweep: nodes whose range is still open when another starts overlap
        let mut active: Vec<NodeId> = Vec::new();
        for (idx, &node) in order.iter().enumerate() {
            active.retain(|&a| ranges[&a].1 >= idx);
            if !allocates_from_pool(program, node) {
                continue;
            }
            for &other in active.clone().iter() {
                if allocates_from_pool(program, other) {
                    add_mutual_restriction(program, other, node);
                }
            }
            active.push(node);
        }
        Ok(())
    }
}

/// Nodes running in place inherit their producer's buffer, so both sides of
/// the alias must carry the union of the restrictions.
#[derive(Default)]
pub struct SkippedBranchMemoryDependencies;

impl Pass for SkippedBranchMemoryDependencies {
    fn name(&self) -> &'static str {
        "skipped_branch_memory_dependencies"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PostOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for node in order {
            if !program.node(node).can_be_optimized() {
                continue;
            }
            // crop aliases its producer, in-place concat aliases its inputs
            let partners: Vec<NodeId> = match program.node(node).kind_tag() {
                KindTag::Concatenation => program.node(node).dependencies().to_vec(),
                _ => program
                    .node(node)
                    .dependencies()
                    .first()
                    .copied()
                    .into_iter()
                    .collect(),
            };
            for partner in partners {
                let union: Vec<String> = program
                    .node(node)
                    .memory_dependencies()
                    .iter()
                    .chain(program.node(partner).memory_dependencies().iter())
                    .cloned()
                    .collect();
                for id in &union {
                    program.node_mut(node).add_memory_dependency(id.clone());
                    program.node_mut(partner).add_memory_dependency(id.clone());
                }
            }
        }
        Ok(())
    }
}

/// Out-of-order queues may execute any two nodes concurrently unless a
/// dependency path orders them, so unordered pairs must not share memory.
#[derive(Default)]
pub struct OooqMemoryDependencies;

impl Pass for OooqMemoryDependencies {
    fn name(&self) -> &'static str {
        "oooq_memory_dependencies"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PostOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        if program.engine().configuration().queue_type != QueueType::OutOfOrder {
            return Ok(());
        }
        let order: Vec<NodeId> = program.processing_order().to_vec();
        let n = order.len();
        let index_of: HashMap<NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        // reach[i] holds a bitset over order positions reachable from i
        let words = (n + 63) / 64;
        let mut reach = vec![vec![0u64; words]; n];
        for i in (0..n).rev() {
            let users: Vec<usize> = program
                .node(order[i])
                .users()
                .iter()
                .filter_map(|u| index_of.get(u).copied())
                .collect();
            for u in users {
                // u > i always holds in a topological order
                if u <= i {
                    continue;
                }
                reach[i][u / 64] |= 1u64 << (u % 64);
                let (head, tail) = reach.split_at_mut(u);
                let src = &tail[0];
                let dst = &mut head[i];
                for w in 0..words {
                    dst[w] |= src[w];
                }
            }
        }

        let reachable = |reach: &[Vec<u64>], a: usize, b: usize| -> bool {
            reach[a][b / 64] & (1u64 << (b % 64)) != 0
        };
        for i in 0..n {
            if !allocates_from_pool(program, order[i]) {
                continue;
            }
            for j in (i + 1)..n {
                if !allocates_from_pool(program, order[j]) {
                    continue;
                }
                if !reachable(&reach, i, j) && !reachable(&reach, j, i) {
                    add_mutual_restriction(program, order[i], order[j]);
                }
            }
        }
        Ok(())
    }
}
