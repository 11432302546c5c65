//! The program: sole owner of all live nodes, plus every structural edit
//! primitive the optimization passes are allowed to use.
//!
//! Edges are arena indices, so dependency/user back-references stay plain
//! data and edge symmetry reduces to keeping two index lists in step. Every
//! public mutation leaves edge symmetry and the id-map consistent at its
//! return point.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;

use super::node::{Node, NodeId};
use super::processing_order::NodesOrdering;
use crate::engine::{Engine, SelectedImpl, Stream, TuningCache};
use crate::error::{GraphError, GraphResult};
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveId, PrimitiveKind};
use crate::registry;
use crate::tensor::{DType, Layout};

const IMPLS_CACHE_CAPACITY: usize = 300;
const IN_MEM_KERNELS_CACHE_CAPACITY: usize = 100;

static PROGRAM_ID_GEN: AtomicU32 = AtomicU32::new(0);

/// Per-node record exposed through the primitives-info query and the `.info`
/// dump.
#[derive(Debug, Clone, Serialize)]
pub struct PrimitiveInfo {
    pub id: PrimitiveId,
    pub type_str: String,
    pub dependencies: Vec<PrimitiveId>,
    pub users: Vec<PrimitiveId>,
    pub fused: Vec<PrimitiveId>,
    pub output_layout: Layout,
    pub format: String,
    pub impl_name: String,
    pub precision: String,
    pub is_cpu: bool,
    pub exec_id: usize,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").field("prog_id", &self.prog_id).finish_non_exhaustive()
    }
}

pub struct Program {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) options: crate::options::BuildOptions,
    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) ids: HashMap<PrimitiveId, NodeId>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
    pub(crate) processing_order: NodesOrdering,
    /// Every removed id mapped to the surviving ids that subsume it.
    pub(crate) optimized_out: Vec<(PrimitiveId, Vec<PrimitiveId>)>,
    pub(crate) optimizer_passes_info: Vec<(String, Vec<PrimitiveInfo>)>,
    pub(crate) prim_info: Vec<PrimitiveInfo>,
    pub(crate) impls_cache: LruCache<String, SelectedImpl>,
    pub(crate) in_mem_kernels_cache: LruCache<String, u64>,
    pub(crate) kernel_names: Vec<String>,
    pub(crate) kernels_built: bool,
    pub(crate) tuning_cache: Option<TuningCache>,
    pub(crate) prog_id: u32,
    pub(crate) is_body_program: bool,
    pub(crate) output_size_handling_enabled: bool,
    /// For body programs: optimized-out topology ids resolved to the live
    /// nodes the enclosing loop should address instead.
    pub(crate) loop_primitive_map: Vec<(PrimitiveId, PrimitiveId)>,
}

impl Program {
    pub(crate) fn new_empty(
        engine: Arc<dyn Engine>,
        options: crate::options::BuildOptions,
        is_body_program: bool,
    ) -> GraphResult<Self> {
        let mut options = options;
        if !options.force_implementations.is_empty() {
            options.optimize_data = true;
        }
        if options.tuning_config.mode.requires_profiling()
            && !engine.configuration().enable_profiling
        {
            return Err(GraphError::Configuration(
                "engine must be created with profiling enabled in tune_and_cache mode".into(),
            ));
        }
        let prog_id = PROGRAM_ID_GEN.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = engine.create_stream();
        Ok(Self {
            engine,
            stream,
            options,
            nodes: Vec::new(),
            ids: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            processing_order: NodesOrdering::new(),
            optimized_out: Vec::new(),
            optimizer_passes_info: Vec::new(),
            prim_info: Vec::new(),
            impls_cache: LruCache::new(NonZeroUsize::new(IMPLS_CACHE_CAPACITY).unwrap()),
            in_mem_kernels_cache: LruCache::new(
                NonZeroUsize::new(IN_MEM_KERNELS_CACHE_CAPACITY).unwrap(),
            ),
            kernel_names: Vec::new(),
            kernels_built: false,
            tuning_cache: None,
            prog_id,
            is_body_program,
            output_size_handling_enabled: false,
            loop_primitive_map: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.prog_id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn options(&self) -> &crate::options::BuildOptions {
        &self.options
    }

    pub fn is_debug_build(&self) -> bool {
        self.options.debug
    }

    /// Whether the kernel batch has been compiled by the engine.
    pub fn kernels_built(&self) -> bool {
        self.kernels_built
    }

    pub fn is_body_program(&self) -> bool {
        self.is_body_program
    }

    // ---- node access --------------------------------------------------

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.index()]
            .as_ref()
            .expect("stale node id used after removal")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.index()]
            .as_mut()
            .expect("stale node id used after removal")
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn get_node_id(&self, id: &str) -> GraphResult<NodeId> {
        self.ids
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownId(id.to_string()))
    }

    pub fn get_node(&self, id: &str) -> GraphResult<&Node> {
        Ok(self.node(self.get_node_id(id)?))
    }

    pub fn get_node_mut(&mut self, id: &str) -> GraphResult<&mut Node> {
        let node = self.get_node_id(id)?;
        Ok(self.node_mut(node))
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    /// All live node handles in arena (creation) order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(|id| self.nodes[id.index()].is_some())
            .collect()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn processing_order(&self) -> &NodesOrdering {
        &self.processing_order
    }

    // ---- structural operations ---------------------------------------

    /// Returns the node for the descriptor's id, creating it if absent.
    /// Idempotent by id; an existing node wins over the new descriptor.
    pub fn get_or_create(&mut self, desc: PrimitiveDescriptor) -> NodeId {
        if let Some(&existing) = self.ids.get(&desc.id) {
            return existing;
        }
        let id = NodeId(self.nodes.len() as u32);
        let mut node = Node::new(desc);
        if node.is_kind(KindTag::Data) {
            node.constant = true;
        }
        self.ids.insert(node.desc.id.clone(), id);
        self.nodes.push(Some(node));
        id
    }

    /// Appends the edge `prev -> next`. Must not create a cycle.
    pub fn add_connection(&mut self, prev: NodeId, next: NodeId) {
        debug_assert!(
            !self.path_exists(next, prev),
            "edge {} -> {} would create a cycle",
            self.node(prev).id(),
            self.node(next).id()
        );
        self.node_mut(prev).users.push(next);
        self.node_mut(next).dependencies.push(prev);
    }

    /// Removes one instance of the edge `prev -> next` from both sides.
    pub fn remove_connection(&mut self, prev: NodeId, next: NodeId) {
        let users = &mut self.node_mut(prev).users;
        if let Some(pos) = users.iter().position(|&u| u == next) {
            users.remove(pos);
        }
        let deps = &mut self.node_mut(next).dependencies;
        if let Some(pos) = deps.iter().position(|&d| d == prev) {
            deps.remove(pos);
        }
    }

    /// Disconnects the node from all neighbors; the node stays in the id-map.
    pub fn remove_all_connections(&mut self, node: NodeId) {
        let users: Vec<NodeId> = self.node(node).users.to_vec();
        for user in users {
            self.node_mut(user).dependencies.retain(|&d| d != node);
        }
        let deps: Vec<NodeId> = self.node(node).dependencies.clone();
        for dep in deps {
            self.node_mut(dep).users.retain(|u| *u != node);
        }
        let n = self.node_mut(node);
        n.dependencies.clear();
        n.users.clear();
    }

    pub fn rename(&mut self, node: NodeId, new_id: &str) -> GraphResult<()> {
        if self.ids.contains_key(new_id) {
            return Err(GraphError::invariant(format!(
                "cannot rename {}: node with id {} already exists",
                self.node(node).id(),
                new_id
            )));
        }
        if self.node(node).is_output() {
            return Err(GraphError::invariant(format!(
                "cannot rename output node {}; clear the output flag first",
                self.node(node).id()
            )));
        }
        let old_id = self.node(node).id().clone();
        self.ids.remove(&old_id);
        self.ids.insert(new_id.to_string(), node);
        self.node_mut(node).desc.id = new_id.to_string();
        Ok(())
    }

    /// Atomically exchanges the ids of two nodes; edges are unchanged.
    pub fn swap_names(&mut self, a: NodeId, b: NodeId) {
        let id_a = self.node(a).id().clone();
        let id_b = self.node(b).id().clone();
        self.ids.insert(id_a.clone(), b);
        self.ids.insert(id_b.clone(), a);
        self.node_mut(a).desc.id = id_b;
        self.node_mut(b).desc.id = id_a;
    }

    /// Rewrites every edge `old -> u` into `new -> u`; `old` becomes userless.
    pub fn replace_all_usages(&mut self, old: NodeId, new: NodeId) {
        let users: Vec<NodeId> = self.node(old).users.to_vec();
        for user in users {
            let deps = &mut self.node_mut(user).dependencies;
            let mut replaced = 0usize;
            for slot in deps.iter_mut() {
                if *slot == old {
                    *slot = new;
                    replaced += 1;
                }
            }
            for _ in 0..replaced {
                self.node_mut(new).users.push(user);
            }
        }
        self.node_mut(old).users.clear();
    }

    /// Replaces `old` with the detached node `new`: `new` takes over `old`'s
    /// edges, layout, flags, id and processing-order slot; `old` is removed.
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> GraphResult<()> {
        {
            let new_node = self.node(new);
            if !new_node.dependencies.is_empty() || !new_node.users.is_empty() {
                return Err(GraphError::invariant(format!(
                    "replacement node {} must be detached",
                    new_node.id()
                )));
            }
            if new_node.is_output() {
                return Err(GraphError::invariant(format!(
                    "replacement node {} must not be marked as an output",
                    new_node.id()
                )));
            }
        }

        let old_id = self.node(old).id().clone();

        // layout and flags
        {
            let (layout, valid, constant, data_flow, user_mark) = {
                let o = self.node(old);
                (
                    o.layout.clone(),
                    o.valid_output_layout,
                    o.constant,
                    o.data_flow,
                    o.user_mark,
                )
            };
            let n = self.node_mut(new);
            n.layout = layout;
            n.valid_output_layout = valid;
            n.constant = constant;
            n.data_flow = data_flow;
            n.user_mark = user_mark;
        }

        // take over dependencies in order
        loop {
            let dep = match self.node(old).dependencies.first() {
                Some(&d) => d,
                None => break,
            };
            self.add_connection(dep, new);
            self.remove_connection(dep, old);
        }

        // take over users
        let users: Vec<NodeId> = self.node(old).users.to_vec();
        for user in &users {
            self.node_mut(new).users.push(*user);
            for slot in self.node_mut(*user).dependencies.iter_mut() {
                if *slot == old {
                    *slot = new;
                    break;
                }
            }
        }
        self.node_mut(old).users.clear();

        let old_was_output = self.node(old).is_output();
        if old_was_output {
            self.node_mut(old).output = false;
            self.outputs.retain(|&o| o != old);
        }
        if self.node(new).is_input() {
            self.inputs.push(new);
        }
        if let Some(pos) = self.inputs.iter().position(|&i| i == old) {
            self.inputs.remove(pos);
        }

        if self.processing_order.contains(old) {
            self.processing_order.insert(old, new);
            self.processing_order.erase(old);
        }

        self.ids.remove(&old_id);
        self.nodes[old.index()] = None;
        self.rename(new, &old_id)?;

        if old_was_output {
            self.node_mut(new).output = true;
            self.outputs.push(new);
        }
        Ok(())
    }

    /// Destroys the node iff it has no dependencies, no users, and is not an
    /// output (unless this is a debug build). Returns whether it was removed
    /// and records the id in the optimized-out log.
    pub fn remove_if_dangling(&mut self, node: NodeId) -> GraphResult<bool> {
        {
            let n = self.node(node);
            if !n.users.is_empty() || !n.dependencies.is_empty() {
                return Ok(false);
            }
            if n.is_output() && !self.is_debug_build() {
                return Ok(false);
            }
        }
        let id = self.node(node).id().clone();
        self.inputs.retain(|&i| i != node);
        self.outputs.retain(|&o| o != node);
        self.processing_order.erase(node);
        if !self.optimized_out.iter().any(|(i, _)| i == &id) {
            self.optimized_out.push((id.clone(), Vec::new()));
        }
        self.ids.remove(&id);
        self.nodes[node.index()] = None;
        Ok(true)
    }

    /// Bypasses a single-dependency node: its predecessor takes over its user
    /// edges and the node leaves the processing order. Output-ness migrates to
    /// the predecessor via a rename swap.
    pub fn extract(&mut self, node: NodeId) -> GraphResult<bool> {
        if self.node(node).dependencies.len() != 1 {
            return Ok(false);
        }

        if self.node(node).is_output() && !self.is_debug_build() {
            let prev = self.node(node).dependencies[0];
            let node_id = self.node(node).id().clone();

            self.node_mut(node).output = false;
            self.outputs.retain(|&o| o != node);

            let tmp_id = format!("_kiln_tmp_{node_id}");
            self.rename(node, &tmp_id)?;
            self.rename(prev, &node_id)?;

            self.node_mut(prev).output = true;
            self.outputs.push(prev);
        }

        let input = self.node(node).dependencies[0];
        self.node_mut(input).users.retain(|u| *u != node);
        self.node_mut(node).dependencies.clear();

        if !self.node(node).is_endpoint() {
            self.replace_all_usages(node, input);
        }
        self.processing_order.erase(node);
        Ok(true)
    }

    pub fn extract_and_remove(&mut self, node: NodeId) -> GraphResult<bool> {
        if self.extract(node)? {
            return self.remove_if_dangling(node);
        }
        Ok(false)
    }

    /// Moves a single-dependency node onto the edge `new_prev -> new_next`.
    pub fn move_node(
        &mut self,
        node: NodeId,
        new_prev: NodeId,
        new_next: NodeId,
    ) -> GraphResult<bool> {
        if self.extract(node)? {
            self.add_intermediate_between(node, new_next, new_prev, true, false)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Replaces the edge `dep -> user` with `user -> dep`.
    pub fn reverse_connection(&mut self, dep: NodeId, user: NodeId) -> GraphResult<()> {
        if !self.node(dep).users.contains(&user) {
            return Err(GraphError::invariant(format!(
                "cannot reverse connection: {} and {} are not connected this way",
                self.node(dep).id(),
                self.node(user).id()
            )));
        }
        self.remove_connection(dep, user);
        self.add_connection(user, dep);
        Ok(())
    }

    /// Inserts `node` on the edge into `next` at dependency index `prev_idx`.
    ///
    /// With `connect_old` the intermediate also depends on the previous
    /// dependency (the usual reorder-insertion shape). With `move_users`
    /// every other user of the previous dependency is rewired through the
    /// intermediate, and constant/data-flow flags are refreshed on both ends.
    pub fn add_intermediate(
        &mut self,
        node: NodeId,
        next: NodeId,
        prev_idx: usize,
        connect_old: bool,
        move_users: bool,
    ) -> GraphResult<()> {
        if connect_old && !self.node(node).dependencies.is_empty() {
            return Err(GraphError::invariant(format!(
                "intermediate node {} must not have existing dependencies",
                self.node(node).id()
            )));
        }
        let prev = *self.node(next).dependencies.get(prev_idx).ok_or_else(|| {
            GraphError::invariant(format!(
                "{} has no dependency at index {}",
                self.node(next).id(),
                prev_idx
            ))
        })?;

        // connect first and only then retarget the edge, so `prev` can never
        // become dangling halfway through
        if connect_old {
            self.add_connection(prev, node);
            if !self.processing_order.is_empty() {
                self.processing_order.insert_next(prev, node);
            }
        }

        if move_users {
            let users: Vec<NodeId> = self.node(prev).users.to_vec();
            for user in users {
                if user == node {
                    continue;
                }
                let deps = &mut self.node_mut(user).dependencies;
                let mut replaced = 0usize;
                for slot in deps.iter_mut() {
                    if *slot == prev {
                        *slot = node;
                        replaced += 1;
                    }
                }
                for _ in 0..replaced {
                    self.node_mut(node).users.push(user);
                }
                self.node_mut(prev).users.retain(|u| *u != user);
            }
            self.mark_if_constant(prev);
            self.mark_if_constant(node);
            self.mark_if_data_flow(prev);
            self.mark_if_data_flow(node);
        } else {
            self.node_mut(next).dependencies[prev_idx] = node;
            let users = &mut self.node_mut(prev).users;
            if let Some(pos) = users.iter().position(|&u| u == next) {
                users.remove(pos);
            }
            self.node_mut(node).users.push(next);
            let (constant, data_flow) = {
                let p = self.node(prev);
                (p.constant, p.data_flow)
            };
            let n = self.node_mut(node);
            n.constant = constant;
            n.data_flow = data_flow;
        }
        Ok(())
    }

    /// [`Self::add_intermediate`] addressed by the previous node instead of
    /// its dependency index.
    pub fn add_intermediate_between(
        &mut self,
        node: NodeId,
        next: NodeId,
        prev: NodeId,
        connect_old: bool,
        move_users: bool,
    ) -> GraphResult<()> {
        let idx = self
            .node(next)
            .dependencies
            .iter()
            .position(|&d| d == prev)
            .ok_or_else(|| {
                GraphError::invariant(format!(
                    "cannot insert between {} and {}: not connected this way",
                    self.node(next).id(),
                    self.node(prev).id()
                ))
            })?;
        self.add_intermediate(node, next, idx, connect_old, move_users)
    }

    /// Bulk removal used by trimming passes; every removed id lands in the
    /// optimized-out log.
    pub fn remove_nodes(&mut self, to_remove: Vec<NodeId>) {
        for node in to_remove {
            self.remove_all_connections(node);
            let id = self.node(node).id().clone();
            self.inputs.retain(|&i| i != node);
            self.outputs.retain(|&o| o != node);
            self.processing_order.erase(node);
            if !self.optimized_out.iter().any(|(i, _)| i == &id) {
                self.optimized_out.push((id.clone(), Vec::new()));
            }
            self.ids.remove(&id);
            self.nodes[node.index()] = None;
        }
    }

    /// Records that `optimized_id` was subsumed by `replaced_with`, splicing
    /// the new survivors into any older entries that pointed at it.
    pub fn add_optimized_primitive_info(
        &mut self,
        optimized_id: PrimitiveId,
        replaced_with: Vec<PrimitiveId>,
    ) {
        for (_, survivors) in self.optimized_out.iter_mut() {
            if let Some(pos) = survivors.iter().position(|s| s == &optimized_id) {
                survivors.remove(pos);
                survivors.extend(replaced_with.iter().cloned());
            }
        }
        self.optimized_out.push((optimized_id, replaced_with));
    }

    pub fn optimized_out(&self) -> &[(PrimitiveId, Vec<PrimitiveId>)] {
        &self.optimized_out
    }

    pub fn optimizer_passes_info(&self) -> &[(String, Vec<PrimitiveInfo>)] {
        &self.optimizer_passes_info
    }

    /// For body programs: where the enclosing loop should look for each
    /// optimized-out id.
    pub fn loop_primitive_map(&self) -> &[(PrimitiveId, PrimitiveId)] {
        &self.loop_primitive_map
    }

    pub(crate) fn is_alive(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.index())
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn primitives_info(&self) -> &[PrimitiveInfo] {
        &self.prim_info
    }

    // ---- traversal helpers -------------------------------------------

    /// Whether a forward path `from -> ... -> to` exists.
    pub(crate) fn path_exists(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut stack = vec![from];
        let mut seen = std::collections::HashSet::new();
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if !seen.insert(n) {
                continue;
            }
            for &u in self.node(n).users.iter() {
                stack.push(u);
            }
        }
        false
    }

    /// Re-derives the processing order: Kahn's BFS from the inputs, ties
    /// broken by discovery order.
    pub fn calculate_bfs_processing_order(&mut self) {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        for id in self.node_ids() {
            indegree.insert(id, self.node(id).dependencies.len());
        }
        let mut queue: std::collections::VecDeque<NodeId> = self
            .inputs
            .iter()
            .copied()
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        // dep-less nodes that never made it into the inputs list still must
        // be scheduled
        for id in self.node_ids() {
            if indegree.get(&id) == Some(&0) && !self.inputs.contains(&id) {
                queue.push_back(id);
            }
        }
        let mut order = Vec::with_capacity(indegree.len());
        let mut enqueued: std::collections::HashSet<NodeId> = queue.iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            order.push(n);
            let users: Vec<NodeId> = self.node(n).users.to_vec();
            for user in users {
                if let Some(d) = indegree.get_mut(&user) {
                    *d = d.saturating_sub(1);
                    if *d == 0 && enqueued.insert(user) {
                        queue.push_back(user);
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), self.node_count(), "graph must be acyclic");
        self.processing_order.rebuild(order);
    }

    // ---- flag analyses ------------------------------------------------

    /// Recomputes the constant flag assuming all dependencies are marked.
    pub fn mark_if_constant(&mut self, node: NodeId) {
        let (tag, deps_empty) = {
            let n = self.node(node);
            (n.kind_tag(), n.dependencies.is_empty())
        };
        if tag.is_stateful_source() {
            self.node_mut(node).constant = false;
            return;
        }
        if deps_empty {
            self.node_mut(node).constant = tag == KindTag::Data;
            return;
        }
        let deps = self.node(node).dependencies.clone();
        let constant = deps.iter().all(|&d| self.node(d).is_constant());
        self.node_mut(node).constant = constant;
    }

    /// Recomputes the data-flow flag assuming all dependencies are marked.
    pub fn mark_if_data_flow(&mut self, node: NodeId) {
        let tag = self.node(node).kind_tag();
        if matches!(tag, KindTag::MutableData | KindTag::InputLayout) {
            self.node_mut(node).data_flow = true;
            return;
        }
        let deps = self.node(node).dependencies.clone();
        let data_flow = deps.iter().any(|&d| self.node(d).is_in_data_flow());
        self.node_mut(node).data_flow = data_flow;
    }

    // ---- layout computation -------------------------------------------

    /// Returns the node's output layout, computing it (and its dependencies'
    /// layouts) on demand. Accumulated output padding survives recomputation.
    pub fn get_output_layout(&mut self, node: NodeId) -> GraphResult<Layout> {
        if let Some(layout) = self.node(node).output_layout() {
            return Ok(layout.clone());
        }
        let deps = self.node(node).dependencies.clone();
        let mut input_layouts = Vec::with_capacity(deps.len());
        for dep in deps {
            input_layouts.push(self.get_output_layout(dep)?);
        }
        let mut layout = {
            let n = self.node(node);
            registry::infer_layout(&n.desc, &input_layouts)?
        };
        if let Some(stride) = self.node(node).eltwise_stride {
            for axis in 0..3 {
                let extent = layout.size.spatial[axis];
                layout.size.spatial[axis] = (extent + stride[axis] - 1) / stride[axis];
            }
        }
        layout.padding =
            crate::tensor::Padding::max(&layout.padding, &self.node(node).layout.padding);
        self.node_mut(node).set_output_layout(layout.clone());
        Ok(layout)
    }

    /// Invalidates the layouts of every transitive user of `node`.
    pub fn invalidate_users_layouts(&mut self, node: NodeId) {
        let mut stack: Vec<NodeId> = self.node(node).users.to_vec();
        let mut seen = std::collections::HashSet::new();
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if self.node(n).valid_output_layout {
                self.node_mut(n).invalidate_output_layout();
                stack.extend(self.node(n).users.iter().copied());
            }
        }
    }

    // ---- reporting ----------------------------------------------------

    /// Effective runtime precision of one node, derived from its kind and the
    /// precisions of its inputs. Invalid layouts degrade to f32.
    pub fn get_inference_precision(&self, node: NodeId) -> DType {
        let n = self.node(node);
        if n.is_input() {
            return n.output_layout_or_dummy().data_type;
        }
        let mut input_dts = Vec::with_capacity(n.dependencies.len());
        for &dep in &n.dependencies {
            if let Some(layout) = self.node(dep).output_layout() {
                input_dts.push(layout.data_type);
            }
        }
        if input_dts.len() != n.dependencies.len() || !n.is_valid_output_layout() {
            return DType::F32;
        }
        let output_dt = n.output_layout_or_dummy().data_type;
        match n.kind_tag() {
            KindTag::Reorder => DType::max_type(input_dts[0], output_dt),
            KindTag::Quantize => {
                if output_dt.is_quantized() {
                    output_dt
                } else {
                    DType::max_type(input_dts[0], output_dt)
                }
            }
            KindTag::Eltwise => {
                let mut max_dt = input_dts[0];
                for &dt in &input_dts[1..] {
                    max_dt = DType::max_type(max_dt, dt);
                }
                max_dt
            }
            KindTag::Convolution
            | KindTag::Deconvolution
            | KindTag::FullyConnected
            | KindTag::Gemm => {
                if input_dts.len() < 2 {
                    return DType::F32;
                }
                if input_dts[0].is_quantized() && input_dts[1].is_quantized() {
                    input_dts[0]
                } else {
                    DType::max_type(input_dts[0], input_dts[1])
                }
            }
            _ => input_dts[0],
        }
    }

    /// `<kernel-name>__<precision>`, or "undef" when nothing was selected.
    pub fn get_implementation_info(&self, id: &str) -> String {
        let Ok(node_id) = self.get_node_id(id) else {
            return "undef".into();
        };
        match self.node(node_id).selected_impl() {
            Some(selected) if !selected.kernel_name.is_empty() => format!(
                "{}__{}",
                selected.kernel_name,
                self.get_inference_precision(node_id).as_str()
            ),
            _ => "undef".into(),
        }
    }

    /// Snapshot of the currently executed graph, one record per node in
    /// processing order.
    pub fn get_current_stage_info(&self) -> Vec<PrimitiveInfo> {
        let mut info = Vec::new();
        for (exec_id, node_id) in self.processing_order.iter().enumerate() {
            let node = self.node(node_id);
            let users = node
                .users
                .iter()
                .map(|&u| self.node(u).id().clone())
                .collect();
            let dependencies = node
                .dependencies
                .iter()
                .map(|&d| self.node(d).id().clone())
                .collect();
            let mut fused = Vec::new();
            for (removed, survivors) in &self.optimized_out {
                if survivors.iter().any(|s| s == node.id()) {
                    fused.push(removed.clone());
                }
            }
            let output_layout = node.output_layout_or_dummy();
            let precision = if node.is_valid_output_layout() {
                self.get_inference_precision(node_id)
            } else {
                DType::F32
            };
            info.push(PrimitiveInfo {
                id: node.id().clone(),
                type_str: node.kind_tag().as_str().to_string(),
                dependencies,
                users,
                fused,
                format: output_layout.format.as_str().to_string(),
                output_layout,
                impl_name: self.get_implementation_info(node.id()),
                precision: precision.as_str().to_string(),
                is_cpu: node
                    .selected_impl()
                    .map(|s| s.is_cpu)
                    .unwrap_or(false),
                exec_id,
            });
        }
        info
    }

    pub(crate) fn save_pass_info(&mut self, pass_name: &str) {
        if self.options.graph_dumps_dir.is_some() {
            let info = self.get_current_stage_info();
            self.optimizer_passes_info
                .push((pass_name.to_string(), info));
        }
    }

    pub fn get_memory_dependencies_string(&self) -> String {
        let mut out = String::from("Memory dependencies/restrictions:\n");
        for node_id in self.processing_order.iter() {
            let node = self.node(node_id);
            out.push_str("primitive: ");
            out.push_str(node.id());
            out.push_str(" restricted list: ");
            for dep in node.memory_dependencies() {
                out.push_str(dep);
                out.push_str(", ");
            }
            out.push('\n');
        }
        out
    }

    // ---- output-size-handling analysis --------------------------------

    /// Compares every declared output size against the sliding-window
    /// computation; a mismatch anywhere makes subsequent padding passes pad
    /// and trim instead of trusting layout inference.
    pub fn analyze_output_size_handling_need(&mut self) -> GraphResult<bool> {
        let mut handling_needed = false;
        let order = self.processing_order.to_vec();
        for node_id in order {
            let desc = self.node(node_id).desc.clone();
            let declared = match &desc.kind {
                PrimitiveKind::Convolution(p) | PrimitiveKind::BinaryConvolution(p) => {
                    match p.output_size {
                        Some(size) => {
                            let input = self.dep_layout(node_id, 0)?;
                            let weights = self.dep_layout(node_id, 1)?;
                            let computed = crate::sliding_window::output_range(
                                crate::sliding_window::SworMode::All,
                                input.size.spatial,
                                weights.size.spatial,
                                p.pad,
                                p.stride,
                                p.dilation,
                            );
                            Some((size.spatial, computed))
                        }
                        None => None,
                    }
                }
                PrimitiveKind::Deconvolution(p) => match p.output_size {
                    Some(size) => {
                        let input = self.dep_layout(node_id, 0)?;
                        let weights = self.dep_layout(node_id, 1)?;
                        let computed = crate::sliding_window::needed_input_range(
                            input.size.spatial,
                            weights.size.spatial,
                            p.pad,
                            p.stride,
                        );
                        Some((size.spatial, computed))
                    }
                    None => None,
                },
                PrimitiveKind::Pooling(p) => match p.output_size {
                    Some(size) => {
                        let input = self.dep_layout(node_id, 0)?;
                        let computed = crate::sliding_window::output_range(
                            crate::sliding_window::SworMode::ExceedOnceData,
                            input.size.spatial,
                            p.size,
                            p.pad,
                            p.stride,
                            [1, 1, 1],
                        );
                        Some((size.spatial, computed))
                    }
                    None => None,
                },
                _ => None,
            };
            if let Some((specified, computed)) = declared {
                if specified != computed {
                    handling_needed = true;
                }
            }
        }
        self.output_size_handling_enabled = handling_needed;
        Ok(handling_needed)
    }

    pub fn output_size_handling_enabled(&self) -> bool {
        self.output_size_handling_enabled
    }

    pub(crate) fn dep_layout(&mut self, node: NodeId, idx: usize) -> GraphResult<Layout> {
        let dep = *self.node(node).dependencies.get(idx).ok_or_else(|| {
            GraphError::invariant(format!(
                "{} has no dependency at index {idx}",
                self.node(node).id()
            ))
        })?;
        self.get_output_layout(dep)
    }

    /// Validates the edge-symmetry invariant; used by tests and debug sweeps.
    pub fn check_edge_symmetry(&self) -> GraphResult<()> {
        for id in self.node_ids() {
            let node = self.node(id);
            for &dep in &node.dependencies {
                let back = self.node(dep).users.iter().filter(|&&u| u == id).count();
                let fwd = node.dependencies.iter().filter(|&&d| d == dep).count();
                if back != fwd {
                    return Err(GraphError::invariant(format!(
                        "edge between {} and {} is asymmetric",
                        self.node(dep).id(),
                        node.id()
                    )));
                }
            }
        }
        Ok(())
    }
}
