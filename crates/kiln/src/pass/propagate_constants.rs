//! Constant propagation: evaluates the constant subgraph on the host and
//! replaces its boundary producers with plain data nodes.
//!
//! The constant subgraph is rebuilt as a standalone program through the
//! node-set constructor (data nodes become input layouts, exactly like the
//! runtime path would see them), evaluated in processing order through the
//! engine, and only then is the parent graph mutated. Keeping the evaluator
//! external means the main builder never re-enters itself.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Pass, PassPhase};
use crate::engine::ConstInput;
use crate::error::{GraphError, GraphResult};
use crate::graph::{NodeId, Program};
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveId, PrimitiveKind};
use crate::tensor::Layout;

#[derive(Default)]
pub struct PropagateConstants;

impl Pass for PropagateConstants {
    fn name(&self) -> &'static str {
        "propagate_constants"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let evaluator = ConstantEvaluator::collect(program);
        if evaluator.boundary.is_empty() {
            return Ok(());
        }
        let results = evaluator.evaluate(program)?;

        for (node_id, (layout, payload)) in results {
            let Ok(node) = program.get_node_id(&node_id) else {
                continue;
            };
            let data_desc = PrimitiveDescriptor::new(
                format!("_propagated_{node_id}"),
                Vec::new(),
                PrimitiveKind::Data {
                    layout,
                    payload: Arc::new(payload),
                },
            );
            let data_node = program.get_or_create(data_desc);
            // detach the inputs first so replace() moves only the users over
            loop {
                let dep = match program.node(node).dependencies().first() {
                    Some(&d) => d,
                    None => break,
                };
                program.remove_connection(dep, node);
            }
            program.replace(node, data_node)?;
        }

        // the demoted producers are now unreachable; sweep until stable
        let mut changed = true;
        while changed {
            changed = false;
            for node in program.node_ids() {
                if !program.is_alive(node) {
                    continue;
                }
                let n = program.node(node);
                if n.is_constant() && n.is_endpoint() && !n.is_output() {
                    program.remove_all_connections(node);
                    if program.remove_if_dangling(node)? {
                        changed = true;
                    }
                }
            }
        }
        Ok(())
    }
}

struct ConstantEvaluator {
    /// Every node of the constant subgraph, in parent processing order.
    subgraph: Vec<NodeId>,
    /// Constant producers with at least one non-constant user (or marked as
    /// outputs); these get replaced by data nodes.
    boundary: Vec<NodeId>,
}

impl ConstantEvaluator {
    fn collect(program: &Program) -> Self {
        let mut subgraph = Vec::new();
        let mut boundary = Vec::new();
        for node in program.processing_order().iter() {
            let n = program.node(node);
            if !n.is_constant() {
                continue;
            }
            subgraph.push(node);
            if n.is_kind(KindTag::Data) {
                continue;
            }
            let replace = n.is_output()
                || n.users()
                    .iter()
                    .any(|&u| !program.node(u).is_constant());
            if replace {
                boundary.push(node);
            }
        }
        Self { subgraph, boundary }
    }

    /// Runs the subgraph to concrete tensors; returns payloads for every
    /// boundary node keyed by parent id.
    fn evaluate(
        &self,
        program: &mut Program,
    ) -> GraphResult<Vec<(PrimitiveId, (Layout, Vec<u8>))>> {
        // seed payloads come from the parent's data nodes
        let mut seeds: HashMap<PrimitiveId, Arc<Vec<u8>>> = HashMap::new();
        let mut descriptors = Vec::with_capacity(self.subgraph.len());
        for &node in &self.subgraph {
            let desc = program.node(node).desc().clone();
            match &desc.kind {
                PrimitiveKind::Data { layout, payload } => {
                    seeds.insert(desc.id.clone(), payload.clone());
                    descriptors.push(PrimitiveDescriptor::new(
                        desc.id.clone(),
                        Vec::new(),
                        PrimitiveKind::InputLayout {
                            layout: layout.clone(),
                        },
                    ));
                }
                _ => descriptors.push(desc),
            }
        }

        let engine = program.engine().clone();
        let mut sub = Program::from_nodes(
            engine.clone(),
            descriptors,
            crate::options::BuildOptions::default(),
            true,
        )?;

        let mut values: HashMap<PrimitiveId, (Layout, Vec<u8>)> = HashMap::new();
        let order = sub.processing_order().to_vec();
        for node in order {
            let desc = sub.node(node).desc().clone();
            let layout = sub.get_output_layout(node)?;
            let payload = match &desc.kind {
                PrimitiveKind::InputLayout { .. } => seeds
                    .get(&desc.id)
                    .map(|p| p.as_ref().clone())
                    .ok_or_else(|| GraphError::UnknownId(desc.id.clone()))?,
                _ => {
                    let deps = sub.node(node).dependencies().to_vec();
                    let mut dep_views = Vec::with_capacity(deps.len());
                    for dep in deps {
                        let dep_id = sub.node(dep).id().clone();
                        let entry = values.get(&dep_id).ok_or_else(|| {
                            GraphError::UnknownId(dep_id.clone())
                        })?;
                        dep_views.push(entry);
                    }
                    let inputs: Vec<ConstInput<'_>> = dep_views
                        .iter()
                        .map(|(layout, data)| ConstInput {
                            layout,
                            data: data.as_slice(),
                        })
                        .collect();
                    engine.evaluate_constant(&desc, &inputs)?
                }
            };
            values.insert(desc.id.clone(), (layout, payload));
        }

        let mut results = Vec::with_capacity(self.boundary.len());
        for &node in &self.boundary {
            let id = program.node(node).id().clone();
            let value = values
                .remove(&id)
                .ok_or_else(|| GraphError::UnknownId(id.clone()))?;
            results.push((id, value));
        }
        Ok(results)
    }
}
