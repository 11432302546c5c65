//! Kernel selection: asks the engine's selector for an implementation of
//! every executable node. Selections are memoized in the program's
//! implementations cache keyed by the node's kind/layout signature.

use super::{Pass, PassPhase};
use crate::engine::{SelectionContext, SelectedImpl};
use crate::error::{GraphError, GraphResult};
use crate::graph::{ImplTypeHint, NodeId, Program};
use crate::primitive::KindTag;
use crate::tensor::Layout;

#[derive(Default)]
pub struct CompileGraph;

impl Pass for CompileGraph {
    fn name(&self) -> &'static str {
        "compile_graph"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::Compile
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for node in order {
            if !needs_impl(program, node) {
                continue;
            }
            let selected = select_impl_for(program, node)?;
            program.kernel_names.push(selected.kernel_name.clone());
            program.node_mut(node).selected_impl = Some(selected);
        }
        Ok(())
    }
}

pub(super) fn needs_impl(program: &Program, node: NodeId) -> bool {
    let n = program.node(node);
    !matches!(n.kind_tag(), KindTag::Data | KindTag::MutableData) && !n.can_be_optimized()
}

/// Runs the selector for one node, going through the implementations cache.
/// Selector failure is fatal: the oracle is expected to fall back internally
/// when it can, so an error here means no implementation exists at all.
pub(super) fn select_impl_for(program: &mut Program, node: NodeId) -> GraphResult<SelectedImpl> {
    let deps = program.node(node).dependencies().to_vec();
    let mut input_layouts = Vec::with_capacity(deps.len());
    for dep in deps {
        input_layouts.push(program.get_output_layout(dep)?);
    }
    let output_layout = program.get_output_layout(node)?;
    let key = cache_key(program, node, &input_layouts, &output_layout);
    if let Some(hit) = program.impls_cache.get(&key) {
        return Ok(hit.clone());
    }

    let engine = program.engine.clone();
    let tuning = program.tuning_cache.clone();
    let id = program.node(node).id().clone();
    let selected = {
        let n = program.node(node);
        let cx = SelectionContext {
            id: &id,
            kind: n.kind_tag(),
            input_layouts: &input_layouts,
            output_layout: &output_layout,
            preferred_format: n.preferred_output_format,
            fused_count: n.fused_primitives().len(),
            forced: program
                .options
                .force_implementations
                .get(&id)
                .map(|s| s.as_str()),
            use_onednn: n.impl_hint == ImplTypeHint::Onednn,
            tuning: tuning.as_ref(),
        };
        engine.selector().select(&cx).map_err(|err| match err {
            GraphError::NoImplementation { .. } => err,
            other => GraphError::NoImplementation {
                node: id.clone(),
                kind: format!("{} ({other})", program.node(node).kind_tag().as_str()),
            },
        })?
    };
    program.impls_cache.put(key, selected.clone());
    Ok(selected)
}

fn cache_key(
    program: &Program,
    node: NodeId,
    input_layouts: &[Layout],
    output_layout: &Layout,
) -> String {
    let n = program.node(node);
    let mut key = String::new();
    key.push_str(n.kind_tag().as_str());
    for layout in input_layouts {
        key.push(':');
        key.push_str(layout.format.as_str());
        key.push('/');
        key.push_str(layout.data_type.as_str());
    }
    key.push_str("->");
    key.push_str(output_layout.format.as_str());
    key.push('/');
    key.push_str(output_layout.data_type.as_str());
    key.push_str(&format!(":fused{}", n.fused_primitives().len()));
    key
}
