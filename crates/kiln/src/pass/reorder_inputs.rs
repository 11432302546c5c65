//! Format selection and reorder insertion.
//!
//! `select_preferred_formats` stamps the layout optimizer's per-node
//! decisions onto the nodes; `reorder_inputs` then materializes a reorder on
//! every edge whose producer format disagrees with the consumer's preference.
//! The factory deduplicates reorders so several consumers of one producer
//! share a single conversion.

use std::collections::HashMap;

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::layout_optimizer::LayoutOptimizer;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::tensor::{Format, Layout};

/// Deduplicates reorder nodes by (source id, target layout).
#[derive(Default)]
pub struct ReorderFactory {
    cache: HashMap<(String, String), NodeId>,
    counter: usize,
}

impl ReorderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(src_id: &str, target: &Layout) -> (String, String) {
        (
            src_id.to_string(),
            format!(
                "{}:{}:{:?}",
                target.data_type.as_str(),
                target.format.as_str(),
                target.size
            ),
        )
    }

    /// Routes `consumer`'s dependency `dep_idx` through a reorder to
    /// `target`, reusing an existing equivalent reorder when one is live.
    pub fn insert_reorder(
        &mut self,
        program: &mut Program,
        consumer: NodeId,
        dep_idx: usize,
        target: Layout,
    ) -> GraphResult<NodeId> {
        let src = program.node(consumer).dependencies()[dep_idx];
        let src_id = program.node(src).id().clone();
        let key = Self::key(&src_id, &target);

        if let Some(&existing) = self.cache.get(&key) {
            if program.is_alive(existing) && program.node(existing).is_kind(KindTag::Reorder) {
                // retarget the edge at the shared reorder
                program.node_mut(consumer).dependencies[dep_idx] = existing;
                let users = &mut program.node_mut(src).users;
                if let Some(pos) = users.iter().position(|&u| u == consumer) {
                    users.remove(pos);
                }
                program.node_mut(existing).users.push(consumer);
                return Ok(existing);
            }
        }

        self.counter += 1;
        let reorder_desc = PrimitiveDescriptor::new(
            format!("reorder_{}_{}", self.counter, src_id),
            vec![src_id],
            PrimitiveKind::Reorder {
                target: target.clone(),
            },
        );
        let reorder = program.get_or_create(reorder_desc);
        program.add_intermediate(reorder, consumer, dep_idx, true, false)?;
        self.cache.insert(key, reorder);
        Ok(reorder)
    }
}

/// Stamps the layout optimizer's preferred formats onto each node.
pub struct SelectPreferredFormats<'a> {
    pub lo: &'a mut LayoutOptimizer,
}

impl Pass for SelectPreferredFormats<'_> {
    fn name(&self) -> &'static str {
        "select_preferred_formats"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for node in order {
            let preferred = self.lo.preferred_format(program, node)?;
            let n = program.node_mut(node);
            n.preferred_output_format = preferred;
            n.preferred_input_format = preferred;
        }
        Ok(())
    }
}

/// Inserts reorders where a producer's format differs from the consumer's
/// preferred input format, then recomputes every layout downstream.
pub struct ReorderInputs<'a> {
    pub lo: &'a mut LayoutOptimizer,
    pub rf: &'a mut ReorderFactory,
}

impl Pass for ReorderInputs<'_> {
    fn name(&self) -> &'static str {
        "reorder_inputs"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        let order = program.processing_order().to_vec();
        for consumer in order {
            if !program.is_alive(consumer) {
                continue;
            }
            let preferred = {
                let stamped = program.node(consumer).preferred_input_format;
                if stamped == Format::Any {
                    self.lo.preferred_format(program, consumer)?
                } else {
                    stamped
                }
            };
            if preferred == Format::Any {
                continue;
            }
            // only the data input; weights and bias reorders are handled by
            // the dedicated weight passes
            if program.node(consumer).dependencies().is_empty() {
                continue;
            }
            let src_layout = program.dep_layout(consumer, 0)?;
            if src_layout.format == preferred {
                continue;
            }
            let target = Layout::new(src_layout.data_type, preferred, src_layout.size);
            let reorder = self.rf.insert_reorder(program, consumer, 0, target)?;
            program.node_mut(reorder).invalidate_output_layout();
            program.node_mut(consumer).invalidate_output_layout();
            program.invalidate_users_layouts(consumer);
        }

        let order = program.processing_order().to_vec();
        for node in order {
            if program.is_alive(node) && !program.node(node).is_kind(KindTag::Data) {
                program.get_output_layout(node)?;
            }
        }
        Ok(())
    }
}
