//! User-facing topology: an insertion-ordered set of primitive descriptors.

use std::collections::HashMap;

use crate::error::{GraphError, GraphResult};
use crate::primitive::{PrimitiveDescriptor, PrimitiveId};

/// A declarative computation graph, as supplied by the front end.
///
/// Descriptors are kept in insertion order; the program constructor relies on
/// that order for deterministic node creation and BFS tie-breaking.
#[derive(Debug, Default, Clone)]
pub struct Topology {
    primitives: Vec<PrimitiveDescriptor>,
    index: HashMap<PrimitiveId, usize>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor. Ids must be unique within a topology.
    pub fn add(&mut self, desc: PrimitiveDescriptor) -> GraphResult<()> {
        if self.index.contains_key(&desc.id) {
            return Err(GraphError::invariant(format!(
                "topology already contains primitive {}",
                desc.id
            )));
        }
        self.index.insert(desc.id.clone(), self.primitives.len());
        self.primitives.push(desc);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PrimitiveDescriptor> {
        self.index.get(id).map(|&i| &self.primitives[i])
    }

    pub fn primitives(&self) -> &[PrimitiveDescriptor] {
        &self.primitives
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}
