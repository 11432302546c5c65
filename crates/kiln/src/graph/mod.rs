//! The program graph: nodes, processing order, structural edits, fusing and
//! the build pipeline.

mod build;
mod fusing;
mod node;
mod processing_order;
mod program;

pub use fusing::FusingHistory;
pub use node::{
    FusedActivation, FusedPrimitiveDesc, ImplTypeHint, Node, NodeId, QuantizeOpt,
};
pub use processing_order::NodesOrdering;
pub use program::{PrimitiveInfo, Program};
