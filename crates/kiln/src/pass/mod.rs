//! The pass manager and the canonical pass set.
//!
//! A pass is a named graph transformation bound to a pipeline phase. The
//! manager applies passes in the fixed order defined by the program builder;
//! after each pass it snapshots the stage (when dumping is enabled) and
//! optionally prints one stats line per pass, gated by `KILN_PASS_STATS`.

mod add_onednn_optimization_attributes;
mod add_required_reorders;
mod calculate_prior_boxes;
mod compile_graph;
mod concat_input_order;
mod eltwise_opts;
mod fusing_passes;
mod graph_initializations;
mod handle_input_padding;
mod handle_reshape;
mod mark_nodes;
mod memory_dependencies;
mod post_optimize_weights;
mod pre_optimize_bias;
mod prepare_buffer_fusing;
mod prepare_padding;
mod prepare_quantization;
mod propagate_constants;
mod remove_redundant_reorders;
mod reorder_inputs;
mod reverse_optional_nodes_outputs;
mod strided_slice_optimize;
mod trim_to_outputs;
mod update_loop_primitive_map;

pub use add_onednn_optimization_attributes::AddOnednnOptimizationAttributes;
pub use add_required_reorders::AddRequiredReorders;
pub use calculate_prior_boxes::CalculatePriorBoxes;
pub use compile_graph::CompileGraph;
pub use concat_input_order::ConcatInputOrder;
pub use eltwise_opts::{EltwiseRemoveStride, EltwiseShrinking};
pub use fusing_passes::{
    PreparePrimitiveFusing, PreparePrimitiveFusingThrough, PreReplaceDeconv,
};
pub use graph_initializations::GraphInitializations;
pub use handle_input_padding::HandleInputPadding;
pub use handle_reshape::HandleReshape;
pub use mark_nodes::MarkNodes;
pub use memory_dependencies::{
    BasicMemoryDependencies, OooqMemoryDependencies, SkippedBranchMemoryDependencies,
};
pub use post_optimize_weights::{PostInputReorder, PostOptimizeWeights};
pub use pre_optimize_bias::PreOptimizeBias;
pub use prepare_buffer_fusing::PrepareBufferFusing;
pub use prepare_padding::PreparePadding;
pub use prepare_quantization::PrepareQuantization;
pub use propagate_constants::PropagateConstants;
pub use remove_redundant_reorders::RemoveRedundantReorders;
pub use reorder_inputs::{ReorderFactory, ReorderInputs, SelectPreferredFormats};
pub use reverse_optional_nodes_outputs::ReverseOptionalNodesOutputs;
pub use strided_slice_optimize::StridedSliceOptimize;
pub use trim_to_outputs::TrimToOutputs;
pub use update_loop_primitive_map::UpdateLoopPrimitiveMap;

use crate::error::GraphResult;
use crate::graph::Program;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Init,
    PreOptimize,
    Compile,
    PostOptimize,
}

/// A single graph-transforming step with a stable name and phase.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn phase(&self) -> PassPhase;
    fn run(&mut self, program: &mut Program) -> GraphResult<()>;
}

/// Applies passes in pipeline order, snapshotting after each one.
pub struct PassManager {
    pass_count: usize,
    log_stats: bool,
}

impl PassManager {
    pub fn new() -> Self {
        Self {
            pass_count: 0,
            log_stats: std::env::var("KILN_PASS_STATS").is_ok(),
        }
    }

    pub fn apply(&mut self, program: &mut Program, pass: &mut dyn Pass) -> GraphResult<()> {
        let nodes_before = program.node_count();
        pass.run(program)?;
        if self.log_stats {
            println!(
                "[pass] run={} name={} phase={:?} nodes={}->{}",
                self.pass_count,
                pass.name(),
                pass.phase(),
                nodes_before,
                program.node_count()
            );
        }
        program.save_pass_info(pass.name());
        let stage = format!("{:02}_{}", self.pass_count, pass.name());
        crate::dump::dump_program(program, &stage)?;
        self.pass_count += 1;
        Ok(())
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}
