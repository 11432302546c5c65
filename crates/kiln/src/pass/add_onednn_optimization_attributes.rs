//! Marks nodes that should go through the onednn implementation path when
//! the device and queue configuration allow it.

use super::{Pass, PassPhase};
use crate::error::GraphResult;
use crate::graph::{ImplTypeHint, Program};
use crate::layout_optimizer::LayoutOptimizer;
use crate::primitive::KindTag;

pub struct AddOnednnOptimizationAttributes<'a> {
    pub lo: &'a mut LayoutOptimizer,
}

impl Pass for AddOnednnOptimizationAttributes<'_> {
    fn name(&self) -> &'static str {
        "add_onednn_optimization_attributes"
    }

    fn phase(&self) -> PassPhase {
        PassPhase::PreOptimize
    }

    fn run(&mut self, program: &mut Program) -> GraphResult<()> {
        if !self.lo.attributes().use_onednn_impls {
            return Ok(());
        }
        for node in program.node_ids() {
            if matches!(
                program.node(node).kind_tag(),
                KindTag::Convolution
                    | KindTag::Deconvolution
                    | KindTag::FullyConnected
                    | KindTag::Gemm
                    | KindTag::Pooling
            ) {
                program.node_mut(node).impl_hint = ImplTypeHint::Onednn;
            }
        }
        Ok(())
    }
}
