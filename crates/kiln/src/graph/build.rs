//! Program construction: topology intake and the canonical optimization
//! pipeline.
//!
//! Data flow: topology -> graph construction -> init passes -> pre-optimize
//! (layout + fusing + reorders) -> compile (kernel selection) ->
//! post-optimize -> memory-dependency analysis -> ready-to-execute program.

use std::collections::HashMap;
use std::sync::Arc;

use super::node::NodeId;
use super::program::Program;
use crate::engine::{AllocationType, Engine, TuningCache};
use crate::error::{GraphError, GraphResult};
use crate::options::{BuildOptions, TuningMode};
use crate::pass::{self, PassManager};
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveKind};
use crate::topology::Topology;

impl Program {
    /// Builds an executable program from a topology.
    ///
    /// `is_internal` marks helper builds (no tuning cache, no constant
    /// propagation re-entry); `no_optimizations` stops after the init
    /// passes; `is_body_program` marks loop bodies.
    pub fn build(
        engine: Arc<dyn Engine>,
        topology: &Topology,
        options: BuildOptions,
        is_internal: bool,
        no_optimizations: bool,
        is_body_program: bool,
    ) -> GraphResult<Program> {
        let mut program = Program::new_empty(engine, options, is_body_program)?;
        program.prepare_nodes(topology)?;
        let mut pm = PassManager::new();
        if no_optimizations {
            program.init_graph(&mut pm)?;
        } else {
            program.build_program(&mut pm, is_internal)?;
        }
        Ok(program)
    }

    /// Second constructor variant: builds a program over pre-existing node
    /// descriptors, restricting dependencies to the given set. Used by the
    /// constant evaluator to run a subgraph in isolation.
    pub fn from_nodes(
        engine: Arc<dyn Engine>,
        descriptors: Vec<PrimitiveDescriptor>,
        options: BuildOptions,
        is_internal: bool,
    ) -> GraphResult<Program> {
        let mut program = Program::new_empty(engine, options, false)?;
        program.prepare_nodes_subset(descriptors)?;
        let mut pm = PassManager::new();
        if is_internal {
            program.init_graph(&mut pm)?;
        } else {
            program.build_program(&mut pm, false)?;
        }
        Ok(program)
    }

    fn prepare_nodes(&mut self, topology: &Topology) -> GraphResult<()> {
        for desc in topology.primitives() {
            self.get_or_create(desc.clone());
        }
        self.add_split_outputs();
        for node in self.node_ids() {
            self.add_node_dependencies(node)?;
        }
        for node in self.node_ids() {
            if self.node(node).is_input() {
                self.inputs.push(node);
            }
        }
        Ok(())
    }

    /// One crop per declared split output, wired to the split's input. The
    /// crops get their real extents in `graph_initializations`.
    fn add_split_outputs(&mut self) {
        let splits: Vec<NodeId> = self
            .node_ids()
            .into_iter()
            .filter(|&n| self.node(n).is_kind(KindTag::Split))
            .collect();
        for split in splits {
            let desc = self.node(split).desc().clone();
            let (output_ids, output_offsets) = match &desc.kind {
                PrimitiveKind::Split {
                    output_ids,
                    output_offsets,
                } => (output_ids.clone(), output_offsets.clone()),
                _ => continue,
            };
            let input_id = desc.inputs[0].clone();
            for (i, out_id) in output_ids.iter().enumerate() {
                let crop_desc = PrimitiveDescriptor::new(
                    format!("{}:{}", desc.id, out_id),
                    vec![input_id.clone()],
                    PrimitiveKind::Crop {
                        reference: crate::tensor::TensorDims::ones(),
                        offsets: output_offsets[i],
                    },
                );
                self.get_or_create(crop_desc);
            }
        }
    }

    fn add_node_dependencies(&mut self, node: NodeId) -> GraphResult<()> {
        let desc = self.node(node).desc().clone();
        for dep_id in &desc.inputs {
            let dep = self.ids.get(dep_id).copied().ok_or_else(|| {
                GraphError::UnknownId(format!(
                    "{dep_id} (input to {})",
                    desc.id
                ))
            })?;
            self.add_connection(dep, node);
        }
        for port in &desc.indexed_inputs {
            if !self.ids.contains_key(&port.id) {
                return Err(GraphError::UnknownId(format!(
                    "{} (indexed input to {})",
                    port.id, desc.id
                )));
            }
        }
        Ok(())
    }

    /// Dependency wiring restricted to descriptors present in the subset.
    fn prepare_nodes_subset(&mut self, descriptors: Vec<PrimitiveDescriptor>) -> GraphResult<()> {
        for desc in descriptors {
            self.get_or_create(desc);
        }
        for node in self.node_ids() {
            let desc = self.node(node).desc().clone();
            for dep_id in &desc.inputs {
                if let Some(&dep) = self.ids.get(dep_id) {
                    self.add_connection(dep, node);
                }
            }
        }
        for node in self.node_ids() {
            if self.node(node).is_input() {
                self.inputs.push(node);
            }
        }
        Ok(())
    }

    // ---- pipeline ------------------------------------------------------

    fn init_graph(&mut self, pm: &mut PassManager) -> GraphResult<()> {
        pm.apply(self, &mut pass::GraphInitializations)?;
        pm.apply(self, &mut pass::CalculatePriorBoxes)?;
        pm.apply(self, &mut pass::MarkNodes)?;
        Ok(())
    }

    fn build_program(&mut self, pm: &mut PassManager, is_internal: bool) -> GraphResult<()> {
        self.init_graph(pm)?;
        self.pre_optimize_graph(pm, is_internal)?;
        pm.apply(self, &mut pass::CompileGraph)?;
        self.post_optimize_graph(pm, is_internal)?;
        self.prepare_memory_dependencies(pm)?;

        if self.options.partial_build_program {
            return Ok(());
        }

        self.compile()?;
        self.init_kernels();
        if !is_internal {
            self.prim_info = self.get_current_stage_info();
            self.transfer_memory_to_device()?;
        }
        self.cleanup()
    }

    fn pre_optimize_graph(&mut self, pm: &mut PassManager, is_internal: bool) -> GraphResult<()> {
        if !is_internal {
            self.load_tuning_cache();
        }

        pm.apply(self, &mut pass::TrimToOutputs)?;
        pm.apply(self, &mut pass::HandleInputPadding)?;

        // only meaningful for out-of-order queues, but cheap enough to always
        // recompute after trimming
        self.calculate_bfs_processing_order();

        pm.apply(self, &mut pass::ReverseOptionalNodesOutputs)?;

        self.analyze_output_size_handling_need()?;
        for node in self.processing_order.to_vec() {
            if !self.node(node).is_kind(KindTag::Data) {
                self.get_output_layout(node)?;
            }
        }

        let optimize_data = self.options.optimize_data;
        if optimize_data {
            pm.apply(self, &mut pass::PrepareQuantization)?;
        }

        let mut lo = crate::layout_optimizer::LayoutOptimizer::new(
            self.output_size_handling_enabled,
        );
        crate::layout_optimizer::set_layout_optimizer_attributes(self, &mut lo)?;

        let mut rf = pass::ReorderFactory::new();
        if optimize_data {
            pm.apply(self, &mut pass::PreparePrimitiveFusingThrough)?;
            pm.apply(self, &mut pass::PreReplaceDeconv)?;
            // fusing intentionally precedes format selection; candidates are
            // judged on logical shapes, alignment comes later
            pm.apply(self, &mut pass::PreparePrimitiveFusing)?;
            pm.apply(self, &mut pass::SelectPreferredFormats { lo: &mut lo })?;
            pm.apply(self, &mut pass::ReorderInputs { lo: &mut lo, rf: &mut rf })?;
            // concat input fix-up must follow reorder insertion immediately
            pm.apply(self, &mut pass::ConcatInputOrder)?;
            pm.apply(self, &mut pass::PreOptimizeBias { rf: &mut rf })?;
            pm.apply(self, &mut pass::EltwiseShrinking)?;
            pm.apply(self, &mut pass::EltwiseRemoveStride)?;
        }

        pm.apply(self, &mut pass::StridedSliceOptimize)?;
        pm.apply(self, &mut pass::HandleReshape)?;
        pm.apply(
            self,
            &mut pass::PreparePadding {
                output_size_handling_enabled: self.output_size_handling_enabled,
            },
        )?;
        pm.apply(
            self,
            &mut pass::RemoveRedundantReorders {
                enable_reorder_fusing: optimize_data,
                post_compile: false,
                remove_output_reorders: false,
            },
        )?;

        if !is_internal {
            pm.apply(self, &mut pass::PropagateConstants)?;
        }

        if optimize_data {
            pm.apply(self, &mut pass::PrepareBufferFusing)?;
        }

        pm.apply(self, &mut pass::AddRequiredReorders)?;
        pm.apply(self, &mut pass::AddOnednnOptimizationAttributes { lo: &mut lo })?;
        Ok(())
    }

    fn post_optimize_graph(&mut self, pm: &mut PassManager, is_internal: bool) -> GraphResult<()> {
        pm.apply(self, &mut pass::PostInputReorder)?;
        pm.apply(self, &mut pass::PostOptimizeWeights)?;
        pm.apply(
            self,
            &mut pass::RemoveRedundantReorders {
                enable_reorder_fusing: false,
                post_compile: true,
                remove_output_reorders: false,
            },
        )?;

        if !is_internal && !self.options.partial_build_program {
            pm.apply(self, &mut pass::PropagateConstants)?;
        }

        if self.options.optimize_data {
            // output reorders go last, once every other rewrite has settled
            pm.apply(
                self,
                &mut pass::RemoveRedundantReorders {
                    enable_reorder_fusing: false,
                    post_compile: true,
                    remove_output_reorders: true,
                },
            )?;
        }

        pm.apply(self, &mut pass::UpdateLoopPrimitiveMap)?;
        Ok(())
    }

    fn prepare_memory_dependencies(&mut self, pm: &mut PassManager) -> GraphResult<()> {
        if !self.engine.configuration().use_memory_pool {
            return Ok(());
        }
        pm.apply(self, &mut pass::BasicMemoryDependencies)?;
        pm.apply(self, &mut pass::SkippedBranchMemoryDependencies)?;
        pm.apply(self, &mut pass::OooqMemoryDependencies)?;
        Ok(())
    }

    // ---- back-end steps ------------------------------------------------

    fn load_tuning_cache(&mut self) {
        if self.options.tuning_config.mode == TuningMode::None {
            return;
        }
        let path = self.engine.configuration().tuning_cache_path;
        let entries = path
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|text| serde_json::from_str::<HashMap<String, String>>(&text).ok())
            .unwrap_or_default();
        self.tuning_cache = Some(TuningCache { entries });
    }

    /// Batch-compiles all gathered kernels through the engine; may block on
    /// the engine's internal build parallelism.
    fn compile(&mut self) -> GraphResult<()> {
        self.engine.compile_kernels(&self.kernel_names)?;
        self.kernels_built = true;
        Ok(())
    }

    fn init_kernels(&mut self) {
        let mut next_id = 0u64;
        for node in self.processing_order.to_vec() {
            let kernel_name = match self.node(node).selected_impl() {
                Some(selected) => selected.kernel_name.clone(),
                None => continue,
            };
            if self.in_mem_kernels_cache.get(&kernel_name).is_none() {
                self.in_mem_kernels_cache.put(kernel_name, next_id);
                next_id += 1;
            }
        }
    }

    /// Uploads every constant payload to device memory, with an explicit
    /// stream barrier after each transfer.
    fn transfer_memory_to_device(&mut self) -> GraphResult<()> {
        if !self.engine.device_info().supports_usm_device {
            return Ok(());
        }
        for node in self.processing_order.to_vec() {
            if !self.node(node).is_kind(KindTag::Data) {
                continue;
            }
            let (declared, payload) = match &self.node(node).desc().kind {
                PrimitiveKind::Data { layout, payload } => (layout.clone(), payload.clone()),
                _ => continue,
            };
            let node_layout = self.get_output_layout(node)?;
            if !declared.compatible(&node_layout) {
                return Err(GraphError::IncompatibleLayout {
                    node: self.node(node).id().clone(),
                    details: "node and memory layouts are incompatible".into(),
                });
            }
            let engine = self.engine.clone();
            let memory =
                engine.allocate_and_upload(&node_layout, &payload, AllocationType::UsmDevice)?;
            self.node_mut(node).attached_memory = Some(memory);
            self.stream.finish();
        }
        Ok(())
    }

    fn cleanup(&mut self) -> GraphResult<()> {
        for node in self.processing_order.to_vec() {
            self.get_output_layout(node)?;
        }
        // debug builds expose every surviving buffer for inspection
        if self.is_debug_build() {
            for node in self.processing_order.to_vec() {
                if !self.node(node).is_output() {
                    self.node_mut(node).output = true;
                    self.outputs.push(node);
                }
            }
        }
        Ok(())
    }
}
