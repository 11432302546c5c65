//! Global layout decisions.
//!
//! The layout optimizer first accumulates per-topology statistics (counted in
//! `set_layout_optimizer_attributes`), then answers per-node preferred-format
//! queries for `select_preferred_formats` and `reorder_inputs`. The
//! enablement thresholds below are part of the compiler contract: changing
//! them changes which networks flip into blocked layouts wholesale.

use std::collections::HashMap;

use crate::engine::QueueType;
use crate::error::GraphResult;
use crate::graph::{NodeId, Program};
use crate::primitive::{ConvolutionParams, KindTag, PrimitiveId, PrimitiveKind};
use crate::tensor::{DType, Format, Layout};

/// Boolean attributes describing which format families the whole network
/// should use.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizationAttributes {
    pub splitted_convolution: bool,
    pub group_convolution: bool,
    pub deformable_convolution: bool,
    pub bfyx_only_layer: bool,
    pub b_fs_yx_fsv16_network: bool,
    pub b_fs_zyx_fsv16_network: bool,
    pub fs_b_yx_fsv32_network: bool,
    pub b_fs_zyx_fsv32_network: bool,
    pub bs_fs_yx_bsv16_fsv16_network: bool,
    pub use_onednn_impls: bool,
}

#[derive(Debug, Default)]
pub struct LayoutOptimizer {
    attributes: OptimizationAttributes,
    output_size_handling: bool,
    total_conv: usize,
    optimized_conv_count: HashMap<Format, usize>,
    /// Preferred (input, output) format per convolution-like node.
    formats_map: HashMap<PrimitiveId, (Format, Format)>,
    implementation_forcing: HashMap<PrimitiveId, String>,
}

impl LayoutOptimizer {
    pub fn new(output_size_handling: bool) -> Self {
        Self {
            output_size_handling,
            ..Default::default()
        }
    }

    pub fn attributes(&self) -> &OptimizationAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut OptimizationAttributes {
        &mut self.attributes
    }

    pub fn output_size_handling(&self) -> bool {
        self.output_size_handling
    }

    pub fn set_implementation_forcing(&mut self, forcing: HashMap<PrimitiveId, String>) {
        self.implementation_forcing = forcing;
    }

    pub fn forced_implementation(&self, id: &str) -> Option<&str> {
        self.implementation_forcing.get(id).map(|s| s.as_str())
    }

    pub fn total_conv_count(&self) -> usize {
        self.total_conv
    }

    pub fn optimized_conv_count(&self, format: Format) -> usize {
        self.optimized_conv_count.get(&format).copied().unwrap_or(0)
    }

    /// Whether a convolution with these shapes runs well in `format`.
    pub fn is_conv_format_optimized(
        params: &ConvolutionParams,
        input: &Layout,
        weights: &Layout,
        format: Format,
    ) -> bool {
        let ofm = weights.size.batch;
        let depthwise = params.groups as i64 == input.size.feature && params.groups > 1;
        match format {
            Format::BFsYxFsv16 => {
                !params.deformable
                    && input.format.spatial_rank() == 2
                    && (params.groups == 1 || depthwise)
                    && ofm % 16 == 0
            }
            Format::BFsZyxFsv16 => {
                !params.deformable && input.format.spatial_rank() == 3 && ofm % 16 == 0
            }
            Format::BsFsYxBsv16Fsv16 => {
                params.groups == 1
                    && input.format.spatial_rank() == 2
                    && ofm % 16 == 0
                    && input.size.batch % 16 == 0
            }
            Format::FsBYxFsv32 => {
                params.groups == 1 && input.format.spatial_rank() == 2 && ofm % 32 == 0
            }
            _ => false,
        }
    }

    /// Same predicate applied to deconvolutions.
    pub fn is_deconv_format_optimized(input: &Layout, weights: &Layout, format: Format) -> bool {
        let ofm = weights.size.batch;
        match format {
            Format::BFsYxFsv16 => input.format.spatial_rank() == 2 && ofm % 16 == 0,
            Format::BFsZyxFsv16 => input.format.spatial_rank() == 3 && ofm % 16 == 0,
            _ => false,
        }
    }

    /// Counts one convolution into the per-format statistics. The formats
    /// map entry is only a placeholder until the attributes are decided and
    /// [`Self::update_formats_map`] refreshes it.
    pub fn record_conv(
        &mut self,
        id: &str,
        params: &ConvolutionParams,
        input: &Layout,
        weights: &Layout,
    ) {
        self.total_conv += 1;
        for format in [
            Format::BFsYxFsv16,
            Format::BFsZyxFsv16,
            Format::BsFsYxBsv16Fsv16,
            Format::FsBYxFsv32,
        ] {
            if Self::is_conv_format_optimized(params, input, weights, format) {
                *self.optimized_conv_count.entry(format).or_insert(0) += 1;
            }
        }
        let preferred = self.preferred_conv_format(params, input, weights);
        self.formats_map
            .insert(id.to_string(), (preferred, preferred));
    }

    /// Recomputes the node's preferred input/output formats under the
    /// current attributes; consulted by `select_preferred_formats` and
    /// `reorder_inputs`.
    pub fn update_formats_map(
        &mut self,
        id: &str,
        params: &ConvolutionParams,
        input: &Layout,
        weights: &Layout,
    ) {
        let preferred = self.preferred_conv_format(params, input, weights);
        self.formats_map
            .insert(id.to_string(), (preferred, preferred));
    }

    fn preferred_conv_format(
        &self,
        params: &ConvolutionParams,
        input: &Layout,
        weights: &Layout,
    ) -> Format {
        let a = &self.attributes;
        if a.b_fs_yx_fsv16_network
            && Self::is_conv_format_optimized(params, input, weights, Format::BFsYxFsv16)
        {
            Format::BFsYxFsv16
        } else if a.fs_b_yx_fsv32_network
            && input.data_type == DType::F16
            && Self::is_conv_format_optimized(params, input, weights, Format::FsBYxFsv32)
        {
            Format::FsBYxFsv32
        } else if a.bs_fs_yx_bsv16_fsv16_network
            && Self::is_conv_format_optimized(params, input, weights, Format::BsFsYxBsv16Fsv16)
        {
            Format::BsFsYxBsv16Fsv16
        } else if a.b_fs_zyx_fsv16_network
            && Self::is_conv_format_optimized(params, input, weights, Format::BFsZyxFsv16)
        {
            Format::BFsZyxFsv16
        } else if input.format.spatial_rank() == 3 {
            Format::Bfzyx
        } else {
            Format::Bfyx
        }
    }

    /// Per-node preferred buffer format; [`Format::Any`] means no preference.
    ///
    /// Queries after `set_layout_optimizer_attributes` see the formats map
    /// filled with the post-attribute decisions; earlier queries fall back to
    /// the plain format.
    pub fn preferred_format(&self, program: &mut Program, node: NodeId) -> GraphResult<Format> {
        let (tag, id) = {
            let n = program.node(node);
            (n.kind_tag(), n.id().clone())
        };
        match tag {
            KindTag::Convolution | KindTag::BinaryConvolution => {
                if let Some(&(_, output)) = self.formats_map.get(&id) {
                    return Ok(output);
                }
                let desc = program.node(node).desc().clone();
                let params = match &desc.kind {
                    PrimitiveKind::Convolution(p) | PrimitiveKind::BinaryConvolution(p) => {
                        p.clone()
                    }
                    _ => return Ok(Format::Bfyx),
                };
                let input = program.dep_layout(node, 0)?;
                let weights = program.dep_layout(node, 1)?;
                Ok(self.preferred_conv_format(&params, &input, &weights))
            }
            KindTag::Deconvolution => {
                if self.attributes.bfyx_only_layer {
                    Ok(Format::Bfyx)
                } else if self.attributes.b_fs_zyx_fsv16_network {
                    Ok(Format::BFsZyxFsv16)
                } else {
                    Ok(Format::Bfyx)
                }
            }
            KindTag::FullyConnected | KindTag::Gemm => Ok(Format::Bfyx),
            // Element-wise and movement kinds run in whatever format arrives.
            _ => Ok(Format::Any),
        }
    }
}

/// Pre-pass analysis deciding the network-wide format attributes.
///
/// Counting and thresholds mirror the production heuristics: a single
/// winograd-friendly convolution beats fsv16, so the whole topology only
/// flips when more than half of a non-trivial (> 11) convolution population
/// benefits, crop-heavy graphs stay plain, and the double-blocked batch
/// format additionally requires every convolution to qualify.
pub fn set_layout_optimizer_attributes(
    program: &mut Program,
    lo: &mut LayoutOptimizer,
) -> GraphResult<()> {
    lo.set_implementation_forcing(program.options().force_implementations.clone());

    let mut can_use_fsv16 = true;
    let mut can_use_bs_fs_yx_bsv16_fsv16 = true;
    let mut is_quantized_int8_model = false;
    let mut total_asym_quantized_conv_layers = 0usize;
    let mut total_dw_conv_layers = 0usize;
    let mut total_dw_splitted_conv_layers = 0usize;
    let mut total_1x1_fm_conv_layers = 0usize;
    let mut total_grouped_conv_layers = 0usize;
    let mut opt_deconv_layers_b_fs_zyx_fsv16 = 0usize;
    let mut opt_deconv_layers_b_fs_yx_fsv16 = 0usize;
    let mut total_crop_layers = 0usize;

    let order = program.processing_order().to_vec();
    for node_id in order {
        let desc = program.node(node_id).desc().clone();
        let tag = desc.kind_tag();

        if let PrimitiveKind::Convolution(params) = &desc.kind {
            if params.groups > 1 {
                lo.attributes_mut().group_convolution = true;
            }
            if params.deformable {
                lo.attributes_mut().deformable_convolution = true;
            }
            let input = program.dep_layout(node_id, 0)?;
            let weights = program.dep_layout(node_id, 1)?;
            let ifm = input.size.feature;
            let groups = params.groups as i64;
            if groups == ifm && groups >= 16 {
                total_dw_conv_layers += 1;
            } else if groups == ifm && groups > 1 {
                total_dw_splitted_conv_layers += 1;
            } else if groups > 1 {
                total_grouped_conv_layers += 1;
            }
            if input.size.spatial[0] == 1 && input.size.spatial[1] == 1 {
                total_1x1_fm_conv_layers += 1;
            }
            lo.record_conv(&desc.id, params, &input, &weights);
            if params.weights_zero_points || params.activations_zero_points {
                total_asym_quantized_conv_layers += 1;
            }
        }

        if tag == KindTag::Deconvolution {
            let input = program.dep_layout(node_id, 0)?;
            let weights = program.dep_layout(node_id, 1)?;
            if LayoutOptimizer::is_deconv_format_optimized(&input, &weights, Format::BFsZyxFsv16) {
                opt_deconv_layers_b_fs_zyx_fsv16 += 1;
            } else if LayoutOptimizer::is_deconv_format_optimized(
                &input,
                &weights,
                Format::BFsYxFsv16,
            ) {
                opt_deconv_layers_b_fs_yx_fsv16 += 1;
            }
            // deconvolution kernels perform worse outside bfyx
            lo.attributes_mut().bfyx_only_layer = true;
        }

        let in_data_flow = program.node(node_id).is_in_data_flow();
        if in_data_flow && !fsv16_compatible(tag) {
            can_use_fsv16 = false;
        }
        if in_data_flow && !bsv16_fsv16_compatible(tag) {
            can_use_bs_fs_yx_bsv16_fsv16 = false;
        }

        if tag == KindTag::Quantize {
            let out_dt = program.get_output_layout(node_id)?.data_type;
            if out_dt.is_quantized() {
                is_quantized_int8_model = true;
            }
        }
        if tag == KindTag::Crop {
            total_crop_layers += 1;
        }
    }

    let total_conv_layers = lo.total_conv_count();
    let cond_denom = if total_conv_layers > 0 {
        1.0f32 / total_conv_layers as f32
    } else {
        1.0f32
    };
    let num_of_conv_b_fs_yx_fsv16 = lo.optimized_conv_count(Format::BFsYxFsv16);

    let should_use_b_fs_yx_fsv16_conv = is_quantized_int8_model
        || (can_use_fsv16
            && total_conv_layers > 11
            && (num_of_conv_b_fs_yx_fsv16 as f32 * cond_denom > 0.5f32
                || opt_deconv_layers_b_fs_yx_fsv16 >= 1)
            && num_of_conv_b_fs_yx_fsv16 * 2 > total_crop_layers);

    let should_use_fs_b_yx_fsv32_conv = total_conv_layers > 11
        && total_grouped_conv_layers == 0
        && (total_1x1_fm_conv_layers as f32 * cond_denom) < 0.8f32;

    let should_use_b_fs_zyx_fsv32_conv = total_asym_quantized_conv_layers > 1;

    let should_use_bs_fs_yx_bsv16_fsv16 = can_use_bs_fs_yx_bsv16_fsv16
        && total_conv_layers > 11
        && total_conv_layers == lo.optimized_conv_count(Format::BsFsYxBsv16Fsv16)
        && total_grouped_conv_layers == 0
        && total_dw_splitted_conv_layers == 0
        && total_dw_conv_layers == 0;

    if should_use_fs_b_yx_fsv32_conv {
        lo.attributes_mut().fs_b_yx_fsv32_network = true;
    }
    if should_use_b_fs_zyx_fsv32_conv {
        lo.attributes_mut().b_fs_zyx_fsv32_network = true;
    }
    if should_use_b_fs_yx_fsv16_conv {
        lo.attributes_mut().b_fs_yx_fsv16_network = true;
    }
    if lo.optimized_conv_count(Format::BFsZyxFsv16) >= 1 || opt_deconv_layers_b_fs_zyx_fsv16 >= 1 {
        lo.attributes_mut().b_fs_zyx_fsv16_network = true;
    }
    if should_use_bs_fs_yx_bsv16_fsv16 {
        lo.attributes_mut().bs_fs_yx_bsv16_fsv16_network = true;
    }

    let engine = program.engine().clone();
    if engine.device_info().supports_immad
        && engine.configuration().queue_type == QueueType::InOrder
    {
        lo.attributes_mut().use_onednn_impls = true;
    }

    // the attributes are final now; refresh every convolution's preferred
    // formats so later per-node queries see the post-decision state
    let order = program.processing_order().to_vec();
    for node_id in order {
        let desc = program.node(node_id).desc().clone();
        if let PrimitiveKind::Convolution(params) = &desc.kind {
            let input = program.dep_layout(node_id, 0)?;
            let weights = program.dep_layout(node_id, 1)?;
            lo.update_formats_map(&desc.id, params, &input, &weights);
        }
    }

    Ok(())
}

/// Kinds known to run correctly in feature-blocked fsv16 layouts.
fn fsv16_compatible(tag: KindTag) -> bool {
    !matches!(
        tag,
        KindTag::Gemm | KindTag::Assign | KindTag::ReadValue | KindTag::Split
    )
}

/// Kinds allowed in the double-blocked bsv16_fsv16 layout; stricter than
/// fsv16 because batched blocking breaks axis-addressed kinds.
fn bsv16_fsv16_compatible(tag: KindTag) -> bool {
    matches!(
        tag,
        KindTag::Convolution
            | KindTag::Pooling
            | KindTag::Eltwise
            | KindTag::Reorder
            | KindTag::Permute
            | KindTag::Reshape
            | KindTag::InputLayout
            | KindTag::Activation
            | KindTag::Softmax
            | KindTag::FullyConnected
            | KindTag::GenericLayer
            | KindTag::Quantize
    )
}
