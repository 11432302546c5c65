//! Primitive descriptors: the immutable building blocks of a topology.
//!
//! A descriptor identifies a node by a globally unique string id, carries a
//! kind tag with kind-specific parameters, and declares its inputs in order.
//! Primitive kinds form a closed set, so the kind is a sum type rather than
//! a class hierarchy; per-kind behavior lives in the [`crate::registry`].

use std::sync::Arc;

use crate::tensor::{Axis, DType, Layout, TensorDims};

pub type PrimitiveId = String;

/// Dependency addressed by id plus output port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInput {
    pub id: PrimitiveId,
    pub port: usize,
}

/// Immutable description of one node of the computation graph.
#[derive(Debug, Clone)]
pub struct PrimitiveDescriptor {
    pub id: PrimitiveId,
    /// Ordered inputs; the i-th entry is the i-th dependency.
    pub inputs: Vec<PrimitiveId>,
    /// Port-addressed inputs, populated alongside `inputs` by front ends that
    /// distinguish multiple outputs.
    pub indexed_inputs: Vec<PortInput>,
    pub kind: PrimitiveKind,
}

impl PrimitiveDescriptor {
    pub fn new(id: impl Into<PrimitiveId>, inputs: Vec<PrimitiveId>, kind: PrimitiveKind) -> Self {
        Self {
            id: id.into(),
            inputs,
            indexed_inputs: Vec::new(),
            kind,
        }
    }

    pub fn kind_tag(&self) -> KindTag {
        self.kind.tag()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFunc {
    None,
    Relu,
    ReluNegativeSlope,
    Sigmoid,
    Tanh,
    Elu,
    Clamp,
    HSwish,
}

/// Slope / clamp bounds for parameterized activations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActivationParams {
    pub a: f32,
    pub b: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionParams {
    pub stride: [i64; 3],
    pub pad: [i64; 3],
    pub dilation: [i64; 3],
    pub groups: u32,
    pub deformable: bool,
    /// Asymmetric input padding; when set it overrides `pad` on that side.
    pub pad_above: Option<[i64; 3]>,
    pub pad_below: Option<[i64; 3]>,
    /// Desired output size declared by the front end.
    pub output_size: Option<TensorDims>,
    pub weights_zero_points: bool,
    pub activations_zero_points: bool,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            stride: [1, 1, 1],
            pad: [0, 0, 0],
            dilation: [1, 1, 1],
            groups: 1,
            deformable: false,
            pad_above: None,
            pad_below: None,
            output_size: None,
            weights_zero_points: false,
            activations_zero_points: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeconvolutionParams {
    pub stride: [i64; 3],
    pub pad: [i64; 3],
    pub groups: u32,
    pub output_size: Option<TensorDims>,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        Self {
            stride: [1, 1, 1],
            pad: [0, 0, 0],
            groups: 1,
            output_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingParams {
    pub mode: PoolMode,
    pub size: [i64; 3],
    pub stride: [i64; 3],
    pub pad: [i64; 3],
    pub output_size: Option<TensorDims>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizeParams {
    pub levels: u32,
    pub out_data_type: Option<DType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StridedSliceParams {
    pub begin: TensorDims,
    pub end: TensorDims,
    pub strides: TensorDims,
}

/// The closed set of primitive kinds.
#[derive(Debug, Clone)]
pub enum PrimitiveKind {
    /// Graph input placeholder carrying the declared layout.
    InputLayout { layout: Layout },
    /// Constant tensor with an attached host payload.
    Data {
        layout: Layout,
        payload: Arc<Vec<u8>>,
    },
    /// Externally mutable tensor; stateful, never constant-folded.
    MutableData { layout: Layout },
    Convolution(ConvolutionParams),
    BinaryConvolution(ConvolutionParams),
    Deconvolution(DeconvolutionParams),
    Pooling(PoolingParams),
    Activation {
        func: ActivationFunc,
        params: ActivationParams,
    },
    Eltwise { op: EltwiseOp },
    Quantize(QuantizeParams),
    /// Layout conversion to the embedded target layout.
    Reorder { target: Layout },
    Reshape { out_size: TensorDims },
    Permute { order: [Axis; 5] },
    Concatenation { axis: Axis },
    Crop {
        reference: TensorDims,
        offsets: TensorDims,
    },
    /// Expanded into per-output crops during graph initialization.
    Split {
        output_ids: Vec<PrimitiveId>,
        output_offsets: Vec<TensorDims>,
    },
    FullyConnected,
    Gemm,
    StridedSlice(StridedSliceParams),
    /// Explicit border materialization for asymmetric input padding.
    Border {
        pad_lower: TensorDims,
        pad_upper: TensorDims,
    },
    PriorBox { output_layout: Layout },
    Softmax { axis: Axis },
    Assign { variable_id: String },
    ReadValue { variable_id: String },
    /// Weights-reorder helper inserted by post-optimize passes.
    GenericLayer { target: Layout },
}

/// Discriminant-only view of [`PrimitiveKind`], used as registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KindTag {
    InputLayout,
    Data,
    MutableData,
    Convolution,
    BinaryConvolution,
    Deconvolution,
    Pooling,
    Activation,
    Eltwise,
    Quantize,
    Reorder,
    Reshape,
    Permute,
    Concatenation,
    Crop,
    Split,
    FullyConnected,
    Gemm,
    StridedSlice,
    Border,
    PriorBox,
    Softmax,
    Assign,
    ReadValue,
    GenericLayer,
}

impl PrimitiveKind {
    pub fn tag(&self) -> KindTag {
        match self {
            PrimitiveKind::InputLayout { .. } => KindTag::InputLayout,
            PrimitiveKind::Data { .. } => KindTag::Data,
            PrimitiveKind::MutableData { .. } => KindTag::MutableData,
            PrimitiveKind::Convolution(_) => KindTag::Convolution,
            PrimitiveKind::BinaryConvolution(_) => KindTag::BinaryConvolution,
            PrimitiveKind::Deconvolution(_) => KindTag::Deconvolution,
            PrimitiveKind::Pooling(_) => KindTag::Pooling,
            PrimitiveKind::Activation { .. } => KindTag::Activation,
            PrimitiveKind::Eltwise { .. } => KindTag::Eltwise,
            PrimitiveKind::Quantize(_) => KindTag::Quantize,
            PrimitiveKind::Reorder { .. } => KindTag::Reorder,
            PrimitiveKind::Reshape { .. } => KindTag::Reshape,
            PrimitiveKind::Permute { .. } => KindTag::Permute,
            PrimitiveKind::Concatenation { .. } => KindTag::Concatenation,
            PrimitiveKind::Crop { .. } => KindTag::Crop,
            PrimitiveKind::Split { .. } => KindTag::Split,
            PrimitiveKind::FullyConnected => KindTag::FullyConnected,
            PrimitiveKind::Gemm => KindTag::Gemm,
            PrimitiveKind::StridedSlice(_) => KindTag::StridedSlice,
            PrimitiveKind::Border { .. } => KindTag::Border,
            PrimitiveKind::PriorBox { .. } => KindTag::PriorBox,
            PrimitiveKind::Softmax { .. } => KindTag::Softmax,
            PrimitiveKind::Assign { .. } => KindTag::Assign,
            PrimitiveKind::ReadValue { .. } => KindTag::ReadValue,
            PrimitiveKind::GenericLayer { .. } => KindTag::GenericLayer,
        }
    }
}

impl KindTag {
    pub fn as_str(self) -> &'static str {
        match self {
            KindTag::InputLayout => "input_layout",
            KindTag::Data => "data",
            KindTag::MutableData => "mutable_data",
            KindTag::Convolution => "convolution",
            KindTag::BinaryConvolution => "binary_convolution",
            KindTag::Deconvolution => "deconvolution",
            KindTag::Pooling => "pooling",
            KindTag::Activation => "activation",
            KindTag::Eltwise => "eltwise",
            KindTag::Quantize => "quantize",
            KindTag::Reorder => "reorder",
            KindTag::Reshape => "reshape",
            KindTag::Permute => "permute",
            KindTag::Concatenation => "concatenation",
            KindTag::Crop => "crop",
            KindTag::Split => "split",
            KindTag::FullyConnected => "fully_connected",
            KindTag::Gemm => "gemm",
            KindTag::StridedSlice => "strided_slice",
            KindTag::Border => "border",
            KindTag::PriorBox => "prior_box",
            KindTag::Softmax => "softmax",
            KindTag::Assign => "assign",
            KindTag::ReadValue => "read_value",
            KindTag::GenericLayer => "generic_layer",
        }
    }

    /// Stateful sources are never constant regardless of their dependencies.
    pub fn is_stateful_source(self) -> bool {
        matches!(
            self,
            KindTag::InputLayout
                | KindTag::MutableData
                | KindTag::Assign
                | KindTag::ReadValue
                | KindTag::PriorBox
        )
    }
}
