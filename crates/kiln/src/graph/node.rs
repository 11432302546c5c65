//! Program nodes: mutable vertices wrapping one primitive descriptor.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::engine::{Memory, SelectedImpl};
use crate::primitive::{
    ActivationFunc, ActivationParams, KindTag, PrimitiveDescriptor, PrimitiveId,
};
use crate::registry::FuseParams;
use crate::tensor::{DType, Format, Layout, Padding, TensorDims};

/// Dense handle into the program's node arena. Edges are stored as these
/// indices, which keeps dependency/user back-references plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Activation folded directly into a host kernel.
#[derive(Debug, Clone, Copy)]
pub struct FusedActivation {
    pub func: ActivationFunc,
    pub params: ActivationParams,
}

/// Record of a peer primitive absorbed by fusion.
#[derive(Clone)]
pub struct FusedPrimitiveDesc {
    pub desc: PrimitiveDescriptor,
    pub fuse_params: Option<FuseParams>,
    /// Layout of the peer's first input at fusion time.
    pub input_layout: Layout,
    pub output_layout: Layout,
    pub activation: ActivationFunc,
    pub activation_params: ActivationParams,
    /// Index of the first host dependency contributed by the peer.
    pub dep_start_idx: usize,
    pub total_num_deps: usize,
    /// Surviving peer dependencies appended to the host, with their original
    /// position in the peer's input list.
    pub deps: Vec<(PrimitiveId, usize)>,
    /// Transitively fused peers inherited through the fusing history.
    pub fused_deps: HashMap<PrimitiveId, usize>,
}

/// Quantize analysis state derived by `prepare_quantization` and consumed by
/// the fusing engine's input drop table.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizeOpt {
    pub scale_shift_opt: bool,
    pub need_clamp: bool,
    pub need_pre_shift: bool,
    pub need_post_scale: bool,
    pub need_post_shift: bool,
    pub per_tensor_input_scale: bool,
    pub per_tensor_input_shift: bool,
    pub per_tensor_output_scale: bool,
    pub per_tensor_output_shift: bool,
    pub per_tensor_output_range: bool,
    pub output_lo: f32,
    pub output_hi: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImplTypeHint {
    #[default]
    Ocl,
    Onednn,
}

/// A mutable vertex of the program graph.
///
/// Edge invariant: `a` appears in `b.dependencies` iff `b` appears in
/// `a.users`; both sides are maintained exclusively by the program's
/// structural-edit API.
pub struct Node {
    pub(crate) desc: PrimitiveDescriptor,
    pub(crate) dependencies: Vec<NodeId>,
    pub(crate) users: SmallVec<[NodeId; 4]>,
    pub(crate) layout: Layout,
    pub(crate) valid_output_layout: bool,
    pub(crate) constant: bool,
    pub(crate) data_flow: bool,
    /// Scratch mark for traversals; owned by whichever pass is running.
    pub(crate) user_mark: bool,
    pub(crate) output: bool,
    /// Set when the node's buffer aliases a neighbor (in-place concat/crop).
    pub(crate) can_be_optimized: bool,
    pub(crate) selected_impl: Option<SelectedImpl>,
    pub(crate) fused_primitives: Vec<FusedPrimitiveDesc>,
    pub(crate) fused_activations: Vec<FusedActivation>,
    pub(crate) quantize: Option<QuantizeOpt>,
    pub(crate) impl_hint: ImplTypeHint,
    pub(crate) preferred_input_format: Format,
    pub(crate) preferred_output_format: Format,
    /// Ids whose output memory must not alias this node's output.
    pub(crate) memory_dependencies: BTreeSet<PrimitiveId>,
    pub(crate) attached_memory: Option<Arc<dyn Memory>>,
    /// Output stride override planted by eltwise shrinking.
    pub(crate) eltwise_stride: Option<[i64; 3]>,
}

impl Node {
    pub(crate) fn new(desc: PrimitiveDescriptor) -> Self {
        Self {
            desc,
            dependencies: Vec::new(),
            users: SmallVec::new(),
            layout: dummy_layout(),
            valid_output_layout: false,
            constant: false,
            data_flow: false,
            user_mark: false,
            output: false,
            can_be_optimized: false,
            selected_impl: None,
            fused_primitives: Vec::new(),
            fused_activations: Vec::new(),
            quantize: None,
            impl_hint: ImplTypeHint::default(),
            preferred_input_format: Format::Any,
            preferred_output_format: Format::Any,
            memory_dependencies: BTreeSet::new(),
            attached_memory: None,
            eltwise_stride: None,
        }
    }

    pub fn id(&self) -> &PrimitiveId {
        &self.desc.id
    }

    pub fn desc(&self) -> &PrimitiveDescriptor {
        &self.desc
    }

    pub fn kind_tag(&self) -> KindTag {
        self.desc.kind_tag()
    }

    pub fn is_kind(&self, tag: KindTag) -> bool {
        self.kind_tag() == tag
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn users(&self) -> &[NodeId] {
        &self.users
    }

    /// Nodes without dependencies act as graph entry points.
    pub fn is_input(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn is_endpoint(&self) -> bool {
        self.users.is_empty()
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn is_in_data_flow(&self) -> bool {
        self.data_flow
    }

    pub fn can_be_optimized(&self) -> bool {
        self.can_be_optimized
    }

    pub fn is_valid_output_layout(&self) -> bool {
        self.valid_output_layout
    }

    /// The current output layout, if it has been computed or assigned.
    pub fn output_layout(&self) -> Option<&Layout> {
        if self.valid_output_layout {
            Some(&self.layout)
        } else {
            None
        }
    }

    /// Layout for reporting paths that must not fail: falls back to a dummy
    /// f32 bfyx 1x1x1x1 value while the real layout is still invalid.
    pub fn output_layout_or_dummy(&self) -> Layout {
        if self.valid_output_layout {
            self.layout.clone()
        } else {
            dummy_layout()
        }
    }

    pub(crate) fn set_output_layout(&mut self, layout: Layout) {
        self.layout = layout;
        self.valid_output_layout = true;
    }

    pub(crate) fn invalidate_output_layout(&mut self) {
        self.valid_output_layout = false;
    }

    pub(crate) fn merge_output_padding(&mut self, padding: Padding) {
        self.layout.padding = Padding::max(&self.layout.padding, &padding);
    }

    pub fn selected_impl(&self) -> Option<&SelectedImpl> {
        self.selected_impl.as_ref()
    }

    pub fn fused_primitives(&self) -> &[FusedPrimitiveDesc] {
        &self.fused_primitives
    }

    pub fn has_fused_primitives(&self) -> bool {
        !self.fused_primitives.is_empty()
    }

    pub fn fused_activations(&self) -> &[FusedActivation] {
        &self.fused_activations
    }

    pub fn add_fused_activation(&mut self, func: ActivationFunc, params: ActivationParams) {
        self.fused_activations.push(FusedActivation { func, params });
    }

    pub fn quantize_opt(&self) -> Option<&QuantizeOpt> {
        self.quantize.as_ref()
    }

    pub fn set_quantize_opt(&mut self, opt: QuantizeOpt) {
        self.quantize = Some(opt);
    }

    pub fn memory_dependencies(&self) -> &BTreeSet<PrimitiveId> {
        &self.memory_dependencies
    }

    /// Device memory attached by the transfer step, if any.
    pub fn attached_memory(&self) -> Option<&Arc<dyn Memory>> {
        self.attached_memory.as_ref()
    }

    pub(crate) fn add_memory_dependency(&mut self, id: PrimitiveId) {
        if &id != self.id() {
            self.memory_dependencies.insert(id);
        }
    }
}

pub(crate) fn dummy_layout() -> Layout {
    Layout::new(DType::F32, Format::Bfyx, TensorDims::ones())
}
