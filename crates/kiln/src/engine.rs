//! Interfaces to the external compute engine.
//!
//! The graph compiler never talks to a device directly: kernel compilation,
//! memory allocation and stream execution are behind the [`Engine`] trait,
//! and kernel choice is behind the opaque [`KernelSelector`] oracle. The
//! reference host implementation lives in the `kiln-ref-engine` crate.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::GraphResult;
use crate::primitive::{KindTag, PrimitiveDescriptor, PrimitiveId};
use crate::tensor::{Format, Layout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    IntegratedGpu,
    DiscreteGpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    InOrder,
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    UsmHost,
    UsmShared,
    UsmDevice,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub max_alloc_mem_size: u64,
    pub max_global_mem_size: u64,
    pub device_type: DeviceType,
    pub supports_usm_device: bool,
    /// Systolic-array support; gates the onednn implementation path.
    pub supports_immad: bool,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub enable_profiling: bool,
    pub queue_type: QueueType,
    pub use_memory_pool: bool,
    pub tuning_cache_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_profiling: false,
            queue_type: QueueType::OutOfOrder,
            use_memory_pool: true,
            tuning_cache_path: None,
        }
    }
}

/// Device memory handle owned by the engine.
pub trait Memory: Send + Sync {
    fn layout(&self) -> &Layout;
    fn allocation_type(&self) -> AllocationType;
}

/// Execution stream; the core only needs the sequential barrier.
pub trait Stream: Send {
    fn finish(&self);
}

/// Kernel implementation chosen for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedImpl {
    pub kernel_name: String,
    pub is_cpu: bool,
    /// Layout the implementation wants its weights reordered into.
    pub weights_reorder: Option<Layout>,
}

/// Everything the selector may inspect about a node, flattened so the oracle
/// stays decoupled from the graph representation.
pub struct SelectionContext<'a> {
    pub id: &'a PrimitiveId,
    pub kind: KindTag,
    pub input_layouts: &'a [Layout],
    pub output_layout: &'a Layout,
    pub preferred_format: Format,
    pub fused_count: usize,
    /// Implementation key forced through build options, if any.
    pub forced: Option<&'a str>,
    pub use_onednn: bool,
    pub tuning: Option<&'a TuningCache>,
}

/// Opaque oracle choosing a kernel variant for a node and layout.
pub trait KernelSelector: Send + Sync {
    fn select(&self, cx: &SelectionContext<'_>) -> GraphResult<SelectedImpl>;
}

/// Host tensor view handed to constant evaluation.
pub struct ConstInput<'a> {
    pub layout: &'a Layout,
    pub data: &'a [u8],
}

/// The external compute engine as consumed by the compiler core.
pub trait Engine: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
    fn configuration(&self) -> EngineConfig;
    fn create_stream(&self) -> Box<dyn Stream>;
    fn selector(&self) -> &dyn KernelSelector;

    /// Evaluates one primitive on host data; used by constant propagation.
    fn evaluate_constant(
        &self,
        desc: &PrimitiveDescriptor,
        inputs: &[ConstInput<'_>],
    ) -> GraphResult<Vec<u8>>;

    /// Allocates device memory and uploads the payload.
    fn allocate_and_upload(
        &self,
        layout: &Layout,
        data: &[u8],
        alloc_type: AllocationType,
    ) -> GraphResult<Arc<dyn Memory>>;

    fn used_memory(&self, alloc_type: AllocationType) -> u64;

    /// Batch-compiles the kernel sources gathered during the compile pass.
    fn compile_kernels(&self, kernel_names: &[String]) -> GraphResult<()>;
}

/// Tuned-kernel lookup table loaded from disk; consumed opaquely by selectors.
#[derive(Debug, Default, Clone)]
pub struct TuningCache {
    pub entries: std::collections::HashMap<String, String>,
}
