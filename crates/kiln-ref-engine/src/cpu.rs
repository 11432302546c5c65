//! The host engine: constant evaluation over f32 payloads, byte-counting
//! allocation, and a kernel selector that names host kernels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kiln::engine::{
    AllocationType, ConstInput, DeviceInfo, DeviceType, Engine, EngineConfig, KernelSelector,
    Memory, QueueType, SelectedImpl, SelectionContext, Stream,
};
use kiln::error::{GraphError, GraphResult};
use kiln::primitive::{ActivationFunc, EltwiseOp, PrimitiveDescriptor, PrimitiveKind};
use kiln::registry;
use kiln::tensor::Layout;

pub struct RefEngine {
    device: DeviceInfo,
    config: EngineConfig,
    selector: RefSelector,
    used_host: AtomicU64,
    used_device: AtomicU64,
}

impl RefEngine {
    pub fn new() -> Self {
        Self {
            device: DeviceInfo {
                max_alloc_mem_size: 4 << 30,
                max_global_mem_size: 8 << 30,
                device_type: DeviceType::DiscreteGpu,
                supports_usm_device: true,
                supports_immad: false,
            },
            config: EngineConfig::default(),
            selector: RefSelector::default(),
            used_host: AtomicU64::new(0),
            used_device: AtomicU64::new(0),
        }
    }

    pub fn with_profiling(mut self) -> Self {
        self.config.enable_profiling = true;
        self
    }

    pub fn with_queue(mut self, queue_type: QueueType) -> Self {
        self.config.queue_type = queue_type;
        self
    }

    pub fn with_device_info(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    /// Makes the selector ask for plain-format weight reorders, exercising
    /// the post-optimize weights path.
    pub fn with_weights_reorder_requests(mut self) -> Self {
        self.selector.request_weights_reorder = true;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Engine> {
        Arc::new(self)
    }
}

impl Default for RefEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for RefEngine {
    fn device_info(&self) -> DeviceInfo {
        self.device.clone()
    }

    fn configuration(&self) -> EngineConfig {
        self.config.clone()
    }

    fn create_stream(&self) -> Box<dyn Stream> {
        Box::new(RefStream)
    }

    fn selector(&self) -> &dyn KernelSelector {
        &self.selector
    }

    fn evaluate_constant(
        &self,
        desc: &PrimitiveDescriptor,
        inputs: &[ConstInput<'_>],
    ) -> GraphResult<Vec<u8>> {
        evaluate(desc, inputs)
    }

    fn allocate_and_upload(
        &self,
        layout: &Layout,
        data: &[u8],
        alloc_type: AllocationType,
    ) -> GraphResult<Arc<dyn Memory>> {
        let bytes = layout.bytes_count().max(data.len() as u64);
        match alloc_type {
            AllocationType::UsmDevice => self.used_device.fetch_add(bytes, Ordering::Relaxed),
            _ => self.used_host.fetch_add(bytes, Ordering::Relaxed),
        };
        Ok(Arc::new(RefMemory {
            layout: layout.clone(),
            alloc_type,
        }))
    }

    fn used_memory(&self, alloc_type: AllocationType) -> u64 {
        match alloc_type {
            AllocationType::UsmDevice => self.used_device.load(Ordering::Relaxed),
            _ => self.used_host.load(Ordering::Relaxed),
        }
    }

    fn compile_kernels(&self, _kernel_names: &[String]) -> GraphResult<()> {
        Ok(())
    }
}

pub struct RefStream;

impl Stream for RefStream {
    fn finish(&self) {}
}

struct RefMemory {
    layout: Layout,
    alloc_type: AllocationType,
}

impl Memory for RefMemory {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn allocation_type(&self) -> AllocationType {
        self.alloc_type
    }
}

/// Names a host kernel for every node; forced keys win verbatim.
#[derive(Default)]
pub struct RefSelector {
    pub request_weights_reorder: bool,
}

impl KernelSelector for RefSelector {
    fn select(&self, cx: &SelectionContext<'_>) -> GraphResult<SelectedImpl> {
        if let Some(forced) = cx.forced {
            return Ok(SelectedImpl {
                kernel_name: forced.to_string(),
                is_cpu: true,
                weights_reorder: None,
            });
        }
        let weights_reorder = if self.request_weights_reorder
            && matches!(
                cx.kind,
                kiln::primitive::KindTag::Convolution | kiln::primitive::KindTag::FullyConnected
            ) {
            cx.input_layouts.get(1).map(|w| {
                Layout::new(w.data_type, kiln::tensor::Format::Bfyx, w.size)
            })
        } else {
            None
        };
        Ok(SelectedImpl {
            kernel_name: format!(
                "{}_ref_{}",
                cx.kind.as_str(),
                cx.output_layout.format.as_str()
            ),
            is_cpu: true,
            weights_reorder,
        })
    }
}

// ---- host constant evaluation ------------------------------------------

fn evaluate(desc: &PrimitiveDescriptor, inputs: &[ConstInput<'_>]) -> GraphResult<Vec<u8>> {
    match &desc.kind {
        PrimitiveKind::Data { payload, .. } => Ok(payload.as_ref().clone()),
        PrimitiveKind::Eltwise { op } => {
            let a = as_f32(desc, inputs, 0)?;
            let b = as_f32(desc, inputs, 1)?;
            let len = a.len().max(b.len());
            let out: Vec<f32> = (0..len)
                .map(|i| {
                    let x = a[i % a.len()];
                    let y = b[i % b.len()];
                    match op {
                        EltwiseOp::Add => x + y,
                        EltwiseOp::Sub => x - y,
                        EltwiseOp::Mul => x * y,
                        EltwiseOp::Div => x / y,
                        EltwiseOp::Max => x.max(y),
                        EltwiseOp::Min => x.min(y),
                    }
                })
                .collect();
            Ok(to_bytes(&out))
        }
        PrimitiveKind::Activation { func, params } => {
            let a = as_f32(desc, inputs, 0)?;
            let out: Vec<f32> = a
                .iter()
                .map(|&x| match func {
                    ActivationFunc::None => x,
                    ActivationFunc::Relu => x.max(0.0),
                    ActivationFunc::ReluNegativeSlope => {
                        if x >= 0.0 {
                            x
                        } else {
                            x * params.a
                        }
                    }
                    ActivationFunc::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                    ActivationFunc::Tanh => x.tanh(),
                    ActivationFunc::Elu => {
                        if x >= 0.0 {
                            x
                        } else {
                            params.a * (x.exp() - 1.0)
                        }
                    }
                    ActivationFunc::Clamp => x.clamp(params.a, params.b),
                    ActivationFunc::HSwish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
                })
                .collect();
            Ok(to_bytes(&out))
        }
        PrimitiveKind::Reorder { target } | PrimitiveKind::GenericLayer { target } => {
            // host evaluation never re-tiles; resize to the target byte count
            let input = inputs.first().ok_or_else(|| missing_input(desc))?;
            let mut out = input.data.to_vec();
            out.resize(target.bytes_count() as usize, 0);
            Ok(out)
        }
        PrimitiveKind::Crop { reference, offsets } => {
            let input = inputs.first().ok_or_else(|| missing_input(desc))?;
            crop_bfyx(desc, input, *reference, *offsets)
        }
        PrimitiveKind::Concatenation { .. } => {
            let mut out = Vec::new();
            for input in inputs {
                out.extend_from_slice(input.data);
            }
            Ok(out)
        }
        _ => {
            // kinds without host semantics produce zeroed buffers of the
            // inferred size
            let layouts: Vec<Layout> = inputs.iter().map(|i| i.layout.clone()).collect();
            let layout = registry::infer_layout(desc, &layouts)?;
            Ok(vec![0u8; layout.bytes_count() as usize])
        }
    }
}

fn missing_input(desc: &PrimitiveDescriptor) -> GraphError {
    GraphError::Engine {
        node: desc.id.clone(),
        details: "host evaluation requires an input payload".into(),
    }
}

fn as_f32(
    desc: &PrimitiveDescriptor,
    inputs: &[ConstInput<'_>],
    idx: usize,
) -> GraphResult<Vec<f32>> {
    let input = inputs.get(idx).ok_or_else(|| missing_input(desc))?;
    if input.data.len() % 4 != 0 || input.data.is_empty() {
        return Err(GraphError::Engine {
            node: desc.id.clone(),
            details: format!("input {idx} is not an f32 payload"),
        });
    }
    Ok(input
        .data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Row-major bfyx crop on raw bytes.
fn crop_bfyx(
    desc: &PrimitiveDescriptor,
    input: &ConstInput<'_>,
    reference: kiln::tensor::TensorDims,
    offsets: kiln::tensor::TensorDims,
) -> GraphResult<Vec<u8>> {
    let elem = input.layout.data_type.size_in_bytes();
    let src = input.layout.size;
    let expected = (src.count().max(0) as usize) * elem;
    if input.data.len() < expected {
        return Err(GraphError::Engine {
            node: desc.id.clone(),
            details: "crop input payload shorter than its layout".into(),
        });
    }
    let (sy, sx) = (src.spatial[1], src.spatial[0]);
    let mut out =
        Vec::with_capacity((reference.count().max(0) as usize) * elem);
    for b in 0..reference.batch {
        for f in 0..reference.feature {
            for y in 0..reference.spatial[1] {
                for x in 0..reference.spatial[0] {
                    let sb = b + offsets.batch;
                    let sf = f + offsets.feature;
                    let syy = y + offsets.spatial[1];
                    let sxx = x + offsets.spatial[0];
                    let index = (((sb * src.feature + sf) * sy + syy) * sx + sxx) as usize;
                    out.extend_from_slice(&input.data[index * elem..(index + 1) * elem]);
                }
            }
        }
    }
    Ok(out)
}
