//! CUDA backend for the weight-only GEMM dispatcher.
//!
//! One backend drives one device. Contexts are created once per ordinal and
//! shared process-wide. A dispatch allocates and launches on the stream
//! `bind_device` returned, so [`CudaBackend::set_current_stream`] only
//! affects later calls; uploads and downloads use the current stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use cudarc::driver::{result, CudaContext, CudaSlice, CudaStream, DevicePtr, DevicePtrMut};
use cudarc::nvrtc::Ptx;

use crate::backend_trait::{BackendError, BackendResult, QuantGemmBackend};
use crate::cuda_kernels::{detect_sm_version, ptx_from_env, PtxCollection, WoqGemmKernels, KERNELS_PTX_ENV};
use crate::gpu_types::{Device, HostStorage, HostTensor, TensorDtype, TensorView};
use crate::kernel_types::{DevicePointers, GemmLaunch, KernelStrategy, WeightOnlyParams};
use crate::types::SmArch;
use crate::validation::check_contiguous;

static CONTEXTS: OnceLock<Mutex<HashMap<usize, Arc<CudaContext>>>> = OnceLock::new();

/// Shared context for `ordinal`, created on first use.
pub fn context_for(ordinal: usize) -> BackendResult<Arc<CudaContext>> {
    let cache = CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(ctx) = cache.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }
    let ctx = CudaContext::new(ordinal)?;
    cache.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

/// Dense device buffer with tensor metadata.
#[derive(Debug)]
pub struct CudaTensor {
    data: CudaSlice<u8>,
    shape: Vec<usize>,
    dtype: TensorDtype,
    device: Device,
}

impl CudaTensor {
    pub fn data(&self) -> &CudaSlice<u8> {
        &self.data
    }
}

impl TensorView for CudaTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    fn device(&self) -> Device {
        self.device
    }

    fn is_contiguous(&self) -> bool {
        true
    }
}

pub struct CudaBackend {
    ordinal: usize,
    ctx: Arc<CudaContext>,
    arch: SmArch,
    stream: Mutex<Arc<CudaStream>>,
    kernels: WoqGemmKernels,
}

impl CudaBackend {
    /// Loads kernels from `GLLM_WOQ_KERNELS_PTX`.
    pub fn new(ordinal: usize) -> BackendResult<Self> {
        let ctx = context_for(ordinal)?;
        let arch = detect_sm_version(&ctx)?;
        let ptx = ptx_from_env(arch)?.ok_or_else(|| {
            BackendError::PtxLoad(format!(
                "{KERNELS_PTX_ENV} is not set and no kernel collection was registered"
            ))
        })?;
        Self::with_context(ordinal, ctx, arch, ptx)
    }

    /// Loads the best PTX of `collection` for the device.
    pub fn with_collection(ordinal: usize, collection: &PtxCollection) -> BackendResult<Self> {
        let ctx = context_for(ordinal)?;
        let arch = detect_sm_version(&ctx)?;
        let ptx = collection.load(arch)?;
        Self::with_context(ordinal, ctx, arch, ptx)
    }

    pub fn with_ptx(ordinal: usize, ptx: Ptx) -> BackendResult<Self> {
        let ctx = context_for(ordinal)?;
        let arch = detect_sm_version(&ctx)?;
        Self::with_context(ordinal, ctx, arch, ptx)
    }

    fn with_context(ordinal: usize, ctx: Arc<CudaContext>, arch: SmArch, ptx: Ptx) -> BackendResult<Self> {
        let kernels = WoqGemmKernels::load(&ctx, ptx)?;
        let stream = ctx.new_stream()?;
        log::info!("CUDA weight-only GEMM backend ready on cuda:{ordinal} ({arch})");
        Ok(Self {
            ordinal,
            ctx,
            arch,
            stream: Mutex::new(stream),
            kernels,
        })
    }

    pub fn is_available() -> bool {
        result::init().is_ok()
            && result::device::get_count().map(|n| n > 0).unwrap_or(false)
    }

    pub fn arch(&self) -> SmArch {
        self.arch
    }

    pub fn device(&self) -> Device {
        Device::Cuda(self.ordinal)
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    pub fn current_stream(&self) -> Arc<CudaStream> {
        Arc::clone(&self.stream_slot())
    }

    /// Makes `stream` the one later dispatches bind to.
    pub fn set_current_stream(&self, stream: Arc<CudaStream>) {
        *self.stream_slot() = stream;
    }

    fn stream_slot(&self) -> MutexGuard<'_, Arc<CudaStream>> {
        self.stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_device(&self, device: Device) -> BackendResult<()> {
        if device != self.device() {
            return Err(BackendError::DeviceMismatch {
                tensor: "target",
                expected: self.device().to_string(),
                actual: device,
            });
        }
        Ok(())
    }

    fn launch(
        &self,
        stream: &Arc<CudaStream>,
        strategy: KernelStrategy,
        launch: GemmLaunch<'_, CudaTensor>,
    ) -> BackendResult<()> {
        let workspace_bytes = launch.workspace_bytes();
        let (activation, _act_sync) = launch.activation.data.device_ptr(stream);
        let (weight, _weight_sync) = launch.weight.data.device_ptr(stream);
        let (scales, _scales_sync) = launch.scales.data.device_ptr(stream);
        let bias = launch.bias.map(|b| b.data.device_ptr(stream));
        let workspace = launch.workspace.map(|ws| ws.data.device_ptr_mut(stream));
        let (output, _out_sync) = launch.output.data.device_ptr_mut(stream);

        let params = WeightOnlyParams::new(
            &launch.problem,
            launch.variant,
            DevicePointers {
                activation,
                weight,
                scales,
                bias: bias.as_ref().map(|(ptr, _)| *ptr),
                output,
                workspace: workspace.as_ref().map(|(ptr, _)| (*ptr, workspace_bytes)),
            },
        )?;
        self.kernels
            .launch(stream, strategy, launch.variant, &launch.problem, &params)
    }
}

impl QuantGemmBackend for CudaBackend {
    type Tensor = CudaTensor;
    type Stream = Arc<CudaStream>;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn bind_device(&self, device: Device) -> BackendResult<Arc<CudaStream>> {
        self.check_device(device)?;
        self.ctx.bind_to_thread()?;
        Ok(self.current_stream())
    }

    fn empty(&self, stream: &Arc<CudaStream>, shape: &[usize], dtype: TensorDtype) -> BackendResult<CudaTensor> {
        let device = self.device();
        let bytes = shape.iter().product::<usize>() * dtype.size_in_bytes();
        let data = stream
            .alloc_zeros::<u8>(bytes)
            .map_err(|e| BackendError::AllocationFailed {
                bytes,
                device,
                reason: format!("{e:?}"),
            })?;
        log::debug!("cuda alloc {shape:?} {dtype} on {device} ({bytes} bytes)");
        Ok(CudaTensor {
            data,
            shape: shape.to_vec(),
            dtype,
            device,
        })
    }

    fn upload(&self, host: &HostTensor, device: Device) -> BackendResult<CudaTensor> {
        self.check_device(device)?;
        check_contiguous(host, "upload source")?;
        let data = self.current_stream().clone_htod(host.as_bytes())?;
        Ok(CudaTensor {
            data,
            shape: host.shape().to_vec(),
            dtype: host.dtype(),
            device,
        })
    }

    fn download(&self, tensor: &CudaTensor) -> BackendResult<HostTensor> {
        let bytes = self.current_stream().clone_dtoh(&tensor.data)?;
        HostTensor::new(HostStorage::from_le_bytes(tensor.dtype, &bytes)?, &tensor.shape)
    }

    fn launch_batched_gemv(&self, stream: &Arc<CudaStream>, launch: GemmLaunch<'_, CudaTensor>) -> BackendResult<()> {
        self.launch(stream, KernelStrategy::BatchedGemv, launch)
    }

    fn launch_tiled_gemm(&self, stream: &Arc<CudaStream>, launch: GemmLaunch<'_, CudaTensor>) -> BackendResult<()> {
        self.launch(stream, KernelStrategy::TiledGemm, launch)
    }
}
