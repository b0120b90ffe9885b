use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaStream, DeviceRepr, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::Ptx;

use crate::backend_trait::{BackendError, BackendResult};
use crate::kernel_types::{GemmProblem, GemmVariant, KernelStrategy, LaunchGeometry, WeightOnlyParams};

// SAFETY: `WeightOnlyParams` is `#[repr(C)]` and contains only integers.
unsafe impl DeviceRepr for WeightOnlyParams {}

/// The eight weight-only GEMM entry points of one loaded module.
pub struct WoqGemmKernels {
    #[allow(dead_code)]
    module: Arc<CudaModule>,
    functions: HashMap<&'static str, CudaFunction>,
}

impl WoqGemmKernels {
    pub fn load(ctx: &Arc<CudaContext>, ptx: Ptx) -> BackendResult<Self> {
        let module = ctx
            .load_module(ptx)
            .map_err(|e| BackendError::PtxLoad(format!("{e:?}")))?;
        let mut functions = HashMap::new();
        for name in KernelStrategy::all_kernel_names() {
            let func = module
                .load_function(name)
                .map_err(|_| BackendError::KernelMissing(name.to_string()))?;
            functions.insert(name, func);
        }
        log::info!("Loaded {} weight-only GEMM kernels", functions.len());
        Ok(Self { module, functions })
    }

    pub fn function(&self, strategy: KernelStrategy, variant: GemmVariant) -> BackendResult<&CudaFunction> {
        let name = strategy.kernel_name(variant);
        self.functions
            .get(name)
            .ok_or_else(|| BackendError::KernelMissing(name.to_string()))
    }

    /// Enqueues one launch on `stream`; does not synchronize.
    pub fn launch(
        &self,
        stream: &Arc<CudaStream>,
        strategy: KernelStrategy,
        variant: GemmVariant,
        problem: &GemmProblem,
        params: &WeightOnlyParams,
    ) -> BackendResult<()> {
        let func = self.function(strategy, variant)?;
        let geometry = LaunchGeometry::for_problem(strategy, problem)?;
        let cfg = LaunchConfig {
            grid_dim: geometry.grid,
            block_dim: geometry.block,
            shared_mem_bytes: 0,
        };

        let result = unsafe {
            let mut builder = stream.launch_builder(func);
            builder.arg(params);
            builder.launch(cfg)
        };
        result
            .map(|_| ())
            .map_err(|e| BackendError::KernelLaunch(format!("{}: {e:?}", strategy.kernel_name(variant))))
    }
}
