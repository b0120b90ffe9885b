//! gllm-quant-matmul: weight-only quantized GEMM for LLM inference.
//!
//! fp16 activations times int4/int8 weights with per-channel or per-group fp16
//! scales:
//! - **Weight preprocessing**: offline repacking of quantized weights into the
//!   tensor-core layout of one GPU generation ([`preprocess_weight`])
//! - **Runtime dispatch**: batched GEMV for up to 4 activation rows, tiled GEMM
//!   with a 4 MiB scratch workspace above that ([`quant_matmul`])
//! - **Pluggable runtime**: memory, streams and kernels live behind
//!   [`QuantGemmBackend`]; a host reference backend is always built, the
//!   cudarc backend sits behind the `cuda` feature
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_quant_matmul::{preprocess_weight, quant_matmul, CpuBackend, Device, QuantGemmBackend};
//!
//! let packed = preprocess_weight(&raw_int4, 4, 80)?;           // [n, k / 2]
//! let backend = CpuBackend::new();
//! let weight = backend.upload(&packed, Device::Cuda(0))?;
//! let out = quant_matmul(&backend, &activation, &weight, &scales, Some(&bias), 4)?;
//! ```

pub mod backend;
pub mod backend_trait;
pub mod cpu_backend;
#[cfg(feature = "cuda")]
pub mod cuda_backend;
#[cfg(feature = "cuda")]
pub mod cuda_kernels;
pub mod dispatch_policy;
pub mod gpu_types;
pub mod kernel_dispatcher;
pub mod kernel_types;
pub mod preprocess;
pub mod types;
pub mod validation;

pub use backend::{auto_select_backend, select_backend, BackendKind, DeviceOverride, DEVICE_ENV};
pub use backend_trait::{BackendError, BackendResult, ErrorCategory, QuantGemmBackend};
pub use cpu_backend::{AllocationRecord, CpuBackend, CpuStream, LaunchRecord};
#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaBackend, CudaTensor};
pub use dispatch_policy::{DispatchPolicy, GEMV_MAX_M, TILED_WORKSPACE_BYTES};
pub use gpu_types::{Device, HostStorage, HostTensor, TensorDtype, TensorView};
pub use kernel_dispatcher::{quant_matmul, DispatchPlan, QuantGemmDispatcher};
pub use kernel_types::{
    GemmLaunch, GemmProblem, GemmVariant, KernelStrategy, WeightElement, WeightOnlyParams,
    WeightOnlyQuantOp, MIN_TILED_WORKSPACE_BYTES,
};
pub use preprocess::{
    pack_weights, preprocess_weight, preprocess_weights_for_mixed_gemm, unpack_preprocessed_weight,
    unpack_weights,
};
pub use types::{
    QuantizationConfig, ScaleGranularity, SmArch, WeightBits, WeightLayout, MAX_SUPPORTED_SM,
    MIN_SUPPORTED_SM, SUPPORTED_GROUP_SIZES,
};
