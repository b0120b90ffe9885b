use thiserror::Error;

use crate::gpu_types::{Device, HostTensor, TensorDtype, TensorView};
use crate::kernel_types::GemmLaunch;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported weight bit width {0}: expected 4 or 8")]
    UnsupportedBits(u32),
    #[error("unsupported architecture sm_{arch}: supported range is [sm_{min}, sm_{max})")]
    UnsupportedArch { arch: u32, min: u32, max: u32 },
    #[error("unsupported group size {group_size} for k = {k}: per-group scales require 64 or 128")]
    UnsupportedGroupSize { group_size: usize, k: usize },
    #[error("{tensor} must have dtype {expected}, got {actual}")]
    DtypeMismatch {
        tensor: &'static str,
        expected: TensorDtype,
        actual: TensorDtype,
    },
    #[error("{tensor} must be on {expected}, got {actual}")]
    DeviceMismatch {
        tensor: &'static str,
        expected: String,
        actual: Device,
    },
    #[error("{tensor} must be contiguous")]
    NotContiguous { tensor: &'static str },
    #[error("{tensor} must have shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{tensor} must have rank {expected}, got rank {actual}")]
    RankMismatch {
        tensor: &'static str,
        expected: &'static str,
        actual: usize,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("allocation of {bytes} bytes on {device} failed: {reason}")]
    AllocationFailed {
        bytes: usize,
        device: Device,
        reason: String,
    },
    #[error("cuda driver error: {0}")]
    Cuda(String),
    #[error("kernel launch failed: {0}")]
    KernelLaunch(String),
    #[error("missing kernel symbol: {0}")]
    KernelMissing(String),
    #[error("PTX loading error: {0}")]
    PtxLoad(String),
    #[error("invalid backend override: {0}")]
    InvalidBackendOverride(String),
    #[error("unimplemented backend feature: {0}")]
    Unimplemented(&'static str),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Coarse classification callers use to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad arguments; nothing was allocated or launched.
    Precondition,
    ResourceExhausted,
    /// The kernel runtime reported a failure.
    Kernel,
}

impl BackendError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BackendError::UnsupportedBits(_)
            | BackendError::UnsupportedArch { .. }
            | BackendError::UnsupportedGroupSize { .. }
            | BackendError::DtypeMismatch { .. }
            | BackendError::DeviceMismatch { .. }
            | BackendError::NotContiguous { .. }
            | BackendError::ShapeMismatch { .. }
            | BackendError::RankMismatch { .. }
            | BackendError::InvalidConfig(_)
            | BackendError::InvalidBackendOverride(_) => ErrorCategory::Precondition,
            BackendError::AllocationFailed { .. } => ErrorCategory::ResourceExhausted,
            BackendError::Cuda(_)
            | BackendError::KernelLaunch(_)
            | BackendError::KernelMissing(_)
            | BackendError::PtxLoad(_)
            | BackendError::Unimplemented(_) => ErrorCategory::Kernel,
        }
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for BackendError {
    fn from(err: cudarc::driver::DriverError) -> Self {
        BackendError::Cuda(format!("{err:?}"))
    }
}

/// Device runtime the quantized GEMM dispatcher drives.
///
/// The dispatcher validates arguments and picks a strategy; a backend owns
/// memory, streams and the two kernel entry points. Launches are enqueued on
/// the stream returned by [`QuantGemmBackend::bind_device`] and are not
/// synchronized by the dispatcher.
pub trait QuantGemmBackend {
    type Tensor: TensorView;
    type Stream;

    fn name(&self) -> &'static str;

    /// Makes `device` current for the calling thread and returns its current
    /// execution stream.
    fn bind_device(&self, device: Device) -> BackendResult<Self::Stream>;

    /// Allocates an uninitialized-by-contract (zeroed in practice) tensor on
    /// the device of `stream`, ordered on `stream`.
    fn empty(&self, stream: &Self::Stream, shape: &[usize], dtype: TensorDtype)
        -> BackendResult<Self::Tensor>;

    /// Copies run on the backend's current stream at call time.
    fn upload(&self, host: &HostTensor, device: Device) -> BackendResult<Self::Tensor>;

    fn download(&self, tensor: &Self::Tensor) -> BackendResult<HostTensor>;

    fn launch_batched_gemv(
        &self,
        stream: &Self::Stream,
        launch: GemmLaunch<'_, Self::Tensor>,
    ) -> BackendResult<()>;

    fn launch_tiled_gemm(
        &self,
        stream: &Self::Stream,
        launch: GemmLaunch<'_, Self::Tensor>,
    ) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            BackendError::UnsupportedBits(3).category(),
            ErrorCategory::Precondition
        );
        assert_eq!(
            BackendError::AllocationFailed {
                bytes: 1 << 22,
                device: Device::Cuda(0),
                reason: "out of memory".into(),
            }
            .category(),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            BackendError::KernelLaunch("illegal address".into()).category(),
            ErrorCategory::Kernel
        );
    }

    #[test]
    fn messages_name_the_tensor() {
        let err = BackendError::ShapeMismatch {
            tensor: "bias",
            expected: vec![64],
            actual: vec![65],
        };
        assert_eq!(err.to_string(), "bias must have shape [64], got [65]");

        let err = BackendError::DeviceMismatch {
            tensor: "activation",
            expected: "an accelerator".into(),
            actual: Device::Cpu,
        };
        assert_eq!(err.to_string(), "activation must be on an accelerator, got cpu");
    }
}
