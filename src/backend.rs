use std::env;

use crate::backend_trait::{BackendError, BackendResult};
use crate::cpu_backend::CpuBackend;
#[cfg(feature = "cuda")]
use crate::cuda_backend::CudaBackend;

/// Environment variable forcing a backend: `cpu`, `cuda` or `cuda:N`.
pub const DEVICE_ENV: &str = "GLLM_DEVICE";

pub enum BackendKind {
    #[cfg(feature = "cuda")]
    Cuda(CudaBackend),
    Cpu(CpuBackend),
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "cuda")]
            BackendKind::Cuda(_) => "cuda",
            BackendKind::Cpu(_) => "cpu-reference",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOverride {
    Cpu,
    Cuda(usize),
}

pub fn parse_device_override(value: &str) -> BackendResult<DeviceOverride> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("cpu") {
        return Ok(DeviceOverride::Cpu);
    }
    if value.eq_ignore_ascii_case("cuda") {
        return Ok(DeviceOverride::Cuda(0));
    }
    if let Some((prefix, idx)) = value.split_once(':') {
        if prefix.eq_ignore_ascii_case("cuda") {
            return idx
                .parse::<usize>()
                .map(DeviceOverride::Cuda)
                .map_err(|_| BackendError::InvalidBackendOverride(value.to_string()));
        }
    }
    Err(BackendError::InvalidBackendOverride(value.to_string()))
}

/// Picks a backend from `GLLM_DEVICE`, otherwise CUDA device 0 when it can be
/// initialized, otherwise the host reference backend.
pub fn auto_select_backend() -> BackendResult<BackendKind> {
    select_backend(env::var(DEVICE_ENV).ok().as_deref())
}

pub fn select_backend(device_override: Option<&str>) -> BackendResult<BackendKind> {
    match device_override.map(parse_device_override).transpose()? {
        Some(DeviceOverride::Cpu) => Ok(BackendKind::Cpu(CpuBackend::new())),
        Some(DeviceOverride::Cuda(ordinal)) => cuda_backend(ordinal),
        None => Ok(probe_default()),
    }
}

#[cfg(feature = "cuda")]
fn cuda_backend(ordinal: usize) -> BackendResult<BackendKind> {
    Ok(BackendKind::Cuda(CudaBackend::new(ordinal)?))
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend(_ordinal: usize) -> BackendResult<BackendKind> {
    Err(BackendError::Unimplemented(
        "cuda backend (build with the `cuda` feature)",
    ))
}

#[cfg(feature = "cuda")]
fn probe_default() -> BackendKind {
    match CudaBackend::new(0) {
        Ok(cuda) => BackendKind::Cuda(cuda),
        Err(err) => {
            log::warn!("CUDA backend unavailable ({err}), using the host reference backend");
            BackendKind::Cpu(CpuBackend::new())
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn probe_default() -> BackendKind {
    BackendKind::Cpu(CpuBackend::new())
}
