//! Strategy thresholds for the quantized GEMM dispatcher.

use std::env;

use crate::backend_trait::{BackendError, BackendResult};
use crate::kernel_types::MIN_TILED_WORKSPACE_BYTES;

/// Largest activation row count served by the batched GEMV kernel.
pub const GEMV_MAX_M: usize = 4;
/// Scratch workspace handed to the tiled GEMM kernel (4 MiB).
pub const TILED_WORKSPACE_BYTES: usize = 1 << 22;

pub const GEMV_MAX_M_ENV: &str = "GLLM_WOQ_GEMV_MAX_M";
pub const WORKSPACE_BYTES_ENV: &str = "GLLM_WOQ_WORKSPACE_BYTES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub gemv_max_m: usize,
    pub workspace_bytes: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            gemv_max_m: GEMV_MAX_M,
            workspace_bytes: TILED_WORKSPACE_BYTES,
        }
    }
}

impl DispatchPolicy {
    /// Defaults overridden by `GLLM_WOQ_GEMV_MAX_M` / `GLLM_WOQ_WORKSPACE_BYTES`.
    pub fn from_env() -> BackendResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`DispatchPolicy::from_env`] with a caller-supplied variable source.
    pub fn from_lookup<F>(lookup: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut policy = Self::default();
        if let Some(value) = lookup(GEMV_MAX_M_ENV) {
            policy.gemv_max_m = parse_usize(GEMV_MAX_M_ENV, &value)?;
        }
        if let Some(value) = lookup(WORKSPACE_BYTES_ENV) {
            policy.workspace_bytes = parse_usize(WORKSPACE_BYTES_ENV, &value)?;
        }
        policy.validate()?;
        if policy != Self::default() {
            log::info!(
                "quant GEMM policy override: gemv_max_m={}, workspace_bytes={}",
                policy.gemv_max_m,
                policy.workspace_bytes
            );
        }
        Ok(policy)
    }

    pub fn validate(&self) -> BackendResult<()> {
        if self.workspace_bytes < MIN_TILED_WORKSPACE_BYTES {
            return Err(BackendError::InvalidConfig(format!(
                "tiled GEMM workspace of {} bytes is below the {MIN_TILED_WORKSPACE_BYTES}-byte minimum",
                self.workspace_bytes
            )));
        }
        Ok(())
    }
}

fn parse_usize(name: &str, value: &str) -> BackendResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| BackendError::InvalidConfig(format!("{name}={value:?} is not an unsigned integer")))
}
