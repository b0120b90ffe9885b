//! SM-aware PTX selection for the weight-only GEMM kernel module.
//!
//! The kernels are built outside this crate. A module is found either through
//! `GLLM_WOQ_KERNELS_PTX` (a `.ptx` file, or a directory of
//! `woq_gemm_sm{NN}.ptx` files) or through a caller-registered
//! [`PtxCollection`]. PTX built for a lower SM is forward compatible, so the
//! highest available SM not above the GPU's is chosen.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cudarc::driver::{sys, CudaContext};
use cudarc::nvrtc::Ptx;

use crate::backend_trait::{BackendError, BackendResult};
use crate::types::SmArch;

/// SM versions kernel modules are built for, descending.
pub const SUPPORTED_SM_VERSIONS: &[u32] = &[
    89, // Ada Lovelace (RTX 40 series, L4, L40)
    86, // Ampere consumer (RTX 30 series, A10, A40)
    80, // Ampere data center (A100, A30)
    75, // Turing (RTX 20 series, T4)
    70, // Volta (V100)
];

pub const KERNELS_PTX_ENV: &str = "GLLM_WOQ_KERNELS_PTX";

const PTX_FILE_PREFIX: &str = "woq_gemm_sm";

/// Detects the compute capability of `ctx`'s device as a supported [`SmArch`].
pub fn detect_sm_version(ctx: &Arc<CudaContext>) -> BackendResult<SmArch> {
    let major = ctx.attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
    let minor = ctx.attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
    log::debug!("Detected GPU compute capability: sm_{}{}", major, minor);
    SmArch::from_compute_capability(major as u32, minor as u32)
}

/// Highest SM in `available_sms` that is `<= gpu_sm`.
pub fn find_best_sm_match(gpu_sm: u32, available_sms: &[u32]) -> Option<u32> {
    available_sms.iter().filter(|&&sm| sm <= gpu_sm).max().copied()
}

/// Precompiled PTX for several SM versions.
pub struct PtxCollection {
    /// Module name for logging.
    pub kernel_name: &'static str,
    /// `(sm_version, ptx_source)` pairs.
    pub ptx_versions: &'static [(u32, &'static str)],
}

impl PtxCollection {
    /// Best `(sm, source)` entry for `arch`.
    pub fn select(&self, arch: SmArch) -> BackendResult<(u32, &'static str)> {
        let available: Vec<u32> = self
            .ptx_versions
            .iter()
            .filter(|(_, src)| !src.trim().is_empty())
            .map(|(sm, _)| *sm)
            .collect();
        let best = find_best_sm_match(arch.as_u32(), &available).ok_or_else(|| {
            BackendError::PtxLoad(format!(
                "{}: no PTX for {arch} (available: {available:?})",
                self.kernel_name
            ))
        })?;
        self.ptx_versions
            .iter()
            .find(|(sm, _)| *sm == best)
            .copied()
            .ok_or_else(|| BackendError::PtxLoad(format!("{}: sm_{best} vanished", self.kernel_name)))
    }

    pub fn load(&self, arch: SmArch) -> BackendResult<Ptx> {
        let (sm, src) = self.select(arch)?;
        log::info!("Loading {} PTX for sm_{} (GPU is {})", self.kernel_name, sm, arch);
        Ok(Ptx::from_src(src))
    }
}

/// PTX named by `GLLM_WOQ_KERNELS_PTX`, if the variable is set.
pub fn ptx_from_env(arch: SmArch) -> BackendResult<Option<Ptx>> {
    match std::env::var_os(KERNELS_PTX_ENV) {
        Some(path) => load_ptx_path(Path::new(&path), arch).map(Some),
        None => Ok(None),
    }
}

/// Loads a PTX file, or the best `woq_gemm_sm{NN}.ptx` inside a directory.
pub fn load_ptx_path(path: &Path, arch: SmArch) -> BackendResult<Ptx> {
    let file = if path.is_dir() {
        best_ptx_in_dir(path, arch)?
    } else {
        path.to_path_buf()
    };
    if !file.is_file() {
        return Err(BackendError::PtxLoad(format!("{} is not a file", file.display())));
    }
    log::info!("Loading weight-only GEMM PTX from {} for {}", file.display(), arch);
    Ok(Ptx::from_file(file))
}

fn best_ptx_in_dir(dir: &Path, arch: SmArch) -> BackendResult<PathBuf> {
    let entries = fs::read_dir(dir)
        .map_err(|e| BackendError::PtxLoad(format!("{}: {e}", dir.display())))?;
    let mut candidates = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| BackendError::PtxLoad(format!("{}: {e}", dir.display())))?
            .path();
        if let Some(sm) = ptx_file_sm(&path) {
            candidates.push((sm, path));
        }
    }
    let available: Vec<u32> = candidates.iter().map(|(sm, _)| *sm).collect();
    let best = find_best_sm_match(arch.as_u32(), &available).ok_or_else(|| {
        BackendError::PtxLoad(format!(
            "{} has no {PTX_FILE_PREFIX}NN.ptx for {arch} (found {available:?})",
            dir.display()
        ))
    })?;
    candidates
        .into_iter()
        .find(|(sm, _)| *sm == best)
        .map(|(_, path)| path)
        .ok_or_else(|| BackendError::PtxLoad(format!("sm_{best} vanished from {}", dir.display())))
}

/// `woq_gemm_sm86.ptx` -> `Some(86)`.
fn ptx_file_sm(path: &Path) -> Option<u32> {
    if path.extension()? != "ptx" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PTX_FILE_PREFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_match_is_forward_compatible() {
        assert_eq!(find_best_sm_match(86, SUPPORTED_SM_VERSIONS), Some(86));
        assert_eq!(find_best_sm_match(87, SUPPORTED_SM_VERSIONS), Some(86));
        assert_eq!(find_best_sm_match(72, &[75, 80]), None);
    }

    #[test]
    fn collection_skips_empty_sources() {
        static COLLECTION: PtxCollection = PtxCollection {
            kernel_name: "woq_gemm",
            ptx_versions: &[(75, ".version 7.0"), (80, "   ")],
        };
        let (sm, _) = COLLECTION.select(SmArch::new(86).unwrap()).unwrap();
        assert_eq!(sm, 75);
        assert!(COLLECTION.select(SmArch::new(72).unwrap()).is_err());
    }

    #[test]
    fn ptx_file_names() {
        assert_eq!(ptx_file_sm(Path::new("/k/woq_gemm_sm86.ptx")), Some(86));
        assert_eq!(ptx_file_sm(Path::new("/k/woq_gemm_sm86.cubin")), None);
        assert_eq!(ptx_file_sm(Path::new("/k/other_sm86.ptx")), None);
    }
}
