//! cudarc glue for the externally built weight-only GEMM kernels.

pub mod ptx_loader;
mod woq_gemm;

pub use ptx_loader::{
    detect_sm_version, find_best_sm_match, load_ptx_path, ptx_from_env, PtxCollection,
    KERNELS_PTX_ENV, SUPPORTED_SM_VERSIONS,
};
pub use woq_gemm::WoqGemmKernels;
