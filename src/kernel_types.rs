//! Kernel-facing descriptors: problem sizes, variants, strategies and the
//! launch parameter block.

use crate::backend_trait::{BackendError, BackendResult};
use crate::dispatch_policy::DispatchPolicy;
use crate::gpu_types::TensorView;
use crate::types::{QuantizationConfig, ScaleGranularity, WeightBits};
use crate::validation::to_i32;

/// GEMM dimensions: `[m, k] x [k, n] -> [m, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Rows of `k` sharing one scale; `k` for per-channel scales.
    pub group_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightElement {
    /// Two signed 4-bit values per byte.
    Int4Packed,
    Int8,
}

impl WeightElement {
    pub fn from_bits(bits: WeightBits) -> Self {
        match bits {
            WeightBits::Int4 => WeightElement::Int4Packed,
            WeightBits::Int8 => WeightElement::Int8,
        }
    }

    pub fn bits(self) -> WeightBits {
        match self {
            WeightElement::Int4Packed => WeightBits::Int4,
            WeightElement::Int8 => WeightBits::Int8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            WeightElement::Int4Packed => "int4",
            WeightElement::Int8 => "int8",
        }
    }

    /// Code the kernel library uses for the weight element type.
    pub const fn abi_code(self) -> i32 {
        match self {
            WeightElement::Int4Packed => 0,
            WeightElement::Int8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightOnlyQuantOp {
    PerColumnScaleOnly,
    FinegrainedScaleOnly,
}

impl WeightOnlyQuantOp {
    pub fn from_granularity(granularity: ScaleGranularity) -> Self {
        match granularity {
            ScaleGranularity::PerChannel => WeightOnlyQuantOp::PerColumnScaleOnly,
            ScaleGranularity::PerGroup { .. } => WeightOnlyQuantOp::FinegrainedScaleOnly,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            WeightOnlyQuantOp::PerColumnScaleOnly => "per_channel",
            WeightOnlyQuantOp::FinegrainedScaleOnly => "groupwise",
        }
    }

    pub const fn abi_code(self) -> i32 {
        match self {
            WeightOnlyQuantOp::PerColumnScaleOnly => 0,
            WeightOnlyQuantOp::FinegrainedScaleOnly => 1,
        }
    }
}

/// One of the four {element x scale granularity} kernel instantiations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmVariant {
    pub element: WeightElement,
    pub quant_op: WeightOnlyQuantOp,
}

impl GemmVariant {
    pub const ALL: [GemmVariant; 4] = [
        GemmVariant {
            element: WeightElement::Int4Packed,
            quant_op: WeightOnlyQuantOp::PerColumnScaleOnly,
        },
        GemmVariant {
            element: WeightElement::Int4Packed,
            quant_op: WeightOnlyQuantOp::FinegrainedScaleOnly,
        },
        GemmVariant {
            element: WeightElement::Int8,
            quant_op: WeightOnlyQuantOp::PerColumnScaleOnly,
        },
        GemmVariant {
            element: WeightElement::Int8,
            quant_op: WeightOnlyQuantOp::FinegrainedScaleOnly,
        },
    ];

    pub fn new(config: &QuantizationConfig) -> Self {
        Self {
            element: WeightElement::from_bits(config.bits),
            quant_op: WeightOnlyQuantOp::from_granularity(config.granularity),
        }
    }
}

impl std::fmt::Display for GemmVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.element.name(), self.quant_op.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStrategy {
    /// Matrix-vector kernel for a handful of activation rows.
    BatchedGemv,
    /// Tensor-core tiled GEMM; needs a scratch workspace.
    TiledGemm,
}

impl KernelStrategy {
    pub fn select(m: usize, policy: &DispatchPolicy) -> Self {
        if m <= policy.gemv_max_m {
            KernelStrategy::BatchedGemv
        } else {
            KernelStrategy::TiledGemm
        }
    }

    pub fn needs_workspace(self) -> bool {
        matches!(self, KernelStrategy::TiledGemm)
    }

    /// Exported symbol of the kernel for `variant`.
    pub fn kernel_name(self, variant: GemmVariant) -> &'static str {
        use KernelStrategy::*;
        use WeightElement::*;
        use WeightOnlyQuantOp::*;

        match (self, variant.element, variant.quant_op) {
            (BatchedGemv, Int4Packed, PerColumnScaleOnly) => "woq_batched_gemv_int4_per_channel",
            (BatchedGemv, Int4Packed, FinegrainedScaleOnly) => "woq_batched_gemv_int4_groupwise",
            (BatchedGemv, Int8, PerColumnScaleOnly) => "woq_batched_gemv_int8_per_channel",
            (BatchedGemv, Int8, FinegrainedScaleOnly) => "woq_batched_gemv_int8_groupwise",
            (TiledGemm, Int4Packed, PerColumnScaleOnly) => "woq_tiled_gemm_int4_per_channel",
            (TiledGemm, Int4Packed, FinegrainedScaleOnly) => "woq_tiled_gemm_int4_groupwise",
            (TiledGemm, Int8, PerColumnScaleOnly) => "woq_tiled_gemm_int8_per_channel",
            (TiledGemm, Int8, FinegrainedScaleOnly) => "woq_tiled_gemm_int8_groupwise",
        }
    }

    pub fn all_kernel_names() -> impl Iterator<Item = &'static str> {
        [KernelStrategy::BatchedGemv, KernelStrategy::TiledGemm]
            .into_iter()
            .flat_map(|s| GemmVariant::ALL.into_iter().map(move |v| s.kernel_name(v)))
    }
}

/// Output columns covered by one batched-GEMV block.
pub const GEMV_COLS_PER_BLOCK: usize = 8;
pub const GEMV_THREADS: u32 = 128;
pub const TILED_CTA_M: usize = 64;
pub const TILED_CTA_N: usize = 128;
/// Reduction rows the tiled kernel dequantizes per main-loop step.
pub const TILED_CTA_K: usize = 64;
/// Smallest workspace the tiled kernel accepts: one f16 `[TILED_CTA_K, TILED_CTA_N]` tile.
pub const MIN_TILED_WORKSPACE_BYTES: usize = TILED_CTA_K * TILED_CTA_N * 2;
pub const TILED_THREADS: u32 = 128;

/// Grid and block shape for a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
}

impl LaunchGeometry {
    pub fn for_problem(strategy: KernelStrategy, problem: &GemmProblem) -> BackendResult<Self> {
        match strategy {
            KernelStrategy::BatchedGemv => Ok(Self {
                grid: (grid_dim(problem.n.div_ceil(GEMV_COLS_PER_BLOCK))?, 1, 1),
                block: (GEMV_THREADS, 1, 1),
            }),
            KernelStrategy::TiledGemm => Ok(Self {
                grid: (
                    grid_dim(problem.n.div_ceil(TILED_CTA_N))?,
                    grid_dim(problem.m.div_ceil(TILED_CTA_M))?,
                    1,
                ),
                block: (TILED_THREADS, 1, 1),
            }),
        }
    }
}

fn grid_dim(blocks: usize) -> BackendResult<u32> {
    u32::try_from(blocks)
        .map_err(|_| BackendError::InvalidConfig(format!("grid dimension {blocks} exceeds u32")))
}

/// Everything one kernel launch reads and writes.
pub struct GemmLaunch<'a, T> {
    pub activation: &'a T,
    pub weight: &'a T,
    pub scales: &'a T,
    pub bias: Option<&'a T>,
    pub output: &'a mut T,
    /// Present only for [`KernelStrategy::TiledGemm`].
    pub workspace: Option<&'a mut T>,
    pub problem: GemmProblem,
    pub variant: GemmVariant,
}

impl<T: TensorView> GemmLaunch<'_, T> {
    pub fn workspace_bytes(&self) -> usize {
        self.workspace.as_ref().map_or(0, |ws| ws.size_in_bytes())
    }
}

/// Raw device addresses of one launch. Absent operands are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevicePointers {
    pub activation: u64,
    pub weight: u64,
    pub scales: u64,
    pub bias: Option<u64>,
    pub output: u64,
    pub workspace: Option<(u64, usize)>,
}

/// Parameter block passed by value to every weight-only GEMM kernel.
///
/// Null operands are encoded as address 0. Zero-points are never used by this
/// crate, so `zeros` is always 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightOnlyParams {
    pub qweight: u64,
    pub scales: u64,
    pub zeros: u64,
    pub act: u64,
    pub bias: u64,
    pub out: u64,
    pub workspace: u64,
    pub workspace_bytes: u64,
    pub m: i32,
    pub n: i32,
    pub k: i32,
    pub group_size: i32,
    pub quant_type: i32,
    pub weight_only_type: i32,
}

impl WeightOnlyParams {
    pub fn new(
        problem: &GemmProblem,
        variant: GemmVariant,
        ptrs: DevicePointers,
    ) -> BackendResult<Self> {
        let (workspace, workspace_bytes) = ptrs.workspace.unwrap_or((0, 0));
        Ok(Self {
            qweight: ptrs.weight,
            scales: ptrs.scales,
            zeros: 0,
            act: ptrs.activation,
            bias: ptrs.bias.unwrap_or(0),
            out: ptrs.output,
            workspace,
            workspace_bytes: workspace_bytes as u64,
            m: to_i32(problem.m, "m")?,
            n: to_i32(problem.n, "n")?,
            k: to_i32(problem.k, "k")?,
            group_size: to_i32(problem.group_size, "group_size")?,
            quant_type: variant.element.abi_code(),
            weight_only_type: variant.quant_op.abi_code(),
        })
    }
}
