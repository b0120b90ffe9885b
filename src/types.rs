//! Quantization configuration and architecture types.

use crate::backend_trait::{BackendError, BackendResult};

/// Lowest SM generation with kernels in the weight-only GEMM library.
pub const MIN_SUPPORTED_SM: u32 = 70;
/// Exclusive upper bound; Hopper and newer use a different weight pipeline.
pub const MAX_SUPPORTED_SM: u32 = 90;

/// Group sizes the per-group kernels are instantiated for.
pub const SUPPORTED_GROUP_SIZES: [usize; 2] = [64, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightBits {
    Int4,
    Int8,
}

impl WeightBits {
    pub fn from_bits(bits: u32) -> BackendResult<Self> {
        match bits {
            4 => Ok(WeightBits::Int4),
            8 => Ok(WeightBits::Int8),
            other => Err(BackendError::UnsupportedBits(other)),
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            WeightBits::Int4 => 4,
            WeightBits::Int8 => 8,
        }
    }

    /// Quantized values per stored byte.
    pub const fn elements_per_byte(self) -> usize {
        8 / self.bits() as usize
    }

    /// Quantized values per 32-bit register.
    pub const fn elements_per_word(self) -> usize {
        32 / self.bits() as usize
    }

    pub const fn min_value(self) -> i8 {
        match self {
            WeightBits::Int4 => -8,
            WeightBits::Int8 => i8::MIN,
        }
    }

    pub const fn max_value(self) -> i8 {
        match self {
            WeightBits::Int4 => 7,
            WeightBits::Int8 => i8::MAX,
        }
    }
}

impl TryFrom<u32> for WeightBits {
    type Error = BackendError;

    fn try_from(bits: u32) -> BackendResult<Self> {
        WeightBits::from_bits(bits)
    }
}

/// How many rows of the reduction dimension share one scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleGranularity {
    /// One scale per output column.
    PerChannel,
    /// One scale per `group_size` rows of each output column.
    PerGroup { group_size: usize },
}

/// Validated quantization settings for one GEMM call.
///
/// Built once from the scale tensor's shape; everything downstream branches on
/// `granularity` instead of re-inspecting tensor ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuantizationConfig {
    pub bits: WeightBits,
    pub granularity: ScaleGranularity,
    /// `k` for per-channel scales.
    pub group_size: usize,
}

impl QuantizationConfig {
    pub fn per_channel(bits: WeightBits, k: usize) -> BackendResult<Self> {
        if k == 0 {
            return Err(BackendError::InvalidConfig(
                "reduction dimension k must be > 0".into(),
            ));
        }
        Ok(Self {
            bits,
            granularity: ScaleGranularity::PerChannel,
            group_size: k,
        })
    }

    pub fn per_group(bits: WeightBits, k: usize, group_size: usize) -> BackendResult<Self> {
        if group_size == 0 || k % group_size != 0 {
            return Err(BackendError::InvalidConfig(format!(
                "k = {k} is not divisible by group size {group_size}"
            )));
        }
        if !SUPPORTED_GROUP_SIZES.contains(&group_size) {
            return Err(BackendError::UnsupportedGroupSize { group_size, k });
        }
        Ok(Self {
            bits,
            granularity: ScaleGranularity::PerGroup { group_size },
            group_size,
        })
    }

    /// Infers granularity from the scale tensor's shape: rank 1 is
    /// per-channel, rank 2 `[k / group_size, n]` is per-group.
    pub fn from_scale_shape(bits: WeightBits, k: usize, scale_shape: &[usize]) -> BackendResult<Self> {
        match scale_shape {
            [_] => Self::per_channel(bits, k),
            [groups, _] => {
                if *groups == 0 {
                    return Err(BackendError::InvalidConfig(
                        "weight_scales has zero groups".into(),
                    ));
                }
                Self::per_group(bits, k, k / groups)
            }
            other => Err(BackendError::RankMismatch {
                tensor: "weight_scales",
                expected: "1 or 2",
                actual: other.len(),
            }),
        }
    }

    pub fn num_groups(&self, k: usize) -> usize {
        k / self.group_size
    }

    pub fn expected_scale_shape(&self, k: usize, n: usize) -> Vec<usize> {
        match self.granularity {
            ScaleGranularity::PerChannel => vec![n],
            ScaleGranularity::PerGroup { .. } => vec![self.num_groups(k), n],
        }
    }
}

/// Kernel weight layout family for an architecture generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightLayout {
    /// Volta: rows stay in place, only the register re-layout applies.
    RowMajor,
    /// Turing through Ada: `ldmatrix`-friendly column-major tiles.
    ColumnMajorTileInterleave {
        rows_per_tile: usize,
        columns_interleaved: usize,
    },
}

impl WeightLayout {
    pub fn uses_tensor_core_tiles(&self) -> bool {
        matches!(self, WeightLayout::ColumnMajorTileInterleave { .. })
    }

    /// Row alignment the layout needs on top of packing alignment.
    pub fn row_alignment(&self) -> usize {
        match self {
            WeightLayout::RowMajor => 1,
            WeightLayout::ColumnMajorTileInterleave { rows_per_tile, .. } => *rows_per_tile,
        }
    }
}

/// Validated GPU architecture generation, `major * 10 + minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SmArch(u32);

impl SmArch {
    pub const AMPERE: SmArch = SmArch(80);

    pub fn new(arch: u32) -> BackendResult<Self> {
        if (MIN_SUPPORTED_SM..MAX_SUPPORTED_SM).contains(&arch) {
            Ok(Self(arch))
        } else {
            Err(BackendError::UnsupportedArch {
                arch,
                min: MIN_SUPPORTED_SM,
                max: MAX_SUPPORTED_SM,
            })
        }
    }

    pub fn from_compute_capability(major: u32, minor: u32) -> BackendResult<Self> {
        Self::new(major * 10 + minor)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn layout(self, bits: WeightBits) -> WeightLayout {
        if self.0 < 75 {
            return WeightLayout::RowMajor;
        }
        let columns_interleaved = match bits {
            WeightBits::Int4 => 4,
            WeightBits::Int8 => 2,
        };
        WeightLayout::ColumnMajorTileInterleave {
            rows_per_tile: 64,
            columns_interleaved,
        }
    }
}

impl std::fmt::Display for SmArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sm_{}", self.0)
    }
}
