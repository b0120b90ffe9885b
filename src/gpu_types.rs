//! Tensor descriptors shared by every backend.
//!
//! Backends own their device memory; the dispatcher only ever looks at tensors
//! through [`TensorView`]. [`HostTensor`] is the owned host-memory tensor used
//! for weight preprocessing, uploads/downloads and as the reference backend's
//! device tensor.

use std::fmt;

use half::f16;

use crate::backend_trait::{BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorDtype {
    F32,
    F16,
    U32,
    I8,
}

impl TensorDtype {
    pub const fn size_in_bytes(self) -> usize {
        match self {
            TensorDtype::F32 | TensorDtype::U32 => 4,
            TensorDtype::F16 => 2,
            TensorDtype::I8 => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TensorDtype::F32 => "f32",
            TensorDtype::F16 => "f16",
            TensorDtype::U32 => "u32",
            TensorDtype::I8 => "i8",
        }
    }
}

impl fmt::Display for TensorDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of a tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    pub fn ordinal(self) -> Option<usize> {
        match self {
            Device::Cpu => None,
            Device::Cuda(ordinal) => Some(ordinal),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Read-only metadata every backend tensor exposes to the dispatcher.
pub trait TensorView {
    fn shape(&self) -> &[usize];
    fn dtype(&self) -> TensorDtype;
    fn device(&self) -> Device;
    fn is_contiguous(&self) -> bool;

    fn rank(&self) -> usize {
        self.shape().len()
    }

    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }
}

/// Row-major strides for `shape`, in elements.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }
    strides
}

/// Typed host storage. Keeping the element type in the vector keeps every
/// byte view correctly aligned.
#[derive(Debug, Clone, PartialEq)]
pub enum HostStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    U32(Vec<u32>),
    I8(Vec<i8>),
}

impl HostStorage {
    pub fn zeros(dtype: TensorDtype, len: usize) -> Self {
        match dtype {
            TensorDtype::F32 => HostStorage::F32(vec![0.0; len]),
            TensorDtype::F16 => HostStorage::F16(vec![f16::ZERO; len]),
            TensorDtype::U32 => HostStorage::U32(vec![0; len]),
            TensorDtype::I8 => HostStorage::I8(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> TensorDtype {
        match self {
            HostStorage::F32(_) => TensorDtype::F32,
            HostStorage::F16(_) => TensorDtype::F16,
            HostStorage::U32(_) => TensorDtype::U32,
            HostStorage::I8(_) => TensorDtype::I8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostStorage::F32(v) => v.len(),
            HostStorage::F16(v) => v.len(),
            HostStorage::U32(v) => v.len(),
            HostStorage::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HostStorage::F32(v) => bytemuck::cast_slice(v),
            HostStorage::F16(v) => bytemuck::cast_slice(v),
            HostStorage::U32(v) => bytemuck::cast_slice(v),
            HostStorage::I8(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            HostStorage::F32(v) => bytemuck::cast_slice_mut(v),
            HostStorage::F16(v) => bytemuck::cast_slice_mut(v),
            HostStorage::U32(v) => bytemuck::cast_slice_mut(v),
            HostStorage::I8(v) => bytemuck::cast_slice_mut(v),
        }
    }

    /// Decodes little-endian bytes into typed storage.
    pub fn from_le_bytes(dtype: TensorDtype, bytes: &[u8]) -> BackendResult<Self> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(BackendError::InvalidConfig(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(match dtype {
            TensorDtype::F32 => HostStorage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            TensorDtype::F16 => HostStorage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|b| f16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            ),
            TensorDtype::U32 => HostStorage::U32(
                bytes
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            TensorDtype::I8 => HostStorage::I8(bytes.iter().map(|&b| b as i8).collect()),
        })
    }
}

/// Owned tensor in host memory.
///
/// The `device` tag is the placement the tensor stands for: preprocessing
/// works on `Device::Cpu` tensors, while [`crate::cpu_backend::CpuBackend`]
/// keeps its emulated accelerator tensors in the same type.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    storage: HostStorage,
    shape: Vec<usize>,
    strides: Vec<usize>,
    device: Device,
}

impl HostTensor {
    pub fn new(storage: HostStorage, shape: &[usize]) -> BackendResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != storage.len() {
            return Err(BackendError::InvalidConfig(format!(
                "shape {shape:?} needs {numel} elements, storage holds {}",
                storage.len()
            )));
        }
        Ok(Self {
            storage,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            device: Device::Cpu,
        })
    }

    pub fn from_f16(data: Vec<f16>, shape: &[usize]) -> BackendResult<Self> {
        Self::new(HostStorage::F16(data), shape)
    }

    pub fn from_i8(data: Vec<i8>, shape: &[usize]) -> BackendResult<Self> {
        Self::new(HostStorage::I8(data), shape)
    }

    /// Packed weight bytes viewed as an i8 tensor.
    pub fn from_packed_bytes(bytes: &[u8], shape: &[usize]) -> BackendResult<Self> {
        Self::new(HostStorage::from_le_bytes(TensorDtype::I8, bytes)?, shape)
    }

    pub fn zeros(shape: &[usize], dtype: TensorDtype, device: Device) -> Self {
        let numel = shape.iter().product();
        Self {
            storage: HostStorage::zeros(dtype, numel),
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            device,
        }
    }

    /// Relabels the placement without touching the data.
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Swaps the two axes of a rank-2 tensor without moving data; the result
    /// is a non-contiguous view.
    pub fn transpose(&self) -> BackendResult<Self> {
        if self.shape.len() != 2 {
            return Err(BackendError::RankMismatch {
                tensor: "transpose input",
                expected: "2",
                actual: self.shape.len(),
            });
        }
        Ok(Self {
            storage: self.storage.clone(),
            shape: vec![self.shape[1], self.shape[0]],
            strides: vec![self.strides[1], self.strides[0]],
            device: self.device,
        })
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn storage(&self) -> &HostStorage {
        &self.storage
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_bytes_mut()
    }

    pub fn as_f16(&self) -> Option<&[f16]> {
        match &self.storage {
            HostStorage::F16(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_f16_mut(&mut self) -> Option<&mut [f16]> {
        match &mut self.storage {
            HostStorage::F16(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.storage {
            HostStorage::I8(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Widens floating-point contents to f32 in storage order.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        match &self.storage {
            HostStorage::F32(v) => Some(v.clone()),
            HostStorage::F16(v) => Some(v.iter().map(|x| x.to_f32()).collect()),
            _ => None,
        }
    }
}

impl TensorView for HostTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> TensorDtype {
        self.storage.dtype()
    }

    fn device(&self) -> Device {
        self.device
    }

    /// Row-major up to the strides of size-1 dimensions, which never move.
    fn is_contiguous(&self) -> bool {
        self.shape
            .iter()
            .zip(self.strides.iter().zip(contiguous_strides(&self.shape)))
            .all(|(&dim, (&stride, expected))| dim == 1 || stride == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_are_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[7]), vec![1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn transpose_is_a_non_contiguous_view() {
        let t = HostTensor::from_f16(vec![f16::ONE; 6], &[2, 3]).unwrap();
        assert!(t.is_contiguous());
        let tt = t.transpose().unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert!(!tt.is_contiguous());
        assert_eq!(tt.dtype(), TensorDtype::F16);
    }

    #[test]
    fn unit_dimensions_ignore_strides() {
        let column = HostTensor::from_f16(vec![f16::ONE; 128], &[128, 1]).unwrap();
        let row = column.transpose().unwrap();
        assert_eq!(row.shape(), &[1, 128]);
        assert_eq!(row.strides(), &[1, 1]);
        assert!(row.is_contiguous());

        let wide = HostTensor::from_f16(vec![f16::ONE; 6], &[3, 2]).unwrap();
        assert!(!wide.transpose().unwrap().is_contiguous());
    }

    #[test]
    fn storage_length_must_match_shape() {
        let err = HostTensor::from_i8(vec![0; 5], &[2, 3]).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn le_bytes_decode_matches_byte_view() {
        let t = HostTensor::from_f16(vec![f16::from_f32(1.5), f16::from_f32(-2.0)], &[2]).unwrap();
        let decoded = HostStorage::from_le_bytes(TensorDtype::F16, t.as_bytes()).unwrap();
        assert_eq!(&decoded, t.storage());
        assert_eq!(t.size_in_bytes(), 4);
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(3).to_string(), "cuda:3");
        assert!(Device::Cuda(0).is_accelerator());
        assert_eq!(Device::Cpu.ordinal(), None);
    }
}
