//! Host reference backend.
//!
//! Emulates a set of accelerator devices in host memory and runs the two
//! kernel strategies as straightforward dequantize-and-accumulate loops
//! (rayon-parallel over output rows). Weights are decoded from the same
//! preprocessed layout the GPU kernels consume, so a weight that works here
//! has been packed correctly for the configured architecture.
//!
//! Every allocation and launch is recorded, which lets callers assert what a
//! dispatch did without a GPU.

use std::sync::{Mutex, MutexGuard};

use half::f16;
use rayon::prelude::*;

use crate::backend_trait::{BackendError, BackendResult, QuantGemmBackend};
use crate::gpu_types::{Device, HostTensor, TensorDtype, TensorView};
use crate::kernel_types::{
    GemmLaunch, GemmProblem, GemmVariant, KernelStrategy, MIN_TILED_WORKSPACE_BYTES, TILED_CTA_K, TILED_CTA_N,
};
use crate::preprocess::unpack_preprocessed_weight;
use crate::types::SmArch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub shape: Vec<usize>,
    pub dtype: TensorDtype,
    pub device: Device,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub strategy: KernelStrategy,
    pub kernel: &'static str,
    pub variant: GemmVariant,
    pub problem: GemmProblem,
    pub device: Device,
    pub workspace_bytes: usize,
    pub has_bias: bool,
}

/// Stream handle of an emulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStream {
    pub device: Device,
}

#[derive(Debug, Default)]
struct Records {
    allocations: Vec<AllocationRecord>,
    launches: Vec<LaunchRecord>,
}

#[derive(Debug)]
pub struct CpuBackend {
    arch: SmArch,
    num_devices: usize,
    allocation_limit: Option<usize>,
    records: Mutex<Records>,
}

impl CpuBackend {
    /// One emulated sm_80 device.
    pub fn new() -> Self {
        Self {
            arch: SmArch::AMPERE,
            num_devices: 1,
            allocation_limit: None,
            records: Mutex::new(Records::default()),
        }
    }

    /// Architecture whose preprocessed weight layout the kernels decode.
    pub fn with_arch(mut self, arch: SmArch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_devices(mut self, num_devices: usize) -> Self {
        self.num_devices = num_devices;
        self
    }

    /// Fails any single allocation larger than `bytes`.
    pub fn with_allocation_limit(mut self, bytes: usize) -> Self {
        self.allocation_limit = Some(bytes);
        self
    }

    pub fn arch(&self) -> SmArch {
        self.arch
    }

    pub fn allocations(&self) -> Vec<AllocationRecord> {
        self.records().allocations.clone()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.records().launches.clone()
    }

    pub fn clear_records(&self) {
        let mut records = self.records();
        records.allocations.clear();
        records.launches.clear();
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        // Records are append-only; a poisoned lock still holds valid data.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_device(&self, device: Device) -> BackendResult<()> {
        match device {
            Device::Cuda(ordinal) if ordinal < self.num_devices => Ok(()),
            other => Err(BackendError::InvalidConfig(format!(
                "device {other} is not one of the {} emulated accelerators",
                self.num_devices
            ))),
        }
    }

    fn record_launch(&self, strategy: KernelStrategy, stream: &CpuStream, launch: &GemmLaunch<'_, HostTensor>) {
        self.records().launches.push(LaunchRecord {
            strategy,
            kernel: strategy.kernel_name(launch.variant),
            variant: launch.variant,
            problem: launch.problem,
            device: stream.device,
            workspace_bytes: launch.workspace_bytes(),
            has_bias: launch.bias.is_some(),
        });
    }

    fn decode_operands<'t>(&self, launch: &GemmLaunch<'t, HostTensor>) -> BackendResult<Operands<'t>> {
        let GemmProblem { k, n, .. } = launch.problem;
        let weights = unpack_preprocessed_weight(
            launch.weight.as_bytes(),
            k,
            n,
            launch.variant.element.bits(),
            self.arch,
        )?;
        Ok(Operands {
            activation: f16_data(launch.activation, "activation")?,
            scales: f16_data(launch.scales, "weight_scales")?,
            bias: launch.bias.map(|b| f16_data(b, "bias")).transpose()?,
            weights,
        })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct Operands<'t> {
    activation: &'t [f16],
    scales: &'t [f16],
    bias: Option<&'t [f16]>,
    /// Logical `[k, n]` signed values.
    weights: Vec<i8>,
}

impl Operands<'_> {
    /// Dequantized weight `(row, col)` rounded to f16 like the kernels do.
    #[inline]
    fn dequant(&self, problem: &GemmProblem, row: usize, col: usize) -> f16 {
        let scale = self.scales[(row / problem.group_size) * problem.n + col];
        f16::from_f32(self.weights[row * problem.n + col] as f32 * scale.to_f32())
    }

    fn write_output(&self, acc: &[f32], output: &mut [f16], n: usize) {
        output
            .par_chunks_mut(n)
            .zip(acc.par_chunks(n))
            .for_each(|(out_row, acc_row)| {
                for (col, (out, &sum)) in out_row.iter_mut().zip(acc_row).enumerate() {
                    let bias = self.bias.map_or(0.0, |b| b[col].to_f32());
                    *out = f16::from_f32(sum + bias);
                }
            });
    }
}

fn f16_data<'t>(tensor: &'t HostTensor, name: &'static str) -> BackendResult<&'t [f16]> {
    tensor.as_f16().ok_or(BackendError::DtypeMismatch {
        tensor: name,
        expected: TensorDtype::F16,
        actual: tensor.dtype(),
    })
}

fn f16_output<'t>(tensor: &'t mut HostTensor) -> BackendResult<&'t mut [f16]> {
    let dtype = tensor.dtype();
    tensor.as_f16_mut().ok_or(BackendError::DtypeMismatch {
        tensor: "output",
        expected: TensorDtype::F16,
        actual: dtype,
    })
}

impl QuantGemmBackend for CpuBackend {
    type Tensor = HostTensor;
    type Stream = CpuStream;

    fn name(&self) -> &'static str {
        "cpu-reference"
    }

    fn bind_device(&self, device: Device) -> BackendResult<CpuStream> {
        self.check_device(device)?;
        Ok(CpuStream { device })
    }

    fn empty(&self, stream: &CpuStream, shape: &[usize], dtype: TensorDtype) -> BackendResult<HostTensor> {
        let device = stream.device;
        self.check_device(device)?;
        let bytes = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if let Some(limit) = self.allocation_limit {
            if bytes > limit {
                return Err(BackendError::AllocationFailed {
                    bytes,
                    device,
                    reason: format!("exceeds emulated device limit of {limit} bytes"),
                });
            }
        }
        log::debug!("cpu-reference alloc {shape:?} {dtype} on {device} ({bytes} bytes)");
        self.records().allocations.push(AllocationRecord {
            shape: shape.to_vec(),
            dtype,
            device,
            bytes,
        });
        Ok(HostTensor::zeros(shape, dtype, device))
    }

    fn upload(&self, host: &HostTensor, device: Device) -> BackendResult<HostTensor> {
        self.check_device(device)?;
        Ok(host.clone().on_device(device))
    }

    fn download(&self, tensor: &HostTensor) -> BackendResult<HostTensor> {
        Ok(tensor.clone().on_device(Device::Cpu))
    }

    fn launch_batched_gemv(&self, stream: &CpuStream, launch: GemmLaunch<'_, HostTensor>) -> BackendResult<()> {
        let problem = launch.problem;
        let GemmProblem { m, n, k, .. } = problem;
        let ops = self.decode_operands(&launch)?;
        self.record_launch(KernelStrategy::BatchedGemv, stream, &launch);

        let mut acc = vec![0f32; m * n];
        acc.par_chunks_mut(n).enumerate().for_each(|(row, acc_row)| {
            let act = &ops.activation[row * k..(row + 1) * k];
            for (col, slot) in acc_row.iter_mut().enumerate() {
                let mut sum = 0f32;
                for (kk, a) in act.iter().enumerate() {
                    sum += a.to_f32() * ops.dequant(&problem, kk, col).to_f32();
                }
                *slot = sum;
            }
        });

        ops.write_output(&acc, f16_output(launch.output)?, n);
        Ok(())
    }

    fn launch_tiled_gemm(&self, stream: &CpuStream, launch: GemmLaunch<'_, HostTensor>) -> BackendResult<()> {
        let problem = launch.problem;
        let GemmProblem { m, n, k, .. } = problem;
        let ops = self.decode_operands(&launch)?;

        let workspace_bytes = launch.workspace_bytes();
        if workspace_bytes < MIN_TILED_WORKSPACE_BYTES {
            return Err(BackendError::InvalidConfig(format!(
                "tiled GEMM workspace of {workspace_bytes} bytes is smaller than one {MIN_TILED_WORKSPACE_BYTES}-byte tile"
            )));
        }
        self.record_launch(KernelStrategy::TiledGemm, stream, &launch);
        let workspace = launch
            .workspace
            .ok_or_else(|| BackendError::InvalidConfig("tiled GEMM launched without a workspace".into()))?;
        let scratch = workspace.as_bytes_mut();

        let mut acc = vec![0f32; m * n];
        for n0 in (0..n).step_by(TILED_CTA_N) {
            let tile_n = TILED_CTA_N.min(n - n0);
            for k0 in (0..k).step_by(TILED_CTA_K) {
                let tile_k = TILED_CTA_K.min(k - k0);

                // Stage the dequantized [tile_k, tile_n] block as f16.
                for (i, slot) in scratch[..tile_k * tile_n * 2].chunks_exact_mut(2).enumerate() {
                    let value = ops.dequant(&problem, k0 + i / tile_n, n0 + i % tile_n);
                    slot.copy_from_slice(&value.to_le_bytes());
                }

                let tile = &scratch[..tile_k * tile_n * 2];
                acc.par_chunks_mut(n).enumerate().for_each(|(row, acc_row)| {
                    let act = &ops.activation[row * k + k0..row * k + k0 + tile_k];
                    for (kk, a) in act.iter().enumerate() {
                        let a = a.to_f32();
                        for jj in 0..tile_n {
                            let at = 2 * (kk * tile_n + jj);
                            let w = f16::from_le_bytes([tile[at], tile[at + 1]]);
                            acc_row[n0 + jj] += a * w.to_f32();
                        }
                    }
                });
            }
        }

        ops.write_output(&acc, f16_output(launch.output)?, n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_device_rejects_unknown_devices() {
        let backend = CpuBackend::new().with_devices(2);
        assert_eq!(
            backend.bind_device(Device::Cuda(1)).unwrap(),
            CpuStream { device: Device::Cuda(1) }
        );
        assert!(backend.bind_device(Device::Cuda(2)).is_err());
        assert!(backend.bind_device(Device::Cpu).is_err());
    }

    #[test]
    fn allocations_follow_the_bound_stream() {
        let backend = CpuBackend::new().with_devices(2);
        let stream = backend.bind_device(Device::Cuda(1)).unwrap();
        let t = backend.empty(&stream, &[4, 8], TensorDtype::F16).unwrap();
        assert_eq!(t.device(), Device::Cuda(1));
        assert_eq!(backend.allocations()[0].device, Device::Cuda(1));

        let stale = CpuStream { device: Device::Cuda(5) };
        assert!(backend.empty(&stale, &[4, 8], TensorDtype::F16).is_err());
        assert_eq!(backend.allocations().len(), 1);
    }

    #[test]
    fn rejected_tiled_launch_is_not_recorded() {
        let backend = CpuBackend::new();
        let stream = backend.bind_device(Device::Cuda(0)).unwrap();
        let zeros = |shape: &[usize], dtype| HostTensor::zeros(shape, dtype, Device::Cuda(0));
        let activation = zeros(&[1, 64], TensorDtype::F16);
        let weight = zeros(&[8, 64], TensorDtype::I8);
        let scales = zeros(&[8], TensorDtype::F16);
        let mut output = zeros(&[1, 8], TensorDtype::F16);
        let mut workspace = zeros(&[MIN_TILED_WORKSPACE_BYTES - 1], TensorDtype::I8);

        let launch = GemmLaunch {
            activation: &activation,
            weight: &weight,
            scales: &scales,
            bias: None,
            output: &mut output,
            workspace: Some(&mut workspace),
            problem: GemmProblem { m: 1, n: 8, k: 64, group_size: 64 },
            variant: GemmVariant::ALL[2],
        };
        let err = backend.launch_tiled_gemm(&stream, launch).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
        assert!(backend.launches().is_empty());
    }

    #[test]
    fn allocation_limit_and_records() {
        let backend = CpuBackend::new().with_allocation_limit(1024);
        let stream = backend.bind_device(Device::Cuda(0)).unwrap();
        let t = backend.empty(&stream, &[16, 32], TensorDtype::F16).unwrap();
        assert_eq!(t.device(), Device::Cuda(0));
        assert_eq!(backend.allocations().len(), 1);
        assert_eq!(backend.allocations()[0].bytes, 1024);

        let err = backend.empty(&stream, &[1025], TensorDtype::I8).unwrap_err();
        assert!(matches!(err, BackendError::AllocationFailed { bytes: 1025, .. }));
        assert_eq!(backend.allocations().len(), 1);

        backend.clear_records();
        assert!(backend.allocations().is_empty());
    }

    #[test]
    fn upload_download_keeps_data() {
        let backend = CpuBackend::new();
        let host = HostTensor::from_f16(vec![f16::from_f32(0.5); 8], &[2, 4]).unwrap();
        let dev = backend.upload(&host, Device::Cuda(0)).unwrap();
        assert_eq!(dev.device(), Device::Cuda(0));
        let back = backend.download(&dev).unwrap();
        assert_eq!(back, host);
    }
}
