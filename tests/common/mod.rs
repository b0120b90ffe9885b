#![allow(dead_code)]

use gllm_quant_matmul::{
    pack_weights, preprocess_weight, CpuBackend, Device, HostTensor, QuantGemmBackend, SmArch,
    WeightBits,
};
use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A random quantized GEMM problem with its dequantize-then-matmul answer.
pub struct Fixture {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub bits: WeightBits,
    pub group_size: Option<usize>,
    /// Logical `[k, n]` signed values.
    pub values: Vec<i8>,
    pub scales: Vec<f16>,
    pub activation: Vec<f16>,
    pub bias: Option<Vec<f16>>,
}

pub struct DeviceOperands {
    pub activation: HostTensor,
    pub weight: HostTensor,
    pub scales: HostTensor,
    pub bias: Option<HostTensor>,
}

impl Fixture {
    pub fn new(
        seed: u64,
        (m, n, k): (usize, usize, usize),
        bits: WeightBits,
        group_size: Option<usize>,
        with_bias: bool,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = (0..k * n)
            .map(|_| rng.gen_range(bits.min_value()..=bits.max_value()))
            .collect();
        let scale_rows = group_size.map_or(1, |g| k / g);
        let scales = (0..scale_rows * n)
            .map(|_| f16::from_f32(rng.gen_range(0.005..0.05)))
            .collect();
        let activation = (0..m * k)
            .map(|_| f16::from_f32(rng.gen_range(-1.0..1.0)))
            .collect();
        let bias = with_bias.then(|| {
            (0..n)
                .map(|_| f16::from_f32(rng.gen_range(-0.5..0.5)))
                .collect()
        });
        Self {
            m,
            n,
            k,
            bits,
            group_size,
            values,
            scales,
            activation,
            bias,
        }
    }

    /// Quantizer output: row-major `[k, n / epb]`.
    pub fn raw_weight(&self) -> HostTensor {
        let packed = pack_weights(&self.values, self.bits).unwrap();
        HostTensor::from_packed_bytes(&packed, &[self.k, self.n / self.bits.elements_per_byte()])
            .unwrap()
    }

    pub fn scale_shape(&self) -> Vec<usize> {
        match self.group_size {
            None => vec![self.n],
            Some(g) => vec![self.k / g, self.n],
        }
    }

    /// Host-side operands with the weight preprocessed for `arch`.
    pub fn host_operands(&self, arch: SmArch) -> DeviceOperands {
        let weight = preprocess_weight(&self.raw_weight(), self.bits.bits(), arch.as_u32()).unwrap();
        DeviceOperands {
            activation: HostTensor::from_f16(self.activation.clone(), &[self.m, self.k]).unwrap(),
            weight,
            scales: HostTensor::from_f16(self.scales.clone(), &self.scale_shape()).unwrap(),
            bias: self
                .bias
                .as_ref()
                .map(|b| HostTensor::from_f16(b.clone(), &[self.n]).unwrap()),
        }
    }

    pub fn upload(&self, backend: &CpuBackend, device: Device) -> DeviceOperands {
        let host = self.host_operands(backend.arch());
        DeviceOperands {
            activation: backend.upload(&host.activation, device).unwrap(),
            weight: backend.upload(&host.weight, device).unwrap(),
            scales: backend.upload(&host.scales, device).unwrap(),
            bias: host.bias.map(|b| backend.upload(&b, device).unwrap()),
        }
    }

    /// `activation x dequant(weight) + bias`, with dequantized weights
    /// rounded to f16.
    pub fn reference(&self) -> Vec<f32> {
        let group = self.group_size.unwrap_or(self.k);
        let mut out = vec![0f32; self.m * self.n];
        for i in 0..self.m {
            for j in 0..self.n {
                let mut sum = 0f32;
                for kk in 0..self.k {
                    let scale = self.scales[(kk / group) * self.n + j].to_f32();
                    let w = f16::from_f32(self.values[kk * self.n + j] as f32 * scale);
                    sum += self.activation[i * self.k + kk].to_f32() * w.to_f32();
                }
                let bias = self.bias.as_ref().map_or(0.0, |b| b[j].to_f32());
                out[i * self.n + j] = sum + bias;
            }
        }
        out
    }
}

pub fn backend() -> CpuBackend {
    let _ = env_logger::builder().is_test(true).try_init();
    CpuBackend::new().with_arch(SmArch::AMPERE)
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = 1e-2 + 2e-3 * e.abs();
        assert!(
            (a - e).abs() <= tol,
            "mismatch at {idx}: got {a}, expected {e}"
        );
    }
}
