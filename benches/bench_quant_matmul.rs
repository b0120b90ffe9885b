//! Weight-only quantized GEMM benchmarks
//!
//! Operators: weight preprocessing (int4/int8), host reference GEMV (m=1) and
//! tiled GEMM (m=32)
//! Report: bytes/s for preprocessing, FLOPs (2*M*N*K) for matmul

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use gllm_quant_matmul::{
    pack_weights, preprocess_weight, quant_matmul, CpuBackend, Device, HostTensor,
    QuantGemmBackend, TensorView, WeightBits,
};

#[path = "utils.rs"]
mod utils;

const DEV: Device = Device::Cuda(0);

fn raw_weight(k: usize, n: usize, bits: WeightBits) -> HostTensor {
    let values = utils::random_quant_values(k * n, bits.bits());
    let packed = pack_weights(&values, bits).unwrap();
    HostTensor::from_packed_bytes(&packed, &[k, n / bits.elements_per_byte()]).unwrap()
}

// ─── Preprocessing ───

fn bench_preprocess(c: &mut Criterion) {
    let mut group = c.benchmark_group("woq/preprocess");
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    let sizes: &[(usize, usize)] = &[
        (4096, 4096),  // LLaMA-7B attention projection
        (4096, 11008), // LLaMA-7B FFN up
    ];

    for bits in [WeightBits::Int4, WeightBits::Int8] {
        for &(k, n) in sizes {
            let raw = raw_weight(k, n, bits);
            group.throughput(Throughput::Bytes(raw.size_in_bytes() as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("int{}", bits.bits()), format!("{k}x{n}")),
                &raw,
                |bench, raw| {
                    bench.iter(|| black_box(preprocess_weight(black_box(raw), bits.bits(), 80).unwrap()));
                },
            );
        }
    }
    group.finish();
}

// ─── Host reference matmul ───

fn bench_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("woq/cpu_reference");
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(10);

    let backend = CpuBackend::new();
    let (k, n) = (1024, 1024);

    for bits in [WeightBits::Int4, WeightBits::Int8] {
        let packed = preprocess_weight(&raw_weight(k, n, bits), bits.bits(), 80).unwrap();
        let weight = backend.upload(&packed, DEV).unwrap();
        let scales = HostTensor::from_f16(utils::random_scale_vec(k / 128 * n), &[k / 128, n]).unwrap();
        let scales = backend.upload(&scales, DEV).unwrap();

        for m in [1usize, 32] {
            group.throughput(Throughput::Elements(utils::gemm_flops(m, n, k)));
            let activation = HostTensor::from_f16(utils::random_f16_vec(m * k), &[m, k]).unwrap();
            let activation = backend.upload(&activation, DEV).unwrap();

            group.bench_with_input(
                BenchmarkId::new(format!("int{}_g128", bits.bits()), format!("{m}x{n}x{k}")),
                &m,
                |bench, _| {
                    bench.iter(|| {
                        let out = quant_matmul(&backend, &activation, &weight, &scales, None, bits.bits())
                            .unwrap();
                        backend.clear_records();
                        black_box(out)
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_preprocess, bench_matmul);
criterion_main!(benches);
