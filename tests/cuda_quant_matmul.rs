//! Device tests for the CUDA backend. They need a GPU and a kernel module
//! named by `GLLM_WOQ_KERNELS_PTX`, so they are ignored by default.

#[cfg(feature = "cuda")]
mod common;

#[cfg(feature = "cuda")]
mod cuda_quant_matmul_tests {
    use crate::common::{assert_close, Fixture};
    use gllm_quant_matmul::{quant_matmul, BackendError, CudaBackend, QuantGemmBackend, WeightBits};

    fn cuda_backend() -> Option<CudaBackend> {
        let _ = env_logger::builder().is_test(true).try_init();
        if !CudaBackend::is_available() {
            eprintln!("no CUDA device, skipping");
            return None;
        }
        Some(CudaBackend::new(0).expect("cuda backend"))
    }

    fn run_against_reference(m: usize, bits: WeightBits, group_size: Option<usize>) {
        let Some(backend) = cuda_backend() else {
            return;
        };
        let fixture = Fixture::new(11, (m, 256, 512), bits, group_size, true);
        let host = fixture.host_operands(backend.arch());
        let device = backend.device();
        let activation = backend.upload(&host.activation, device).unwrap();
        let weight = backend.upload(&host.weight, device).unwrap();
        let scales = backend.upload(&host.scales, device).unwrap();
        let bias = host.bias.as_ref().map(|b| backend.upload(b, device).unwrap());

        let out = quant_matmul(&backend, &activation, &weight, &scales, bias.as_ref(), bits.bits())
            .unwrap();
        backend.current_stream().synchronize().unwrap();
        let out = backend.download(&out).unwrap().to_f32_vec().unwrap();
        assert_close(&out, &fixture.reference());
    }

    #[test]
    #[ignore = "requires a CUDA device and GLLM_WOQ_KERNELS_PTX"]
    fn gemv_int4_groupwise() {
        run_against_reference(1, WeightBits::Int4, Some(128));
    }

    #[test]
    #[ignore = "requires a CUDA device and GLLM_WOQ_KERNELS_PTX"]
    fn tiled_int8_per_channel() {
        run_against_reference(33, WeightBits::Int8, None);
    }

    #[test]
    #[ignore = "requires a CUDA device"]
    fn other_ordinal_is_rejected() {
        let Some(backend) = cuda_backend() else {
            return;
        };
        let other = gllm_quant_matmul::Device::Cuda(backend.device().ordinal().unwrap_or(0) + 1);
        assert!(matches!(
            backend.bind_device(other),
            Err(BackendError::DeviceMismatch { .. })
        ));
    }
}
