//! Entry point for weight-only quantized GEMM.
//!
//! `output[m, n] = activation[m, k] x dequant(weight)[k, n] (+ bias[n])`
//!
//! The dispatcher validates every argument before touching the device, then
//! binds the activation's device, allocates the output (and, for the tiled
//! kernel, a scratch workspace) and issues exactly one launch.

use crate::backend_trait::{BackendResult, QuantGemmBackend};
use crate::dispatch_policy::DispatchPolicy;
use crate::gpu_types::{Device, TensorDtype, TensorView};
use crate::kernel_types::{GemmLaunch, GemmProblem, GemmVariant, KernelStrategy};
use crate::types::{QuantizationConfig, WeightBits};
use crate::validation::{
    check_multiple_of, check_nonzero, check_rank, check_tensor, to_i32, Placement, TensorRequirement,
};

/// Fully validated description of one call, computed before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub problem: GemmProblem,
    pub config: QuantizationConfig,
    pub variant: GemmVariant,
    pub strategy: KernelStrategy,
    pub device: Device,
    /// Zero for the batched GEMV strategy.
    pub workspace_bytes: usize,
}

pub struct QuantGemmDispatcher<'b, B: QuantGemmBackend> {
    backend: &'b B,
    policy: DispatchPolicy,
}

impl<'b, B: QuantGemmBackend> QuantGemmDispatcher<'b, B> {
    pub fn new(backend: &'b B) -> Self {
        Self {
            backend,
            policy: DispatchPolicy::default(),
        }
    }

    /// Fails if `policy` does not pass [`DispatchPolicy::validate`].
    pub fn with_policy(backend: &'b B, policy: DispatchPolicy) -> BackendResult<Self> {
        policy.validate()?;
        Ok(Self { backend, policy })
    }

    /// Uses [`DispatchPolicy::from_env`].
    pub fn from_env(backend: &'b B) -> BackendResult<Self> {
        Self::with_policy(backend, DispatchPolicy::from_env()?)
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Validates the arguments and resolves strategy and kernel variant.
    pub fn plan(
        &self,
        activation: &B::Tensor,
        weight: &B::Tensor,
        scales: &B::Tensor,
        bias: Option<&B::Tensor>,
        bits: u32,
    ) -> BackendResult<DispatchPlan> {
        let bits = WeightBits::from_bits(bits)?;

        check_rank(activation, "activation", 2)?;
        check_rank(weight, "weight", 2)?;
        let m = activation.shape()[0];
        let k = activation.shape()[1];
        let n = weight.shape()[0];
        check_nonzero(m, "activation rows (m)")?;
        check_nonzero(k, "activation columns (k)")?;

        let config = QuantizationConfig::from_scale_shape(bits, k, scales.shape())?;
        check_multiple_of(n, 8, "output columns (n)")?;
        check_multiple_of(k, bits.elements_per_byte(), "activation columns (k)")?;

        let device = activation.device();
        check_tensor(
            activation,
            &TensorRequirement {
                name: "activation",
                dtype: TensorDtype::F16,
                placement: Placement::Accelerator,
                shape: &[m, k],
            },
        )?;
        let same_device = Placement::Exactly(device);
        check_tensor(
            weight,
            &TensorRequirement {
                name: "weight",
                dtype: TensorDtype::I8,
                placement: same_device,
                shape: &[n, k / bits.elements_per_byte()],
            },
        )?;
        check_tensor(
            scales,
            &TensorRequirement {
                name: "weight_scales",
                dtype: TensorDtype::F16,
                placement: same_device,
                shape: &config.expected_scale_shape(k, n),
            },
        )?;
        if let Some(bias) = bias {
            check_tensor(
                bias,
                &TensorRequirement {
                    name: "bias",
                    dtype: TensorDtype::F16,
                    placement: same_device,
                    shape: &[n],
                },
            )?;
        }

        for (dim, name) in [(m, "m"), (n, "n"), (k, "k")] {
            to_i32(dim, name)?;
        }

        let strategy = KernelStrategy::select(m, &self.policy);
        let workspace_bytes = if strategy.needs_workspace() {
            self.policy.workspace_bytes
        } else {
            0
        };
        Ok(DispatchPlan {
            problem: GemmProblem {
                m,
                n,
                k,
                group_size: config.group_size,
            },
            variant: GemmVariant::new(&config),
            config,
            strategy,
            device,
            workspace_bytes,
        })
    }

    /// Computes `activation x dequant(weight) (+ bias)` into a fresh f16
    /// tensor on the activation's device.
    pub fn run(
        &self,
        activation: &B::Tensor,
        weight: &B::Tensor,
        scales: &B::Tensor,
        bias: Option<&B::Tensor>,
        bits: u32,
    ) -> BackendResult<B::Tensor> {
        let plan = self.plan(activation, weight, scales, bias, bits)?;
        let problem = plan.problem;

        let stream = self.backend.bind_device(plan.device)?;
        let mut output = self
            .backend
            .empty(&stream, &[problem.m, problem.n], TensorDtype::F16)?;
        let mut workspace = if plan.strategy.needs_workspace() {
            Some(
                self.backend
                    .empty(&stream, &[plan.workspace_bytes], TensorDtype::I8)?,
            )
        } else {
            None
        };

        log::debug!(
            "quant GEMM on {} [{}]: m={} n={} k={} group={} variant={} strategy={:?} workspace={}B",
            self.backend.name(),
            plan.device,
            problem.m,
            problem.n,
            problem.k,
            problem.group_size,
            plan.variant,
            plan.strategy,
            plan.workspace_bytes
        );

        let launch = GemmLaunch {
            activation,
            weight,
            scales,
            bias,
            output: &mut output,
            workspace: workspace.as_mut(),
            problem,
            variant: plan.variant,
        };
        match plan.strategy {
            KernelStrategy::BatchedGemv => self.backend.launch_batched_gemv(&stream, launch)?,
            KernelStrategy::TiledGemm => self.backend.launch_tiled_gemm(&stream, launch)?,
        }
        Ok(output)
    }
}

/// [`QuantGemmDispatcher::run`] with the default policy.
pub fn quant_matmul<B: QuantGemmBackend>(
    backend: &B,
    activation: &B::Tensor,
    weight: &B::Tensor,
    scales: &B::Tensor,
    bias: Option<&B::Tensor>,
    bits: u32,
) -> BackendResult<B::Tensor> {
    QuantGemmDispatcher::new(backend).run(activation, weight, scales, bias, bits)
}
