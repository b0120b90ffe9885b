//! Argument checks shared by the dispatcher and the weight preprocessor.
//!
//! Every check names the offending tensor so callers can tell which argument
//! was rejected. Nothing here allocates device memory.

use crate::backend_trait::{BackendError, BackendResult};
use crate::gpu_types::{Device, TensorDtype, TensorView};

/// Where a tensor is required to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Host,
    Accelerator,
    Exactly(Device),
}

impl Placement {
    fn accepts(self, device: Device) -> bool {
        match self {
            Placement::Host => device == Device::Cpu,
            Placement::Accelerator => device.is_accelerator(),
            Placement::Exactly(expected) => device == expected,
        }
    }

    fn describe(self) -> String {
        match self {
            Placement::Host => "the host".to_string(),
            Placement::Accelerator => "an accelerator".to_string(),
            Placement::Exactly(device) => device.to_string(),
        }
    }
}

/// Requirements for one tensor argument.
#[derive(Debug, Clone)]
pub struct TensorRequirement<'a> {
    pub name: &'static str,
    pub dtype: TensorDtype,
    pub placement: Placement,
    pub shape: &'a [usize],
}

/// Checks dtype, placement, contiguity and shape, in that order.
pub fn check_tensor<T: TensorView>(tensor: &T, req: &TensorRequirement<'_>) -> BackendResult<()> {
    check_dtype(tensor, req.name, req.dtype)?;
    check_placement(tensor, req.name, req.placement)?;
    check_contiguous(tensor, req.name)?;
    check_shape(tensor, req.name, req.shape)
}

#[inline]
pub fn check_dtype<T: TensorView>(tensor: &T, name: &'static str, expected: TensorDtype) -> BackendResult<()> {
    let actual = tensor.dtype();
    if actual != expected {
        return Err(BackendError::DtypeMismatch {
            tensor: name,
            expected,
            actual,
        });
    }
    Ok(())
}

#[inline]
pub fn check_placement<T: TensorView>(tensor: &T, name: &'static str, placement: Placement) -> BackendResult<()> {
    let actual = tensor.device();
    if !placement.accepts(actual) {
        return Err(BackendError::DeviceMismatch {
            tensor: name,
            expected: placement.describe(),
            actual,
        });
    }
    Ok(())
}

#[inline]
pub fn check_contiguous<T: TensorView>(tensor: &T, name: &'static str) -> BackendResult<()> {
    if !tensor.is_contiguous() {
        return Err(BackendError::NotContiguous { tensor: name });
    }
    Ok(())
}

#[inline]
pub fn check_shape<T: TensorView>(tensor: &T, name: &'static str, expected: &[usize]) -> BackendResult<()> {
    if tensor.shape() != expected {
        return Err(BackendError::ShapeMismatch {
            tensor: name,
            expected: expected.to_vec(),
            actual: tensor.shape().to_vec(),
        });
    }
    Ok(())
}

#[inline]
pub fn check_rank<T: TensorView>(tensor: &T, name: &'static str, rank: usize) -> BackendResult<()> {
    if tensor.rank() != rank {
        return Err(BackendError::RankMismatch {
            tensor: name,
            expected: match rank {
                1 => "1",
                2 => "2",
                _ => "other",
            },
            actual: tensor.rank(),
        });
    }
    Ok(())
}

/// Fails unless `value` is a multiple of `multiple`.
#[inline]
pub fn check_multiple_of(value: usize, multiple: usize, what: &str) -> BackendResult<()> {
    if multiple == 0 || value % multiple != 0 {
        return Err(BackendError::InvalidConfig(format!(
            "{what} = {value} must be a multiple of {multiple}"
        )));
    }
    Ok(())
}

#[inline]
pub fn check_nonzero(value: usize, what: &str) -> BackendResult<()> {
    if value == 0 {
        return Err(BackendError::InvalidConfig(format!("{what} must be > 0")));
    }
    Ok(())
}

/// Converts a dimension to the kernel ABI's `i32`.
#[inline]
pub fn to_i32(value: usize, name: &str) -> BackendResult<i32> {
    i32::try_from(value)
        .map_err(|_| BackendError::InvalidConfig(format!("{name} = {value} exceeds i32::MAX")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_types::HostTensor;

    #[test]
    fn check_tensor_order_is_dtype_first() {
        let t = HostTensor::zeros(&[2, 3], TensorDtype::F32, Device::Cpu);
        let req = TensorRequirement {
            name: "activation",
            dtype: TensorDtype::F16,
            placement: Placement::Accelerator,
            shape: &[4, 4],
        };
        assert!(matches!(
            check_tensor(&t, &req),
            Err(BackendError::DtypeMismatch { tensor: "activation", .. })
        ));
    }

    #[test]
    fn placement_rules() {
        let host = HostTensor::zeros(&[1], TensorDtype::I8, Device::Cpu);
        let dev1 = HostTensor::zeros(&[1], TensorDtype::I8, Device::Cuda(1));
        assert!(check_placement(&host, "w", Placement::Host).is_ok());
        assert!(check_placement(&host, "w", Placement::Accelerator).is_err());
        assert!(check_placement(&dev1, "w", Placement::Accelerator).is_ok());
        let err = check_placement(&dev1, "w", Placement::Exactly(Device::Cuda(0))).unwrap_err();
        assert_eq!(err.to_string(), "w must be on cuda:0, got cuda:1");
    }

    #[test]
    fn scalar_checks() {
        assert!(check_multiple_of(64, 8, "n").is_ok());
        assert!(check_multiple_of(60, 8, "n").is_err());
        assert!(check_multiple_of(1, 0, "n").is_err());
        assert!(check_nonzero(0, "m").is_err());
        assert_eq!(to_i32(7, "k").unwrap(), 7);
        assert!(to_i32(i32::MAX as usize + 1, "k").is_err());
    }
}
