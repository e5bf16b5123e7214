//! Op trait implementations for the CPU backend.

pub mod bias;
pub mod concat;
pub mod gemm;
pub mod init;
pub mod norm;
pub mod softmax;
pub mod transpose;

use sirocco::dtype::DType;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use crate::tensor::CpuTensor;

/// Kernels only compute in f32.
pub(crate) fn expect_f32(name: &str, t: &CpuTensor) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::InvalidArgument(format!(
            "{name} must be f32, got {}",
            t.dtype()
        )));
    }
    Ok(())
}

/// Exact-shape contract check shared by the kernels.
pub(crate) fn expect_shape(t: &CpuTensor, shape: &[usize]) -> Result<()> {
    if t.shape() != shape {
        return Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: t.shape().to_vec(),
        });
    }
    Ok(())
}
