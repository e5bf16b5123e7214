//! TensorInit implementation for CpuBackend.

use sirocco::backend::TensorInit;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::expect_f32;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl TensorInit for CpuBackend {
    fn zeros(_device: &(), shape: &[usize]) -> Result<CpuTensor> {
        Ok(CpuTensor::zeros_f32(shape))
    }

    fn from_f32_slice(_device: &(), shape: &[usize], data: &[f32]) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(CpuTensor::from_f32(shape, data))
    }

    fn copy_into(src: &CpuTensor, dst: &mut CpuTensor) -> Result<()> {
        expect_f32("copy source", src)?;
        expect_f32("copy destination", dst)?;
        if src.numel() != dst.numel() {
            return Err(Error::ShapeMismatch {
                expected: dst.shape().to_vec(),
                got: src.shape().to_vec(),
            });
        }
        dst.as_f32_slice_mut().copy_from_slice(src.as_f32_slice());
        Ok(())
    }
}
