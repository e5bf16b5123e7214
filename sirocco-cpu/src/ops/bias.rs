//! BiasOps implementation for CpuBackend.

use sirocco::backend::BiasOps;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::expect_f32;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

fn check_rows(bias: &CpuTensor, out: &CpuTensor) -> Result<usize> {
    let cols = bias.numel();
    if cols == 0 || out.numel() % cols != 0 {
        return Err(Error::InvalidArgument(format!(
            "bias of {cols} elements does not broadcast over output shape {:?}",
            out.shape()
        )));
    }
    Ok(cols)
}

impl BiasOps for CpuBackend {
    fn add_bias(bias: &CpuTensor, out: &mut CpuTensor) -> Result<()> {
        expect_f32("add_bias bias", bias)?;
        expect_f32("add_bias output", out)?;
        let cols = check_rows(bias, out)?;

        let bias_data = bias.as_f32_slice();
        let data = out.as_f32_slice_mut();
        for row in data.chunks_mut(cols) {
            for (c, x) in row.iter_mut().enumerate() {
                *x += bias_data[c];
            }
        }
        Ok(())
    }

    fn add_input_bias(input: &CpuTensor, bias: &CpuTensor, out: &mut CpuTensor) -> Result<()> {
        expect_f32("add_input_bias input", input)?;
        expect_f32("add_input_bias bias", bias)?;
        expect_f32("add_input_bias output", out)?;
        if input.numel() != out.numel() {
            return Err(Error::ShapeMismatch {
                expected: out.shape().to_vec(),
                got: input.shape().to_vec(),
            });
        }
        let cols = check_rows(bias, out)?;

        let input_data = input.as_f32_slice();
        let bias_data = bias.as_f32_slice();
        let data = out.as_f32_slice_mut();
        for (r, row) in data.chunks_mut(cols).enumerate() {
            let input_row = &input_data[r * cols..(r + 1) * cols];
            for (c, x) in row.iter_mut().enumerate() {
                *x += input_row[c] + bias_data[c];
            }
        }
        Ok(())
    }
}
