//! LayerNormOps implementation for CpuBackend.

use sirocco::backend::LayerNormOps;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::expect_f32;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Normalize one row in place: `row := (row - mean) / sqrt(var + eps) *
/// gamma + beta`, with the population variance over the row.
#[allow(clippy::cast_precision_loss)]
fn layer_norm_row(row: &mut [f32], gamma: &[f32], beta: &[f32], eps: f32) {
    let n = row.len() as f32;
    let mean = row.iter().sum::<f32>() / n;
    let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let inv_std = 1.0 / (var + eps).sqrt();
    for (i, x) in row.iter_mut().enumerate() {
        *x = (*x - mean) * inv_std * gamma[i] + beta[i];
    }
}

fn check_norm_params(gamma: &CpuTensor, beta: &CpuTensor, rows_numel: usize) -> Result<usize> {
    let hidden = gamma.numel();
    if beta.numel() != hidden {
        return Err(Error::ShapeMismatch {
            expected: gamma.shape().to_vec(),
            got: beta.shape().to_vec(),
        });
    }
    if hidden == 0 || rows_numel % hidden != 0 {
        return Err(Error::InvalidArgument(format!(
            "layer_norm: {rows_numel} elements do not divide into rows of {hidden}"
        )));
    }
    Ok(hidden)
}

impl LayerNormOps for CpuBackend {
    fn layer_norm(gamma: &CpuTensor, beta: &CpuTensor, x: &mut CpuTensor, eps: f32) -> Result<()> {
        expect_f32("layer_norm gamma", gamma)?;
        expect_f32("layer_norm beta", beta)?;
        expect_f32("layer_norm input", x)?;
        let hidden = check_norm_params(gamma, beta, x.numel())?;

        let gamma_data = gamma.as_f32_slice();
        let beta_data = beta.as_f32_slice();
        let data = x.as_f32_slice_mut();
        for row in data.chunks_mut(hidden) {
            layer_norm_row(row, gamma_data, beta_data, eps);
        }
        Ok(())
    }

    fn add_bias_layer_norm(
        input: &CpuTensor,
        bias: &CpuTensor,
        gamma: &CpuTensor,
        beta: &CpuTensor,
        out: &mut CpuTensor,
        eps: f32,
    ) -> Result<()> {
        expect_f32("add_bias_layer_norm input", input)?;
        expect_f32("add_bias_layer_norm bias", bias)?;
        expect_f32("add_bias_layer_norm output", out)?;
        let hidden = check_norm_params(gamma, beta, out.numel())?;
        if bias.numel() != hidden {
            return Err(Error::ShapeMismatch {
                expected: gamma.shape().to_vec(),
                got: bias.shape().to_vec(),
            });
        }
        if input.numel() != out.numel() {
            return Err(Error::ShapeMismatch {
                expected: out.shape().to_vec(),
                got: input.shape().to_vec(),
            });
        }

        let input_data = input.as_f32_slice();
        let bias_data = bias.as_f32_slice();
        let gamma_data = gamma.as_f32_slice();
        let beta_data = beta.as_f32_slice();
        let data = out.as_f32_slice_mut();
        for (r, row) in data.chunks_mut(hidden).enumerate() {
            let input_row = &input_data[r * hidden..(r + 1) * hidden];
            for (c, x) in row.iter_mut().enumerate() {
                *x += input_row[c] + bias_data[c];
            }
            layer_norm_row(row, gamma_data, beta_data, eps);
        }
        Ok(())
    }
}
