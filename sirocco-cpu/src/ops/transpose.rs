//! ScoreLayoutOps implementation for CpuBackend.
//!
//! These kernels move activations between the row-major `[batch, seq,
//! hidden]` layout the GEMMs produce and the head-major `[batch, heads,
//! seq, head_dim]` layout the scoring batched GEMMs consume, fusing the
//! projection bias into the move where the pipeline wants it.

use sirocco::backend::ScoreLayoutOps;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::{expect_f32, expect_shape};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl ScoreLayoutOps for CpuBackend {
    fn add_bias_transpose_for_score(
        x: &CpuTensor,
        bias: &CpuTensor,
        out: &mut CpuTensor,
    ) -> Result<()> {
        expect_f32("add_bias_transpose input", x)?;
        expect_f32("add_bias_transpose bias", bias)?;
        expect_f32("add_bias_transpose output", out)?;
        if x.ndim() != 4 {
            return Err(Error::InvalidArgument(format!(
                "add_bias_transpose_for_score: input must be [B, S, H, D], got {:?}",
                x.shape()
            )));
        }
        let (b, s, h, d) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        expect_shape(out, &[b, h, s, d])?;
        if bias.numel() != h * d {
            return Err(Error::ShapeMismatch {
                expected: vec![h * d],
                got: bias.shape().to_vec(),
            });
        }

        let x_data = x.as_f32_slice();
        let bias_data = bias.as_f32_slice();
        let out_data = out.as_f32_slice_mut();
        for bi in 0..b {
            for si in 0..s {
                for hi in 0..h {
                    let src = ((bi * s + si) * h + hi) * d;
                    let dst = ((bi * h + hi) * s + si) * d;
                    for di in 0..d {
                        out_data[dst + di] = x_data[src + di] + bias_data[hi * d + di];
                    }
                }
            }
        }
        Ok(())
    }

    fn split_add_bias_transpose_for_score(
        x: &CpuTensor,
        bias: &CpuTensor,
        out: &mut CpuTensor,
    ) -> Result<()> {
        expect_f32("split_add_bias_transpose input", x)?;
        expect_f32("split_add_bias_transpose bias", bias)?;
        expect_f32("split_add_bias_transpose output", out)?;
        if out.ndim() != 5 || out.shape()[0] != 3 {
            return Err(Error::InvalidArgument(format!(
                "split_add_bias_transpose_for_score: output must be [3, B, H, S, D], got {:?}",
                out.shape()
            )));
        }
        let (b, h, s, d) = (
            out.shape()[1],
            out.shape()[2],
            out.shape()[3],
            out.shape()[4],
        );
        let hidden = h * d;
        // Input is the packed fused-QKV GEMM output, partitions in the
        // inner dim: [B, S, 3*hidden].
        expect_shape(x, &[b, s, 3 * hidden])?;
        if bias.numel() != 3 * hidden {
            return Err(Error::ShapeMismatch {
                expected: vec![3, hidden],
                got: bias.shape().to_vec(),
            });
        }

        let x_data = x.as_f32_slice();
        let bias_data = bias.as_f32_slice();
        let out_data = out.as_f32_slice_mut();
        for p in 0..3 {
            for bi in 0..b {
                for si in 0..s {
                    for hi in 0..h {
                        let src = (bi * s + si) * 3 * hidden + p * hidden + hi * d;
                        let dst = (((p * b + bi) * h + hi) * s + si) * d;
                        for di in 0..d {
                            out_data[dst + di] =
                                x_data[src + di] + bias_data[p * hidden + hi * d + di];
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn transpose_for_score(x: &CpuTensor, out: &mut CpuTensor) -> Result<()> {
        expect_f32("transpose_for_score input", x)?;
        expect_f32("transpose_for_score output", out)?;
        if x.ndim() != 4 {
            return Err(Error::InvalidArgument(format!(
                "transpose_for_score: input must be [B, H, S, D], got {:?}",
                x.shape()
            )));
        }
        let (b, h, s, d) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        expect_shape(out, &[b, s, h * d])?;

        let x_data = x.as_f32_slice();
        let out_data = out.as_f32_slice_mut();
        for bi in 0..b {
            for hi in 0..h {
                for si in 0..s {
                    let src = ((bi * h + hi) * s + si) * d;
                    let dst = (bi * s + si) * h * d + hi * d;
                    out_data[dst..dst + d].copy_from_slice(&x_data[src..src + d]);
                }
            }
        }
        Ok(())
    }
}
