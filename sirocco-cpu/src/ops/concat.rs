//! ConcatOps implementation for CpuBackend.

use sirocco::backend::ConcatOps;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::expect_f32;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl ConcatOps for CpuBackend {
    fn concat(a: &CpuTensor, b: &CpuTensor, axis: usize, out: &mut CpuTensor) -> Result<()> {
        expect_f32("concat A", a)?;
        expect_f32("concat B", b)?;
        expect_f32("concat output", out)?;
        let rank = a.ndim();
        if b.ndim() != rank || out.ndim() != rank || axis >= rank {
            return Err(Error::InvalidArgument(format!(
                "concat: incompatible ranks {:?}, {:?}, {:?} for axis {axis}",
                a.shape(),
                b.shape(),
                out.shape()
            )));
        }
        for i in 0..rank {
            let expected = if i == axis {
                a.shape()[i] + b.shape()[i]
            } else {
                if a.shape()[i] != b.shape()[i] {
                    return Err(Error::InvalidArgument(format!(
                        "concat: shapes {:?} and {:?} disagree outside axis {axis}",
                        a.shape(),
                        b.shape()
                    )));
                }
                a.shape()[i]
            };
            if out.shape()[i] != expected {
                return Err(Error::ShapeMismatch {
                    expected: (0..rank)
                        .map(|j| {
                            if j == axis {
                                a.shape()[j] + b.shape()[j]
                            } else {
                                a.shape()[j]
                            }
                        })
                        .collect(),
                    got: out.shape().to_vec(),
                });
            }
        }

        // Row-major: everything from `axis` inward is one contiguous block
        // per outer index, so the result interleaves A and B blocks.
        let outer: usize = a.shape()[..axis].iter().product();
        let a_block: usize = a.shape()[axis..].iter().product();
        let b_block: usize = b.shape()[axis..].iter().product();

        let a_data = a.as_f32_slice();
        let b_data = b.as_f32_slice();
        let out_data = out.as_f32_slice_mut();
        let out_block = a_block + b_block;
        for o in 0..outer {
            out_data[o * out_block..o * out_block + a_block]
                .copy_from_slice(&a_data[o * a_block..(o + 1) * a_block]);
            out_data[o * out_block + a_block..(o + 1) * out_block]
                .copy_from_slice(&b_data[o * b_block..(o + 1) * b_block]);
        }
        Ok(())
    }
}
