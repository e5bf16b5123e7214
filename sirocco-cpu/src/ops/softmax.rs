//! SoftmaxOps implementation for CpuBackend.

use sirocco::backend::SoftmaxOps;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::expect_f32;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Resolved broadcast extents of an attention mask: `[B, mh, mq, K]` with
/// `mh ∈ {1, H}` and `mq ∈ {1, Q}`.
struct MaskDims {
    heads: usize,
    queries: usize,
}

fn resolve_mask_dims(
    mask: &CpuTensor,
    batch: usize,
    heads: usize,
    queries: usize,
    keys: usize,
) -> Result<MaskDims> {
    let bad_mask = || {
        Error::InvalidArgument(format!(
            "attention mask of shape {:?} does not broadcast over scores [{batch}, {heads}, {queries}, {keys}]",
            mask.shape()
        ))
    };
    let shape = mask.shape();
    let (mb, mh, mq, mk) = match shape.len() {
        4 => (shape[0], shape[1], shape[2], shape[3]),
        3 => (shape[0], 1, shape[1], shape[2]),
        _ => return Err(bad_mask()),
    };
    if mb != batch || mk != keys {
        return Err(bad_mask());
    }
    if mh != 1 && mh != heads {
        return Err(bad_mask());
    }
    if mq != 1 && mq != queries {
        return Err(bad_mask());
    }
    Ok(MaskDims {
        heads: mh,
        queries: mq,
    })
}

impl SoftmaxOps for CpuBackend {
    fn apply_mask_and_softmax(
        score: &mut CpuTensor,
        mask: &CpuTensor,
        mask_scale: f32,
    ) -> Result<()> {
        expect_f32("softmax scores", score)?;
        expect_f32("softmax mask", mask)?;
        if mask.is_null() {
            return Err(Error::InvalidArgument(
                "attention mask must not be null".to_string(),
            ));
        }
        if score.ndim() != 4 {
            return Err(Error::InvalidArgument(format!(
                "softmax scores must be [B, H, Q, K], got {:?}",
                score.shape()
            )));
        }
        let (b, h, q, k) = (
            score.shape()[0],
            score.shape()[1],
            score.shape()[2],
            score.shape()[3],
        );
        let mask_dims = resolve_mask_dims(mask, b, h, q, k)?;

        let mask_data = mask.as_f32_slice();
        let data = score.as_f32_slice_mut();
        for bi in 0..b {
            for hi in 0..h {
                let mask_h = if mask_dims.heads == 1 { 0 } else { hi };
                for qi in 0..q {
                    let mask_q = if mask_dims.queries == 1 { 0 } else { qi };
                    let mask_row =
                        ((bi * mask_dims.heads + mask_h) * mask_dims.queries + mask_q) * k;
                    let row_start = ((bi * h + hi) * q + qi) * k;
                    let row = &mut data[row_start..row_start + k];

                    for (ki, x) in row.iter_mut().enumerate() {
                        *x = mask_scale.mul_add(mask_data[mask_row + ki], *x);
                    }

                    // Max-subtracted softmax; a row that underflows to an
                    // all-zero numerator is left at zero.
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0f32;
                    for x in row.iter_mut() {
                        *x = (*x - max).exp();
                        sum += *x;
                    }
                    if sum > 0.0 {
                        for x in row.iter_mut() {
                            *x /= sum;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_sum_to_one() {
        let mut score = CpuTensor::from_f32(&[1, 1, 2, 3], &[1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
        let mask = CpuTensor::zeros_f32(&[1, 1, 1, 3]);
        CpuBackend::apply_mask_and_softmax(&mut score, &mask, 1.0).unwrap();
        let data = score.as_f32_slice();
        for row in data.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
            assert!(row.iter().all(|&x| (0.0..=1.0).contains(&x)));
        }
    }

    #[test]
    fn test_uniform_scores_give_uniform_weights() {
        let mut score = CpuTensor::zeros_f32(&[1, 1, 1, 4]);
        let mask = CpuTensor::zeros_f32(&[1, 1, 1, 4]);
        CpuBackend::apply_mask_and_softmax(&mut score, &mask, 1.0).unwrap();
        for &x in score.as_f32_slice() {
            assert!((x - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_masked_positions_get_no_weight() {
        let mut score = CpuTensor::zeros_f32(&[1, 1, 1, 3]);
        let mask = CpuTensor::from_f32(&[1, 1, 1, 3], &[0.0, -1e18, 0.0]);
        CpuBackend::apply_mask_and_softmax(&mut score, &mask, 1.0).unwrap();
        let data = score.as_f32_slice();
        assert!(data[1] < 1e-6);
        assert!((data[0] - 0.5).abs() < 1e-5);
        assert!((data[2] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_rank3_mask_broadcasts_over_heads() {
        let mut score = CpuTensor::zeros_f32(&[1, 2, 2, 2]);
        #[rustfmt::skip]
        let mask = CpuTensor::from_f32(&[1, 2, 2], &[
            0.0, -1e18,
            0.0, 0.0,
        ]);
        CpuBackend::apply_mask_and_softmax(&mut score, &mask, 1.0).unwrap();
        let data = score.as_f32_slice();
        for head in 0..2 {
            let base = head * 4;
            assert!((data[base] - 1.0).abs() < 1e-5);
            assert!(data[base + 1] < 1e-6);
            assert!((data[base + 2] - 0.5).abs() < 1e-5);
            assert!((data[base + 3] - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mask_scale_applies() {
        let mut score = CpuTensor::zeros_f32(&[1, 1, 1, 2]);
        // A mild mask scaled up to a hard one.
        let mask = CpuTensor::from_f32(&[1, 1, 1, 2], &[0.0, -1e9]);
        CpuBackend::apply_mask_and_softmax(&mut score, &mask, 1e9).unwrap();
        let data = score.as_f32_slice();
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert!(data[1] < 1e-6);
    }

    #[test]
    fn test_incompatible_mask_rejected() {
        let mut score = CpuTensor::zeros_f32(&[1, 1, 2, 3]);
        let mask = CpuTensor::zeros_f32(&[1, 1, 2, 4]);
        assert!(CpuBackend::apply_mask_and_softmax(&mut score, &mask, 1.0).is_err());
    }
}
