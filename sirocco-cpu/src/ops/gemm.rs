//! GemmOps implementation for CpuBackend.
//!
//! Plain f32 row-major kernels. `matmul` flattens the leading dims of `A`
//! into rows, so `[B, S, K] × [K, N]` works directly on `[batch, seq,
//! hidden]` activations; `batch_matmul` runs one gemm per leading-dim
//! slice with singleton-batch broadcasting.

use sirocco::backend::GemmOps;
use sirocco::tensor::Tensor;
use sirocco::{Error, Result};

use super::expect_f32;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// `C := alpha * op(A)·op(B) + beta * C` on row-major 2-D slices.
///
/// `op(A)` is `(m, k)`, `op(B)` is `(k, n)`. The transpose flags select
/// the storage interpretation: with `trans_a` the slice `a` is stored
/// `(k, m)`, with `trans_b` the slice `b` is stored `(n, k)`.
#[allow(clippy::too_many_arguments, clippy::many_single_char_names)]
fn gemm(
    a: &[f32],
    trans_a: bool,
    b: &[f32],
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    c: &mut [f32],
    beta: f32,
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for l in 0..k {
                let a_val = if trans_a { a[l * m + i] } else { a[i * k + l] };
                let b_val = if trans_b { b[j * k + l] } else { b[l * n + j] };
                acc = a_val.mul_add(b_val, acc);
            }
            let idx = i * n + j;
            let prev = if beta == 0.0 { 0.0 } else { beta * c[idx] };
            c[idx] = alpha.mul_add(acc, prev);
        }
    }
}

/// Matrix dims of `op(X)` given the stored `(rows, cols)` and a transpose
/// flag.
fn op_dims(rows: usize, cols: usize, trans: bool) -> (usize, usize) {
    if trans {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

impl GemmOps for CpuBackend {
    fn matmul(
        a: &CpuTensor,
        trans_a: bool,
        b: &CpuTensor,
        trans_b: bool,
        alpha: f32,
        c: &mut CpuTensor,
        beta: f32,
    ) -> Result<()> {
        expect_f32("matmul A", a)?;
        expect_f32("matmul B", b)?;
        expect_f32("matmul C", c)?;
        if b.ndim() != 2 {
            return Err(Error::InvalidArgument(format!(
                "matmul: weight must be 2-D, got shape {:?}",
                b.shape()
            )));
        }
        if a.ndim() == 0 {
            return Err(Error::InvalidArgument(
                "matmul: input must not be a scalar".to_string(),
            ));
        }

        let a_cols = *a.shape().last().expect("rank checked above");
        let a_rows = a.numel() / a_cols;
        let (m, k) = op_dims(a_rows, a_cols, trans_a);
        let (bk, n) = op_dims(b.shape()[0], b.shape()[1], trans_b);
        if k != bk {
            return Err(Error::InvalidArgument(format!(
                "matmul: inner dims differ, op(A) is {m}x{k} but op(B) is {bk}x{n}"
            )));
        }
        if c.numel() != m * n {
            return Err(Error::ShapeMismatch {
                expected: vec![m, n],
                got: c.shape().to_vec(),
            });
        }

        gemm(
            a.as_f32_slice(),
            trans_a,
            b.as_f32_slice(),
            trans_b,
            m,
            n,
            k,
            alpha,
            c.as_f32_slice_mut(),
            beta,
        );
        Ok(())
    }

    fn batch_matmul(
        a: &CpuTensor,
        trans_a: bool,
        b: &CpuTensor,
        trans_b: bool,
        alpha: f32,
        c: &mut CpuTensor,
        beta: f32,
    ) -> Result<()> {
        expect_f32("batch_matmul A", a)?;
        expect_f32("batch_matmul B", b)?;
        expect_f32("batch_matmul C", c)?;
        for (name, t) in [("A", a), ("B", b), ("C", &*c)] {
            if t.ndim() < 2 {
                return Err(Error::InvalidArgument(format!(
                    "batch_matmul: {name} must have rank >= 2, got shape {:?}",
                    t.shape()
                )));
            }
        }

        let (a_rows, a_cols) = trailing_matrix(a);
        let (b_rows, b_cols) = trailing_matrix(b);
        let batch_a = a.numel() / (a_rows * a_cols);
        let batch_b = b.numel() / (b_rows * b_cols);
        let (m, k) = op_dims(a_rows, a_cols, trans_a);
        let (bk, n) = op_dims(b_rows, b_cols, trans_b);
        if k != bk {
            return Err(Error::InvalidArgument(format!(
                "batch_matmul: inner dims differ, op(A) is {m}x{k} but op(B) is {bk}x{n}"
            )));
        }

        let batch = batch_a.max(batch_b);
        if (batch_a != batch && batch_a != 1) || (batch_b != batch && batch_b != 1) {
            return Err(Error::InvalidArgument(format!(
                "batch_matmul: incompatible batch dims {batch_a} and {batch_b}"
            )));
        }
        if c.numel() != batch * m * n {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, m, n],
                got: c.shape().to_vec(),
            });
        }

        let a_data = a.as_f32_slice();
        let b_data = b.as_f32_slice();
        let c_data = c.as_f32_slice_mut();
        let a_stride = a_rows * a_cols;
        let b_stride = b_rows * b_cols;
        let c_stride = m * n;

        for i in 0..batch {
            let ia = if batch_a == 1 { 0 } else { i };
            let ib = if batch_b == 1 { 0 } else { i };
            gemm(
                &a_data[ia * a_stride..(ia + 1) * a_stride],
                trans_a,
                &b_data[ib * b_stride..(ib + 1) * b_stride],
                trans_b,
                m,
                n,
                k,
                alpha,
                &mut c_data[i * c_stride..(i + 1) * c_stride],
                beta,
            );
        }
        Ok(())
    }
}

/// The trailing `(rows, cols)` matrix dims of a rank >= 2 tensor.
fn trailing_matrix(t: &CpuTensor) -> (usize, usize) {
    let shape = t.shape();
    (shape[shape.len() - 2], shape[shape.len() - 1])
}
