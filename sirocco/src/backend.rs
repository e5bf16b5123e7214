//! Backend trait and op trait definitions for hardware-agnostic attention.
//!
//! The attention operator is generic over `B: Backend` and expresses its
//! compute requirements through op traits like [`GemmOps`] or
//! [`SoftmaxOps`]. Each backend (CPU, accelerator) implements these traits
//! with its own tensor type; the operator itself never touches storage.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`** — they use `Self::Tensor` from the
//!   supertrait, avoiding repetition.
//! - **Kernels take pre-shaped outputs.** Every kernel writes into a tensor
//!   the dispatcher allocated (or re-used) with the exact expected shape,
//!   and validates that shape rather than inferring it. This keeps the
//!   in-place/out-of-place decisions in the dispatcher, where cache-reuse
//!   is decided.
//! - **All compute is f32.** Kernels reject other dtypes.

use crate::tensor::Tensor;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend (CPU, accelerator, ...).
pub trait Backend: 'static {
    /// The tensor type for this backend (e.g., `CpuTensor`).
    type Tensor: Tensor + Clone + Send + Sync;

    /// Opaque device handle used for allocation.
    ///
    /// The operator stores one and passes it to [`TensorInit`] calls. For
    /// CPU this is `()`; an accelerator backend would carry its context
    /// (BLAS handles, streams, workspace) here, which is also the
    /// granularity at which calls are serialized.
    type DeviceHandle: Clone + Send + Sync;
}

// ---- Op traits ----

/// Creating and filling tensors.
pub trait TensorInit: Backend {
    /// Allocate a zero-filled f32 tensor on the device.
    fn zeros(device: &Self::DeviceHandle, shape: &[usize]) -> Result<Self::Tensor>;

    /// Create an f32 tensor from host data.
    fn from_f32_slice(
        device: &Self::DeviceHandle,
        shape: &[usize],
        data: &[f32],
    ) -> Result<Self::Tensor>;

    /// Copy `src` into `dst`. Shapes must carry the same element count.
    fn copy_into(src: &Self::Tensor, dst: &mut Self::Tensor) -> Result<()>;
}

/// Dense matrix multiplication.
pub trait GemmOps: Backend {
    /// `C := alpha * op(A) * op(B) + beta * C`.
    ///
    /// `A`'s leading dims are flattened into rows, so a `[B, S, K]` input
    /// acts as a `[B*S, K]` matrix; `B` must be 2-D. `op` is identity or
    /// transpose per the corresponding flag.
    #[allow(clippy::too_many_arguments)]
    fn matmul(
        a: &Self::Tensor,
        trans_a: bool,
        b: &Self::Tensor,
        trans_b: bool,
        alpha: f32,
        c: &mut Self::Tensor,
        beta: f32,
    ) -> Result<()>;

    /// Batched `C := alpha * op(A) * op(B) + beta * C` over the leading
    /// dims, with broadcasting when one operand has a singleton batch.
    ///
    /// The trailing two dims of each operand are the matrix; `op` applies
    /// to those dims only.
    #[allow(clippy::too_many_arguments)]
    fn batch_matmul(
        a: &Self::Tensor,
        trans_a: bool,
        b: &Self::Tensor,
        trans_b: bool,
        alpha: f32,
        c: &mut Self::Tensor,
        beta: f32,
    ) -> Result<()>;
}

/// Row-wise layer normalization over the last dim.
pub trait LayerNormOps: Backend {
    /// In-place `x := (x - mean) / sqrt(var + eps) * gamma + beta`,
    /// normalizing each row of the last dim.
    fn layer_norm(
        gamma: &Self::Tensor,
        beta: &Self::Tensor,
        x: &mut Self::Tensor,
        eps: f32,
    ) -> Result<()>;

    /// Fused residual epilogue: `out := layer_norm(input + out + bias)`.
    ///
    /// `input` broadcasts nothing; `bias` broadcasts over rows.
    fn add_bias_layer_norm(
        input: &Self::Tensor,
        bias: &Self::Tensor,
        gamma: &Self::Tensor,
        beta: &Self::Tensor,
        out: &mut Self::Tensor,
        eps: f32,
    ) -> Result<()>;
}

/// Elementwise bias fusions.
pub trait BiasOps: Backend {
    /// `out := out + bias`, bias broadcast over rows.
    fn add_bias(bias: &Self::Tensor, out: &mut Self::Tensor) -> Result<()>;

    /// Residual epilogue without normalization:
    /// `out := out + input + bias`, bias broadcast over rows.
    fn add_input_bias(
        input: &Self::Tensor,
        bias: &Self::Tensor,
        out: &mut Self::Tensor,
    ) -> Result<()>;
}

/// Head-major layout changes fused with bias addition.
///
/// "Score layout" is `[batch, heads, seq, head_dim]`, the layout the
/// scoring batched GEMMs consume.
pub trait ScoreLayoutOps: Backend {
    /// `out[b, h, s, d] := x[b, s, h, d] + bias[h*D + d]`.
    ///
    /// `x: [B, S, H, D]`, `bias: [H*D]`, `out: [B, H, S, D]`.
    fn add_bias_transpose_for_score(
        x: &Self::Tensor,
        bias: &Self::Tensor,
        out: &mut Self::Tensor,
    ) -> Result<()>;

    /// Unpack a fused QKV projection into score layout, one partition per
    /// projection:
    /// `out[p, b, h, s, d] := x[b, s, p*H*D + h*D + d] + bias[p, h*D + d]`.
    ///
    /// `x: [B, S, 3*H*D]` (the row-major fused-GEMM output),
    /// `bias: [3, H*D]`, `out: [3, B, H, S, D]`.
    fn split_add_bias_transpose_for_score(
        x: &Self::Tensor,
        bias: &Self::Tensor,
        out: &mut Self::Tensor,
    ) -> Result<()>;

    /// Inverse layout change, back to row-major hidden:
    /// `out[b, s, h*D + d] := x[b, h, s, d]`.
    ///
    /// `x: [B, H, S, D]`, `out: [B, S, H*D]`.
    fn transpose_for_score(x: &Self::Tensor, out: &mut Self::Tensor) -> Result<()>;
}

/// Masked softmax over attention scores.
pub trait SoftmaxOps: Backend {
    /// In-place `score := softmax(score + mask_scale * mask)` along the
    /// last dim, with max-subtraction for numerical stability.
    ///
    /// `score: [B, H, Q, K]`. The additive mask broadcasts across heads
    /// (and across query rows when its Q axis is 1); accepted shapes are
    /// `[B, H, Q, K]`, `[B, 1, Q, K]`, `[B, 1, 1, K]`, `[B, Q, K]` and
    /// `[B, 1, K]`. Masked positions carry large negative values.
    fn apply_mask_and_softmax(
        score: &mut Self::Tensor,
        mask: &Self::Tensor,
        mask_scale: f32,
    ) -> Result<()>;
}

/// Tensor concatenation.
pub trait ConcatOps: Backend {
    /// `out := A ⊕ B` along `axis`; all other axes must agree, and `out`
    /// must be pre-shaped to the concatenated extent.
    fn concat(
        a: &Self::Tensor,
        b: &Self::Tensor,
        axis: usize,
        out: &mut Self::Tensor,
    ) -> Result<()>;
}

/// Everything the attention operator needs from a backend.
///
/// Blanket-implemented; backends implement the individual op traits.
pub trait AttentionBackend:
    TensorInit + GemmOps + LayerNormOps + BiasOps + ScoreLayoutOps + SoftmaxOps + ConcatOps
{
}

impl<B> AttentionBackend for B where
    B: TensorInit + GemmOps + LayerNormOps + BiasOps + ScoreLayoutOps + SoftmaxOps + ConcatOps
{
}
