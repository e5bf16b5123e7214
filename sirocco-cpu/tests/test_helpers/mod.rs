//! Shared helpers for attention integration tests.
//!
//! Provides deterministic weight/tensor builders and a naive reference
//! implementation of scaled-dot-product attention with the operator's
//! fusion options, used for parity checks.

use sirocco::{AttentionConfig, AttentionFlags, AttentionWeights, MultiHeadedAttention};
use sirocco_cpu::{CpuBackend, CpuTensor};

/// Additive-mask value for a blocked position.
pub const MASK_OFF: f32 = -1e18;

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!(
            (x - y).abs() <= tol,
            "element {i}: {x} vs {y} exceeds tol {tol}"
        );
    }
}

/// xorshift32, for deterministic test data without a rand dependency.
pub struct Rng(u32);

impl Rng {
    pub fn new(seed: u32) -> Self {
        Self(seed.max(1))
    }

    pub fn next_f32(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        #[allow(clippy::cast_precision_loss)]
        let unit = x as f32 / u32::MAX as f32;
        unit - 0.5
    }

    pub fn fill(&mut self, n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|_| self.next_f32() * scale).collect()
    }
}

pub fn tensor(shape: &[usize], data: &[f32]) -> CpuTensor {
    CpuTensor::from_f32(shape, data)
}

/// A `[batch, 1, q_len, k_len]` all-zero mask: nothing blocked.
pub fn zero_mask(batch: usize, q_len: usize, k_len: usize) -> CpuTensor {
    CpuTensor::zeros_f32(&[batch, 1, q_len, k_len])
}

/// A `[batch, 1, q_len, k_len]` causal mask: query row `q` may attend key
/// positions `0..=offset + q`.
pub fn causal_mask(batch: usize, q_len: usize, k_len: usize, offset: usize) -> CpuTensor {
    let mut data = vec![0.0f32; batch * q_len * k_len];
    for b in 0..batch {
        for q in 0..q_len {
            for k in 0..k_len {
                if k > offset + q {
                    data[(b * q_len + q) * k_len + k] = MASK_OFF;
                }
            }
        }
    }
    CpuTensor::from_f32(&[batch, 1, q_len, k_len], &data)
}

fn eye(n: usize) -> Vec<f32> {
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    data
}

fn transpose2d(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

/// One layer's weights as host vectors, convertible into operator weights
/// and readable by the naive reference.
///
/// Projection matrices are `[hidden, hidden]` row-major `(in, out)`.
pub struct WeightSet {
    pub hidden: usize,
    pub q_w: Vec<f32>,
    pub k_w: Vec<f32>,
    pub v_w: Vec<f32>,
    pub dense_w: Vec<f32>,
    pub q_b: Vec<f32>,
    pub k_b: Vec<f32>,
    pub v_b: Vec<f32>,
    pub dense_b: Vec<f32>,
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

impl WeightSet {
    /// Identity projections, zero biases, unit layer norm.
    pub fn identity(hidden: usize) -> Self {
        Self {
            hidden,
            q_w: eye(hidden),
            k_w: eye(hidden),
            v_w: eye(hidden),
            dense_w: eye(hidden),
            q_b: vec![0.0; hidden],
            k_b: vec![0.0; hidden],
            v_b: vec![0.0; hidden],
            dense_b: vec![0.0; hidden],
            gamma: vec![1.0; hidden],
            beta: vec![0.0; hidden],
        }
    }

    /// Small random weights, deterministic per seed.
    pub fn random(rng: &mut Rng, hidden: usize) -> Self {
        let scale = 0.2;
        Self {
            hidden,
            q_w: rng.fill(hidden * hidden, scale),
            k_w: rng.fill(hidden * hidden, scale),
            v_w: rng.fill(hidden * hidden, scale),
            dense_w: rng.fill(hidden * hidden, scale),
            q_b: rng.fill(hidden, scale),
            k_b: rng.fill(hidden, scale),
            v_b: rng.fill(hidden, scale),
            dense_b: rng.fill(hidden, scale),
            gamma: (0..hidden).map(|_| 1.0 + rng.next_f32() * 0.1).collect(),
            beta: rng.fill(hidden, 0.1),
        }
    }

    /// The fused `[hidden, 3*hidden]` QKV weight: Q, K, V column blocks.
    pub fn qkv_weight(&self) -> Vec<f32> {
        let h = self.hidden;
        let mut out = vec![0.0f32; h * 3 * h];
        for l in 0..h {
            for j in 0..h {
                out[l * 3 * h + j] = self.q_w[l * h + j];
                out[l * 3 * h + h + j] = self.k_w[l * h + j];
                out[l * 3 * h + 2 * h + j] = self.v_w[l * h + j];
            }
        }
        out
    }

    /// The packed `[3, hidden]` QKV bias.
    pub fn qkv_bias(&self) -> Vec<f32> {
        let mut out = self.q_b.clone();
        out.extend_from_slice(&self.k_b);
        out.extend_from_slice(&self.v_b);
        out
    }

    pub fn to_attention_weights(&self) -> AttentionWeights<CpuBackend> {
        let h = self.hidden;
        AttentionWeights {
            q_weight: tensor(&[h, h], &self.q_w),
            k_weight: tensor(&[h, h], &self.k_w),
            v_weight: tensor(&[h, h], &self.v_w),
            q_bias: tensor(&[h], &self.q_b),
            k_bias: tensor(&[h], &self.k_b),
            v_bias: tensor(&[h], &self.v_b),
            qkv_weight: tensor(&[h, 3 * h], &self.qkv_weight()),
            qkv_bias: tensor(&[3, h], &self.qkv_bias()),
            dense_weight: tensor(&[h, h], &self.dense_w),
            dense_bias: tensor(&[h], &self.dense_b),
            layernorm_gamma: tensor(&[h], &self.gamma),
            layernorm_beta: tensor(&[h], &self.beta),
        }
    }

    /// The same weights stored pre-transposed, for `is_trans_weight` calls.
    pub fn to_attention_weights_transposed(&self) -> AttentionWeights<CpuBackend> {
        let h = self.hidden;
        AttentionWeights {
            q_weight: tensor(&[h, h], &transpose2d(&self.q_w, h, h)),
            k_weight: tensor(&[h, h], &transpose2d(&self.k_w, h, h)),
            v_weight: tensor(&[h, h], &transpose2d(&self.v_w, h, h)),
            q_bias: tensor(&[h], &self.q_b),
            k_bias: tensor(&[h], &self.k_b),
            v_bias: tensor(&[h], &self.v_b),
            qkv_weight: tensor(&[3 * h, h], &transpose2d(&self.qkv_weight(), h, 3 * h)),
            qkv_bias: tensor(&[3, h], &self.qkv_bias()),
            dense_weight: tensor(&[h, h], &transpose2d(&self.dense_w, h, h)),
            dense_bias: tensor(&[h], &self.dense_b),
            layernorm_gamma: tensor(&[h], &self.gamma),
            layernorm_beta: tensor(&[h], &self.beta),
        }
    }

    pub fn operator(&self, heads: usize) -> MultiHeadedAttention<CpuBackend> {
        MultiHeadedAttention::new((), AttentionConfig::new(heads), self.to_attention_weights())
            .expect("operator construction")
    }

    pub fn operator_transposed(&self, heads: usize) -> MultiHeadedAttention<CpuBackend> {
        MultiHeadedAttention::new(
            (),
            AttentionConfig::new(heads),
            self.to_attention_weights_transposed(),
        )
        .expect("operator construction")
    }
}

fn layer_norm_rows(data: &[f32], hidden: usize, gamma: &[f32], beta: &[f32], eps: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(data.len());
    #[allow(clippy::cast_precision_loss)]
    let n = hidden as f32;
    for row in data.chunks(hidden) {
        let mean = row.iter().sum::<f32>() / n;
        let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();
        for (c, x) in row.iter().enumerate() {
            out.push((x - mean) * inv_std * gamma[c] + beta[c]);
        }
    }
    out
}

/// `out[r, :] = in[r, :] @ w + bias`, `w` row-major `(in, out)`.
fn project(input: &[f32], w: &[f32], bias: &[f32], rows: usize, hidden: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * hidden];
    for r in 0..rows {
        for j in 0..hidden {
            let mut acc = 0.0f32;
            for l in 0..hidden {
                acc += input[r * hidden + l] * w[l * hidden + j];
            }
            out[r * hidden + j] = acc + bias[j];
        }
    }
    out
}

/// Naive scaled-dot-product attention with the operator's fusion options.
///
/// `mask(b, q, k)` supplies the additive mask. In self mode pass `query`
/// as `key` and `value` with `k_len == q_len`; the separate Q/K/V
/// projections are equivalent to the fused path.
#[allow(clippy::too_many_arguments)]
pub fn naive_attention(
    ws: &WeightSet,
    heads: usize,
    batch: usize,
    q_len: usize,
    k_len: usize,
    query: &[f32],
    key: &[f32],
    value: &[f32],
    mask: &dyn Fn(usize, usize, usize) -> f32,
    flags: AttentionFlags,
    eps: f32,
) -> Vec<f32> {
    let hidden = ws.hidden;
    let d = hidden / heads;
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / (d as f32).sqrt();

    let q_in = if flags.pre_layernorm {
        layer_norm_rows(query, hidden, &ws.gamma, &ws.beta, eps)
    } else {
        query.to_vec()
    };
    let q_proj = project(&q_in, &ws.q_w, &ws.q_b, batch * q_len, hidden);
    let k_proj = project(key, &ws.k_w, &ws.k_b, batch * k_len, hidden);
    let v_proj = project(value, &ws.v_w, &ws.v_b, batch * k_len, hidden);

    let mut context = vec![0.0f32; batch * q_len * hidden];
    for b in 0..batch {
        for h in 0..heads {
            for q in 0..q_len {
                let q_off = (b * q_len + q) * hidden + h * d;
                let mut scores = Vec::with_capacity(k_len);
                for k in 0..k_len {
                    let k_off = (b * k_len + k) * hidden + h * d;
                    let mut dot = 0.0f32;
                    for di in 0..d {
                        dot += q_proj[q_off + di] * k_proj[k_off + di];
                    }
                    scores.push(dot * scale + mask(b, q, k));
                }
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for s in &mut scores {
                    *s = (*s - max).exp();
                    sum += *s;
                }
                for s in &mut scores {
                    *s /= sum;
                }
                for k in 0..k_len {
                    let v_off = (b * k_len + k) * hidden + h * d;
                    for di in 0..d {
                        context[q_off + di] += scores[k] * v_proj[v_off + di];
                    }
                }
            }
        }
    }

    let mut out = project(
        &context,
        &ws.dense_w,
        &vec![0.0f32; hidden],
        batch * q_len,
        hidden,
    );
    if flags.post_add_input {
        for r in 0..batch * q_len {
            for c in 0..hidden {
                out[r * hidden + c] += query[r * hidden + c] + ws.dense_b[c];
            }
        }
    } else if flags.post_layernorm {
        for r in 0..batch * q_len {
            for c in 0..hidden {
                out[r * hidden + c] += query[r * hidden + c] + ws.dense_b[c];
            }
        }
        out = layer_norm_rows(&out, hidden, &ws.gamma, &ws.beta, eps);
    } else {
        for r in 0..batch * q_len {
            for c in 0..hidden {
                out[r * hidden + c] += ws.dense_b[c];
            }
        }
    }
    out
}
