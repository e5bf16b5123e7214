//! Fused multi-headed attention operator.
//!
//! One operator instance holds the projection weights for a single layer
//! and serves both attention graphs of a decoder step:
//!
//! - **context** — cross-attention over a source sequence, with an
//!   optional `memory_*` cache that is filled once and then re-read;
//! - **self** — attention of the query sequence over itself, with an
//!   optional `self_*` cache that grows by `query_len` tokens per call.
//!
//! The forward pass picks one of four computation graphs (context/self ×
//! cache-hit/cache-miss), runs the fused kernel sequence
//! GEMM → bias+transpose → batched GEMM → masked softmax → batched GEMM →
//! transpose → GEMM → output fusion, and records for each of Q, K, V
//! whether its storage is call-scoped, a view into the packed QKV
//! projection, or aliased with a caller-owned cache slot.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::backend::{
    Backend, BiasOps, ConcatOps, GemmOps, LayerNormOps, ScoreLayoutOps, SoftmaxOps, TensorInit,
};
use crate::cache::{CacheBinding, LayerCache};
use crate::config::AttentionConfig;
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Which attention graph to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttnKind {
    /// Attention of the query sequence over itself, with optional
    /// incremental caching along the sequence axis.
    SelfAttn,
    /// Cross-attention over a separately projected source sequence.
    Context,
}

impl AttnKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SelfAttn => "self",
            Self::Context => "context",
        }
    }
}

impl fmt::Display for AttnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttnKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "self" => Ok(Self::SelfAttn),
            "context" => Ok(Self::Context),
            other => Err(Error::InvalidArgument(format!(
                "attention kind must be \"self\" or \"context\", got {other:?}"
            ))),
        }
    }
}

/// Per-call behavior switches.
///
/// `post_layernorm` and `post_add_input` are mutually exclusive; the
/// combination is rejected up front. When `post_add_input` is set the
/// output fusion is `output + dense_bias + query` with no normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionFlags {
    /// Layer-normalize the query before the Q/QKV projection.
    pub pre_layernorm: bool,
    /// Fuse `layer_norm(query + output + dense_bias)` into the epilogue.
    pub post_layernorm: bool,
    /// Fuse `output + dense_bias + query` into the epilogue.
    pub post_add_input: bool,
    /// Stored weights are pre-transposed relative to the GEMM layout.
    pub is_trans_weight: bool,
}

/// Projection weights for one attention layer, immutable for the
/// operator's lifetime.
///
/// The separate `q/k/v` projections serve context mode; the fused
/// `qkv_weight` (`[hidden, 3*hidden]`, or its transpose) serves self mode.
pub struct AttentionWeights<B: Backend> {
    pub q_weight: B::Tensor,
    pub k_weight: B::Tensor,
    pub v_weight: B::Tensor,
    pub q_bias: B::Tensor,
    pub k_bias: B::Tensor,
    pub v_bias: B::Tensor,
    pub qkv_weight: B::Tensor,
    pub qkv_bias: B::Tensor,
    pub dense_weight: B::Tensor,
    pub dense_bias: B::Tensor,
    pub layernorm_gamma: B::Tensor,
    pub layernorm_beta: B::Tensor,
}

/// Provenance of a Q/K/V tensor handed to the scoring stage.
///
/// Handles share backing storage, so every variant carries a cheap clone;
/// the tag records the aliasing discipline: `Owned` and `View` storage
/// dies with the call, `Cache` storage belongs to the caller and survives
/// it.
enum KvSource<T> {
    /// Call-scoped tensor owned by the dispatcher.
    Owned(T),
    /// View into another call-scoped tensor (the packed QKV projection),
    /// which must outlive scoring.
    View(T),
    /// Shares storage with a caller-owned cache slot.
    Cache(T),
}

impl<T> KvSource<T> {
    fn tensor(&self) -> &T {
        match self {
            Self::Owned(t) | Self::View(t) | Self::Cache(t) => t,
        }
    }

    const fn provenance(&self) -> &'static str {
        match self {
            Self::Owned(_) => "owned",
            Self::View(_) => "view",
            Self::Cache(_) => "cache",
        }
    }
}

/// Shapes resolved by the invariants guard, fixed for the rest of the call.
#[derive(Clone, Copy)]
struct Dims {
    batch: usize,
    query_len: usize,
    /// Source length before any cache concatenation.
    key_len: usize,
    hidden: usize,
    head_dim: usize,
}

/// Fused multi-headed attention operator for one layer.
///
/// `forward` calls on one handle are serialized by an internal executor
/// lock: kernel-library state (workspaces, BLAS contexts, device streams)
/// is owned per handle and assumed non-reentrant. Distinct handles may run
/// concurrently.
pub struct MultiHeadedAttention<B: Backend> {
    device: B::DeviceHandle,
    num_heads: usize,
    layernorm_eps: f32,
    weights: AttentionWeights<B>,
    exec_lock: Mutex<()>,
}

impl<B: Backend> MultiHeadedAttention<B> {
    /// Build an operator from config and weights.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] when the head count is zero or
    /// does not divide the hidden size carried by `dense_bias`.
    pub fn new(
        device: B::DeviceHandle,
        config: AttentionConfig,
        weights: AttentionWeights<B>,
    ) -> Result<Self> {
        if weights.dense_bias.ndim() != 1 {
            return Err(Error::InvalidArgument(format!(
                "dense_bias must have rank 1, got shape {:?}",
                weights.dense_bias.shape()
            )));
        }
        let hidden = weights.dense_bias.shape()[0];
        if config.num_attention_heads == 0 || hidden % config.num_attention_heads != 0 {
            return Err(Error::InvalidArgument(format!(
                "num_attention_heads {} must divide hidden size {hidden}",
                config.num_attention_heads
            )));
        }
        Ok(Self {
            device,
            num_heads: config.num_attention_heads,
            layernorm_eps: config.layernorm_eps,
            weights,
            exec_lock: Mutex::new(()),
        })
    }

    /// The hidden size this operator projects, `H * D`.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.weights.dense_bias.shape()[0]
    }
}

impl<B> MultiHeadedAttention<B>
where
    B: TensorInit + GemmOps + LayerNormOps + BiasOps + ScoreLayoutOps + SoftmaxOps + ConcatOps,
{
    /// Run one attention step.
    ///
    /// `output` is overwritten with a `[batch, query_len, hidden]` tensor.
    /// When `att_score` is `Some`, the post-softmax attention matrix
    /// `[batch, heads, query_len, key_len]` is left in the sink; when
    /// `None` the scores stay call-scoped and are released on exit. Cache
    /// slots in `layer_cache` are read and written as dictated by `kind`
    /// and slot liveness; `None` disables caching entirely.
    ///
    /// In self mode `key` and `value` are ignored — Q, K and V all derive
    /// from `query` through the fused projection.
    ///
    /// # Errors
    /// `InvalidArgument` for malformed inputs or flag conflicts,
    /// `InvariantViolation` for an unpaired memory cache, and any backend
    /// failure propagated unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        key: &B::Tensor,
        value: &B::Tensor,
        query: &B::Tensor,
        attention_mask: &B::Tensor,
        kind: AttnKind,
        output: &mut B::Tensor,
        att_score: Option<&mut B::Tensor>,
        layer_cache: Option<&mut LayerCache<B::Tensor>>,
        flags: AttentionFlags,
    ) -> Result<()> {
        let _exec = self
            .exec_lock
            .lock()
            .map_err(|_| Error::ResourceFailure("executor lock poisoned".to_string()))?;

        let dims = self.validate(key, value, query, kind, flags)?;
        debug!(
            kind = %kind,
            batch = dims.batch,
            query_len = dims.query_len,
            key_len = dims.key_len,
            hidden = dims.hidden,
            "multi-headed attention forward"
        );
        self.trace_weights();

        let binding = CacheBinding::resolve(layer_cache.as_deref())?;
        trace!(
            cache = binding.present,
            memory_live = binding.memory_live(),
            self_keys_live = binding.self_keys_live,
            self_values_live = binding.self_values_live,
            "cache binding"
        );

        let (q, k, v) = match kind {
            AttnKind::Context => self.project_context(key, value, query, layer_cache, dims, flags)?,
            AttnKind::SelfAttn => self.project_self(query, layer_cache, dims, flags)?,
        };
        trace!(
            q = q.provenance(),
            k = k.provenance(),
            v = v.provenance(),
            "projection storage"
        );

        self.score(query, attention_mask, &q, &k, &v, output, att_score, dims, flags)
    }

    /// Pre-condition checks; nothing is allocated or mutated before these
    /// pass.
    fn validate(
        &self,
        key: &B::Tensor,
        value: &B::Tensor,
        query: &B::Tensor,
        kind: AttnKind,
        flags: AttentionFlags,
    ) -> Result<Dims> {
        for (name, t) in [("key", key), ("value", value), ("query", query)] {
            if t.ndim() != 3 {
                return Err(Error::InvalidArgument(format!(
                    "{name} tensor must have rank 3 [batch, seq, hidden], got shape {:?}",
                    t.shape()
                )));
            }
        }
        if key.shape()[0] != value.shape()[0] {
            return Err(Error::InvalidArgument(format!(
                "key and value batch sizes differ: {} vs {}",
                key.shape()[0],
                value.shape()[0]
            )));
        }
        if flags.post_layernorm && flags.post_add_input {
            return Err(Error::InvalidArgument(
                "post_layernorm and post_add_input are mutually exclusive".to_string(),
            ));
        }

        let batch = query.shape()[0];
        let query_len = query.shape()[1];
        let hidden = query.shape()[2];
        if hidden % self.num_heads != 0 {
            return Err(Error::InvalidArgument(format!(
                "hidden size {hidden} is not divisible by {} heads",
                self.num_heads
            )));
        }

        let key_len = match kind {
            AttnKind::Context => {
                for (name, t) in [("key", key), ("value", value)] {
                    if !query.device().same_device(t.device()) {
                        return Err(Error::InvalidArgument(format!(
                            "query and {name} tensors must be co-located, got {:?} vs {:?}",
                            query.device(),
                            t.device()
                        )));
                    }
                }
                if key.shape()[0] != batch {
                    return Err(Error::InvalidArgument(format!(
                        "query and key batch sizes differ: {batch} vs {}",
                        key.shape()[0]
                    )));
                }
                if key.shape()[1] != value.shape()[1] {
                    return Err(Error::InvalidArgument(format!(
                        "key and value sequence lengths differ: {} vs {}",
                        key.shape()[1],
                        value.shape()[1]
                    )));
                }
                if key.shape()[2] != hidden || value.shape()[2] != hidden {
                    return Err(Error::InvalidArgument(format!(
                        "key/value hidden sizes must equal {hidden}, got {} and {}",
                        key.shape()[2],
                        value.shape()[2]
                    )));
                }
                key.shape()[1]
            }
            AttnKind::SelfAttn => query_len,
        };

        Ok(Dims {
            batch,
            query_len,
            key_len,
            hidden,
            head_dim: hidden / self.num_heads,
        })
    }

    /// Context-mode projections: Q always, K/V only on a memory-cache miss.
    fn project_context(
        &self,
        key: &B::Tensor,
        value: &B::Tensor,
        query: &B::Tensor,
        cache: Option<&mut LayerCache<B::Tensor>>,
        dims: Dims,
        flags: AttentionFlags,
    ) -> Result<(KvSource<B::Tensor>, KvSource<B::Tensor>, KvSource<B::Tensor>)> {
        let w = &self.weights;
        let Dims {
            batch,
            query_len,
            hidden,
            head_dim,
            ..
        } = dims;

        let mut q_out1 = B::zeros(&self.device, &[batch, query_len, hidden])?;
        if flags.pre_layernorm {
            let mut normed = B::zeros(&self.device, &[batch, query_len, hidden])?;
            B::copy_into(query, &mut normed)?;
            B::layer_norm(&w.layernorm_gamma, &w.layernorm_beta, &mut normed, self.layernorm_eps)?;
            B::matmul(&normed, false, &w.q_weight, flags.is_trans_weight, 1.0, &mut q_out1, 0.0)?;
        } else {
            B::matmul(query, false, &w.q_weight, flags.is_trans_weight, 1.0, &mut q_out1, 0.0)?;
        }
        let q_heads = q_out1.view_as(&[batch, query_len, self.num_heads, head_dim])?;
        let mut q_out2 = B::zeros(&self.device, &[batch, self.num_heads, query_len, head_dim])?;
        B::add_bias_transpose_for_score(&q_heads, &w.q_bias, &mut q_out2)?;
        let q = KvSource::Owned(q_out2);

        let (k, v) = if let Some(cache) = cache {
            let hit = cache
                .memory_pair()
                .map(|(ck, cv)| (ck.clone(), cv.clone()));
            if let Some((ck, cv)) = hit {
                (KvSource::Cache(ck), KvSource::Cache(cv))
            } else {
                // Cache fill: the projections land in the caller's slots.
                let (k2, v2) = self.project_kv(key, value, dims, flags)?;
                cache.memory_keys = Some(k2.clone());
                cache.memory_values = Some(v2.clone());
                (KvSource::Cache(k2), KvSource::Cache(v2))
            }
        } else {
            let (k2, v2) = self.project_kv(key, value, dims, flags)?;
            (KvSource::Owned(k2), KvSource::Owned(v2))
        };

        Ok((q, k, v))
    }

    /// Project the source K and V into score layout `[B, H, K, D]`.
    fn project_kv(
        &self,
        key: &B::Tensor,
        value: &B::Tensor,
        dims: Dims,
        flags: AttentionFlags,
    ) -> Result<(B::Tensor, B::Tensor)> {
        let w = &self.weights;
        let Dims {
            batch,
            key_len,
            hidden,
            head_dim,
            ..
        } = dims;

        let mut k_out1 = B::zeros(&self.device, &[batch, key_len, hidden])?;
        let mut v_out1 = B::zeros(&self.device, &[batch, key_len, hidden])?;
        B::matmul(key, false, &w.k_weight, flags.is_trans_weight, 1.0, &mut k_out1, 0.0)?;
        B::matmul(value, false, &w.v_weight, flags.is_trans_weight, 1.0, &mut v_out1, 0.0)?;

        let k_heads = k_out1.view_as(&[batch, key_len, self.num_heads, head_dim])?;
        let v_heads = v_out1.view_as(&[batch, key_len, self.num_heads, head_dim])?;
        let mut k_out2 = B::zeros(&self.device, &[batch, self.num_heads, key_len, head_dim])?;
        let mut v_out2 = B::zeros(&self.device, &[batch, self.num_heads, key_len, head_dim])?;
        B::add_bias_transpose_for_score(&k_heads, &w.k_bias, &mut k_out2)?;
        B::add_bias_transpose_for_score(&v_heads, &w.v_bias, &mut v_out2)?;
        Ok((k_out2, v_out2))
    }

    /// Self-mode projection: one fused QKV GEMM, split into score layout,
    /// then concatenated against (and written back into) the self cache.
    fn project_self(
        &self,
        query: &B::Tensor,
        cache: Option<&mut LayerCache<B::Tensor>>,
        dims: Dims,
        flags: AttentionFlags,
    ) -> Result<(KvSource<B::Tensor>, KvSource<B::Tensor>, KvSource<B::Tensor>)> {
        let w = &self.weights;
        let Dims {
            batch,
            query_len,
            hidden,
            head_dim,
            ..
        } = dims;

        // Packed projection: [B, Q, 3*hidden], partitions ordered Q, K, V.
        let mut qkv_out1 = B::zeros(&self.device, &[batch, query_len, 3 * hidden])?;
        if flags.pre_layernorm {
            let mut normed = B::zeros(&self.device, &[batch, query_len, hidden])?;
            B::copy_into(query, &mut normed)?;
            B::layer_norm(&w.layernorm_gamma, &w.layernorm_beta, &mut normed, self.layernorm_eps)?;
            B::matmul(&normed, false, &w.qkv_weight, flags.is_trans_weight, 1.0, &mut qkv_out1, 0.0)?;
        } else {
            B::matmul(query, false, &w.qkv_weight, flags.is_trans_weight, 1.0, &mut qkv_out1, 0.0)?;
        }

        let mut qkv_out2 =
            B::zeros(&self.device, &[3, batch, self.num_heads, query_len, head_dim])?;
        B::split_add_bias_transpose_for_score(&qkv_out1, &w.qkv_bias, &mut qkv_out2)?;

        let part = batch * self.num_heads * query_len * head_dim;
        let part_shape = [batch, self.num_heads, query_len, head_dim];
        let q = KvSource::View(qkv_out2.slice_view(0, &part_shape));
        let new_k = qkv_out2.slice_view(part, &part_shape);
        let new_v = qkv_out2.slice_view(2 * part, &part_shape);

        let (k, v) = if let Some(cache) = cache {
            let k_full = match &cache.self_keys {
                Some(prev) if !prev.is_null() => {
                    let total = prev.shape()[2] + query_len;
                    let mut grown =
                        B::zeros(&self.device, &[batch, self.num_heads, total, head_dim])?;
                    B::concat(prev, &new_k, 2, &mut grown)?;
                    grown
                }
                _ => new_k.clone(),
            };
            let v_full = match &cache.self_values {
                Some(prev) if !prev.is_null() => {
                    let total = prev.shape()[2] + query_len;
                    let mut grown =
                        B::zeros(&self.device, &[batch, self.num_heads, total, head_dim])?;
                    B::concat(prev, &new_v, 2, &mut grown)?;
                    grown
                }
                _ => new_v.clone(),
            };
            // Writeback last, after both concats have read the old slots.
            cache.self_keys = Some(k_full.clone());
            cache.self_values = Some(v_full.clone());
            (KvSource::Cache(k_full), KvSource::Cache(v_full))
        } else {
            (KvSource::View(new_k), KvSource::View(new_v))
        };

        Ok((q, k, v))
    }

    /// Scoring stage: scaled scores, masked softmax, context gather, output
    /// projection, and the mutually-exclusive output fusion.
    #[allow(clippy::too_many_arguments)]
    fn score(
        &self,
        query: &B::Tensor,
        attention_mask: &B::Tensor,
        q: &KvSource<B::Tensor>,
        k: &KvSource<B::Tensor>,
        v: &KvSource<B::Tensor>,
        output: &mut B::Tensor,
        att_score: Option<&mut B::Tensor>,
        dims: Dims,
        flags: AttentionFlags,
    ) -> Result<()> {
        let w = &self.weights;
        let Dims {
            batch,
            query_len,
            hidden,
            head_dim,
            ..
        } = dims;
        // Effective key length after any cache concatenation.
        let key_len = k.tensor().shape()[2];
        let score_shape = [batch, self.num_heads, query_len, key_len];

        let mut local_score;
        let score: &mut B::Tensor = match att_score {
            Some(sink) => {
                *sink = B::zeros(&self.device, &score_shape)?;
                sink
            }
            None => {
                local_score = B::zeros(&self.device, &score_shape)?;
                &mut local_score
            }
        };

        // Scale is fused into the batched GEMM, not applied post-hoc.
        #[allow(clippy::cast_precision_loss)]
        let scaler = 1.0 / (head_dim as f32).sqrt();
        B::batch_matmul(q.tensor(), false, k.tensor(), true, scaler, score, 0.0)?;
        B::apply_mask_and_softmax(score, attention_mask, 1.0)?;

        let mut context_layer =
            B::zeros(&self.device, &[batch, self.num_heads, query_len, head_dim])?;
        B::batch_matmul(score, false, v.tensor(), false, 1.0, &mut context_layer, 0.0)?;

        let mut attn_out = B::zeros(&self.device, &[batch, query_len, hidden])?;
        B::transpose_for_score(&context_layer, &mut attn_out)?;

        *output = B::zeros(&self.device, &[batch, query_len, hidden])?;
        B::matmul(&attn_out, false, &w.dense_weight, flags.is_trans_weight, 1.0, output, 0.0)?;

        if flags.post_add_input {
            B::add_input_bias(query, &w.dense_bias, output)?;
        } else if flags.post_layernorm {
            B::add_bias_layer_norm(
                query,
                &w.dense_bias,
                &w.layernorm_gamma,
                &w.layernorm_beta,
                output,
                self.layernorm_eps,
            )?;
        } else {
            B::add_bias(&w.dense_bias, output)?;
        }
        Ok(())
    }

    fn trace_weights(&self) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        let w = &self.weights;
        trace!(
            q_weight = ?w.q_weight.shape(),
            qkv_weight = ?w.qkv_weight.shape(),
            dense_weight = ?w.dense_weight.shape(),
            dense_bias = ?w.dense_bias.shape(),
            "attention weight shapes"
        );
    }
}
