//! Caller-owned KV-cache entries and their liveness binding.
//!
//! A [`LayerCache`] belongs to the caller and outlives operator calls; the
//! operator reads live slots and writes projections back into them. A slot
//! has three observable states: absent (`None`), placeholder (`Some` of a
//! null tensor), and live. Placeholders behave like misses that still
//! request a cache fill.

use crate::tensor::Tensor;
use crate::{Error, Result};

/// Per-layer KV cache with the four recognized slots.
///
/// `memory_*` hold the cross-attention K/V of a source sequence, populated
/// on the first context call and read-only afterwards. `self_*` hold the
/// decoder self-attention K/V, growing along the sequence axis each call.
#[derive(Debug, Clone, Default)]
pub struct LayerCache<T> {
    pub memory_keys: Option<T>,
    pub memory_values: Option<T>,
    pub self_keys: Option<T>,
    pub self_values: Option<T>,
}

fn slot_live<T: Tensor>(slot: &Option<T>) -> bool {
    matches!(slot, Some(t) if !t.is_null())
}

impl<T> LayerCache<T> {
    /// An empty cache: all slots absent.
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory_keys: None,
            memory_values: None,
            self_keys: None,
            self_values: None,
        }
    }
}

impl<T: Tensor> LayerCache<T> {
    /// Both memory slots when both are live.
    pub fn memory_pair(&self) -> Option<(&T, &T)> {
        match (&self.memory_keys, &self.memory_values) {
            (Some(k), Some(v)) if !k.is_null() && !v.is_null() => Some((k, v)),
            _ => None,
        }
    }
}

/// Snapshot of cache-slot liveness, resolved once per call before any
/// compute.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBinding {
    /// Whether a cache struct was passed at all.
    pub present: bool,
    pub memory_keys_live: bool,
    pub memory_values_live: bool,
    pub self_keys_live: bool,
    pub self_values_live: bool,
}

impl CacheBinding {
    /// Resolve liveness from an optional caller cache.
    ///
    /// # Errors
    /// Returns [`Error::InvariantViolation`] when exactly one of the
    /// `memory_*` slots is live; they toggle as a pair.
    pub fn resolve<T: Tensor>(cache: Option<&LayerCache<T>>) -> Result<Self> {
        let Some(cache) = cache else {
            return Ok(Self::default());
        };
        let binding = Self {
            present: true,
            memory_keys_live: slot_live(&cache.memory_keys),
            memory_values_live: slot_live(&cache.memory_values),
            self_keys_live: slot_live(&cache.self_keys),
            self_values_live: slot_live(&cache.self_values),
        };
        if binding.memory_keys_live != binding.memory_values_live {
            return Err(Error::InvariantViolation(
                "memory_keys and memory_values must be live as a pair".to_string(),
            ));
        }
        Ok(binding)
    }

    /// The composite cross-attention cache-hit predicate.
    #[must_use]
    pub fn memory_live(&self) -> bool {
        self.memory_keys_live && self.memory_values_live
    }
}
