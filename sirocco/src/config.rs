//! Attention operator configuration

use std::path::Path;

use serde::Deserialize;

use crate::Result;

/// Configuration for a [`MultiHeadedAttention`](crate::MultiHeadedAttention)
/// operator, typically parsed from a layer's JSON config.
#[derive(Debug, Clone, Deserialize)]
pub struct AttentionConfig {
    /// Number of attention heads. Must divide the hidden size.
    pub num_attention_heads: usize,

    /// Layer normalization epsilon, used by both the pre-projection and
    /// post-projection norms.
    #[serde(default = "default_layernorm_eps")]
    pub layernorm_eps: f32,
}

fn default_layernorm_eps() -> f32 {
    1e-6
}

impl AttentionConfig {
    /// Config with the default epsilon.
    #[must_use]
    pub fn new(num_attention_heads: usize) -> Self {
        Self {
            num_attention_heads,
            layernorm_eps: default_layernorm_eps(),
        }
    }

    /// Load a config from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
