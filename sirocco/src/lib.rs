//! Sirocco: fused multi-headed attention for transformer serving
//!
//! This crate provides the backend-agnostic core of a fused attention
//! operator: the tensor and device abstractions, the op traits a hardware
//! backend implements, the caller-owned KV-cache types, and the dispatcher
//! that selects among the four computation graphs (context/self ×
//! cache-hit/cache-miss).
//!
//! Kernel implementations live in backend crates such as `sirocco-cpu`.

pub mod attention;
pub mod backend;
pub mod cache;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod tensor;

pub use attention::{AttentionFlags, AttentionWeights, AttnKind, MultiHeadedAttention};
pub use backend::{AttentionBackend, Backend};
pub use cache::{CacheBinding, LayerCache};
pub use config::AttentionConfig;
pub use device::{Device, DeviceKind};
pub use dtype::DType;
pub use error::{Error, Result};
pub use tensor::Tensor;
