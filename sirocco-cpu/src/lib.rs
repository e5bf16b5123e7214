//! CPU backend for Sirocco.
//!
//! Provides a pure-CPU implementation of the attention op traits: a
//! shared-storage f32 tensor plus plain scalar kernels. This backend is
//! intended for correctness work, testing, and running without an
//! accelerator; it is not optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod ops;
pub mod tensor;

use sirocco::backend::Backend;

pub use tensor::CpuTensor;

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type. The operator parameterised by
/// `B: Backend` can use `CpuBackend` to run on CPU; its device handle is
/// `()` since host allocation needs no context.
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
    type DeviceHandle = ();
}
