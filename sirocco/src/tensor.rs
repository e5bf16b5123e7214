//! Tensor trait definition

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};

/// Core tensor trait that defines the interface for all tensor implementations
///
/// Different backends (CPU, accelerator) implement this trait to provide
/// hardware-specific storage while maintaining a unified interface. Handles
/// are expected to be cheap to clone (shared backing storage); reallocation
/// goes through the backend's `TensorInit`, never through this trait.
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Returns the device this tensor's storage lives on
    fn device(&self) -> Device;

    /// A null tensor is a storage-less placeholder, used as an absent-output
    /// marker and as a cache-slot placeholder.
    fn is_null(&self) -> bool;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Reinterpret this tensor's metadata under a new shape.
    ///
    /// Metadata-only: the returned handle shares storage with `self`.
    ///
    /// # Errors
    /// Fails with [`Error::ShapeMismatch`] when the element count changes;
    /// a rank/volume change requires a fresh allocation instead.
    fn view_as(&self, shape: &[usize]) -> Result<Self>;

    /// Sub-view sharing storage, starting `offset` elements into this
    /// tensor, reinterpreted under `shape`.
    ///
    /// # Panics
    /// May panic when the requested window exceeds the backing storage.
    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self;

    /// Check that the element count of `shape` matches this tensor's.
    ///
    /// Helper for `view_as` implementations.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] on a volume change.
    fn check_same_volume(&self, shape: &[usize]) -> Result<()> {
        let new_numel: usize = shape.iter().product();
        if new_numel != self.numel() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: shape.to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct FakeTensor {
        shape: Vec<usize>,
    }

    impl Tensor for FakeTensor {
        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn device(&self) -> Device {
            Device::cpu()
        }

        fn is_null(&self) -> bool {
            false
        }

        fn view_as(&self, shape: &[usize]) -> Result<Self> {
            self.check_same_volume(shape)?;
            Ok(FakeTensor {
                shape: shape.to_vec(),
            })
        }

        fn slice_view(&self, _offset: usize, shape: &[usize]) -> Self {
            FakeTensor {
                shape: shape.to_vec(),
            }
        }
    }

    #[test]
    fn test_numel_and_ndim() {
        let t = FakeTensor {
            shape: vec![2, 3, 4],
        };
        assert_eq!(t.numel(), 24);
        assert_eq!(t.ndim(), 3);
    }

    #[test]
    fn test_view_as_same_volume() {
        let t = FakeTensor {
            shape: vec![2, 3, 4],
        };
        let v = t.view_as(&[6, 4]).unwrap();
        assert_eq!(v.shape(), &[6, 4]);
    }

    #[test]
    fn test_view_as_rejects_volume_change() {
        let t = FakeTensor { shape: vec![2, 3] };
        assert!(t.view_as(&[2, 4]).is_err());
    }
}
