//! CPU tensor implementation.

use std::sync::Arc;

use sirocco::device::Device;
use sirocco::dtype::DType;
use sirocco::tensor::Tensor;
use sirocco::Result;

/// A CPU-resident tensor backed by shared byte storage.
///
/// Uses `Arc<Vec<u8>>` so clones and `slice_view` are cheap (shared
/// backing). All compute is done in f32; f16/bf16 data is widened on
/// access. Mutation goes through `Arc::make_mut`, which is in-place for a
/// uniquely-held handle and copy-on-write otherwise, so writes never leak
/// into views that were taken earlier.
#[derive(Clone)]
pub struct CpuTensor {
    data: Arc<Vec<u8>>,
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
}

impl CpuTensor {
    /// Create a tensor from an f32 slice.
    ///
    /// # Panics
    /// Panics if `data` does not match the shape's element count.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            offset: 0,
            shape: shape.to_vec(),
            dtype: DType::F32,
        }
    }

    /// Create a zero-filled f32 tensor.
    #[must_use]
    pub fn zeros_f32(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            data: Arc::new(vec![0u8; numel * 4]),
            offset: 0,
            shape: shape.to_vec(),
            dtype: DType::F32,
        }
    }

    /// The storage-less null tensor, used as a cache-slot placeholder.
    #[must_use]
    pub fn null() -> Self {
        Self {
            data: Arc::new(Vec::new()),
            offset: 0,
            shape: Vec::new(),
            dtype: DType::F32,
        }
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        let start = self.offset;
        let end = start + self.numel() * 4;
        bytemuck::cast_slice(&self.data[start..end])
    }

    /// Get the data as a mutable f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        let start = self.offset;
        let numel = self.numel();
        let end = start + numel * 4;
        let data = Arc::make_mut(&mut self.data);
        bytemuck::cast_slice_mut(&mut data[start..end])
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let start = self.offset;
        let end = start + self.numel() * self.dtype.size_in_bytes();
        &self.data[start..end]
    }

    /// Convert to an f32 Vec, widening from f16/bf16 if necessary.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => self.as_f32_slice().to_vec(),
            DType::BF16 => {
                let bf16s: &[half::bf16] = bytemuck::cast_slice(self.as_bytes());
                bf16s.iter().map(|v| v.to_f32()).collect()
            }
            DType::F16 => {
                let f16s: &[half::f16] = bytemuck::cast_slice(self.as_bytes());
                f16s.iter().map(|v| v.to_f32()).collect()
            }
        }
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> Device {
        Device::cpu()
    }

    fn is_null(&self) -> bool {
        self.data.is_empty()
    }

    fn view_as(&self, shape: &[usize]) -> Result<Self> {
        self.check_same_volume(shape)?;
        Ok(Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        })
    }

    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self {
        let elem_size = self.dtype.size_in_bytes();
        let byte_offset = self.offset + offset * elem_size;
        let new_numel: usize = shape.iter().product();
        assert!(
            byte_offset + new_numel * elem_size <= self.data.len(),
            "slice_view out of bounds"
        );
        Self {
            data: Arc::clone(&self.data),
            offset: byte_offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }
}
