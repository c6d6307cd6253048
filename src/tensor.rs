//! Tensor implementation
//!
//! This module provides the core [`Tensor`] type: an N-dimensional byte buffer
//! with a logical [`DataType`], a row-major shape, a [`Device`] placement tag
//! and optional quantization metadata.
//!
//! ## Storage model
//!
//! - A tensor exclusively owns its buffer, except for lazily-loaded weights
//!   which hold a shared, read-only [`MappedRegion`] into a weight file.
//!   Mutating a mapped tensor first copies the bytes out (copy-on-write).
//! - [`expansion`](Tensor::expansion) reserves capacity beyond the logical
//!   shape so [`resize`](Tensor::resize) can grow the tensor in place, which is
//!   how key/value caches append one step at a time without reallocating.
//! - Cloning is a deep copy: owned bytes are duplicated, mapped bytes stay
//!   shared because they are immutable.
//!
//! ## Example
//!
//! ```
//! use tessera::{DataType, Tensor};
//!
//! let mut t = Tensor::with_dims(DataType::Float32, &[1, 4]);
//! t.expansion(&[8, 4]).unwrap();
//! t.allocate_with(1.0).unwrap();
//! t.resize(&[2, 4]).unwrap();
//! assert_eq!(t.count(0), 8);
//! assert_eq!(t.strides(), &[4, 1]);
//! ```

mod device;
mod dtype;
mod storage;

pub use device::Device;
pub use dtype::{DataType, WeightType};
pub(crate) use storage::Storage;

use std::fmt;
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::model::MappedRegion;
use crate::quantize::{self, LowBitConfig};

/// Row-major strides: `strides[i] = product(dims[i+1..])`
pub(crate) fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Number of elements described by `dims` (an unshaped tensor holds none)
pub(crate) fn element_count(dims: &[usize]) -> usize {
    if dims.is_empty() {
        0
    } else {
        dims.iter().product()
    }
}

/// N-dimensional tensor with mixed-precision storage
///
/// # Examples
///
/// ```
/// use tessera::{DataType, Tensor};
///
/// let t = Tensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
/// assert_eq!(t.dims(), &[2, 3]);
/// assert_eq!(t.get_bytes(), 24);
///
/// let q = Tensor::quantize_from_f32(DataType::Int4, &[2, 3], &t.to_f32_vec().unwrap(), Some(0)).unwrap();
/// assert_eq!(q.get_bytes(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DataType,
    dims: Vec<usize>,
    strides: Vec<usize>,
    expansion_dims: Vec<usize>,
    expansion_size: usize,
    storage: Storage,
    device: Device,
    lock_in_cpu: bool,
    weight_type: WeightType,
    per_channel_axis: Option<usize>,
    quant_configs: Vec<LowBitConfig>,
    weight_sum: Option<Vec<i64>>,
}

impl Default for Tensor {
    fn default() -> Self {
        Self::new(DataType::Float32)
    }
}

impl Tensor {
    /// Create an empty, unshaped tensor
    ///
    /// `Int32Param` tensors are locked to host memory.
    #[must_use]
    pub fn new(dtype: DataType) -> Self {
        Self {
            dtype,
            dims: Vec::new(),
            strides: Vec::new(),
            expansion_dims: Vec::new(),
            expansion_size: 0,
            storage: Storage::Empty,
            device: Device::Cpu,
            lock_in_cpu: dtype == DataType::Int32Param,
            weight_type: WeightType::None,
            per_channel_axis: None,
            quant_configs: Vec::new(),
            weight_sum: None,
        }
    }

    /// Create a shaped tensor without allocating
    #[must_use]
    pub fn with_dims(dtype: DataType, dims: &[usize]) -> Self {
        let mut tensor = Self::new(dtype);
        tensor.set_dims(dims);
        tensor
    }

    /// Create a `Float32` tensor from values
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or the data size doesn't match it.
    pub fn from_f32(dims: &[usize], data: &[f32]) -> Result<Self> {
        Self::from_values(DataType::Float32, dims, data)
    }

    /// Create a tensor of `dtype` from float values
    ///
    /// Integer formats are quantized with one global config.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or the data size doesn't match it.
    pub fn from_values(dtype: DataType, dims: &[usize], data: &[f32]) -> Result<Self> {
        check_data_len(dims, data.len())?;
        if dtype.is_quantized() {
            return Self::quantize_from_f32(dtype, dims, data, None);
        }
        if dtype == DataType::Int32Param {
            let ints: Vec<i32> = data.iter().map(|v| v.round() as i32).collect();
            return Self::from_i32(dims, &ints);
        }
        let bytes = dtype.encode_floats(data).unwrap_or_default();
        Self::from_raw(dtype, dims, bytes)
    }

    /// Quantize float values into an integer `dtype`
    ///
    /// With `axis = Some(a)` one [`LowBitConfig`] is searched per slice along
    /// `a`; otherwise one global config covers the tensor.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` if `dtype` is not an integer format,
    /// or a shape/quantization error for bad inputs.
    pub fn quantize_from_f32(
        dtype: DataType,
        dims: &[usize],
        data: &[f32],
        axis: Option<usize>,
    ) -> Result<Self> {
        let (bit, quant_type) =
            dtype
                .quant_params()
                .ok_or_else(|| TesseraError::UnsupportedOperation {
                    operation: "quantize_from_f32".to_string(),
                    reason: format!("{dtype} is not a quantized type"),
                })?;
        check_data_len(dims, data.len())?;

        let configs = quantize::compute_configs(data, dims, axis, bit, quant_type)?;
        let codes = quantize::quantize_values(data, dims, axis, &configs);

        let mut tensor = Self::with_dims(dtype, dims);
        tensor.storage = Storage::Owned(quantize::pack_codes(&codes, bit));
        tensor.per_channel_axis = axis.filter(|_| configs.len() > 1);
        tensor.quant_configs = configs;
        Ok(tensor)
    }

    /// Create an `Int32Param` tensor (host-locked)
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or the data size doesn't match it.
    pub fn from_i32(dims: &[usize], data: &[i32]) -> Result<Self> {
        check_data_len(dims, data.len())?;
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_raw(DataType::Int32Param, dims, bytes)
    }

    /// Wrap already-encoded bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the buffer is smaller than the shape requires.
    pub fn from_raw(dtype: DataType, dims: &[usize], bytes: Vec<u8>) -> Result<Self> {
        check_buffer_len(dtype, dims, bytes.len())?;
        let mut tensor = Self::with_dims(dtype, dims);
        tensor.storage = Storage::Owned(bytes);
        Ok(tensor)
    }

    /// Reference bytes inside a shared mapping without copying
    pub(crate) fn from_mapped(dtype: DataType, dims: &[usize], region: MappedRegion) -> Result<Self> {
        check_buffer_len(dtype, dims, region.len())?;
        let mut tensor = Self::with_dims(dtype, dims);
        tensor.storage = Storage::Mapped(region);
        Ok(tensor)
    }

    fn set_dims(&mut self, dims: &[usize]) {
        self.dims = dims.to_vec();
        self.strides = compute_strides(dims);
    }

    /// Logical element type
    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Logical shape
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Row-major strides of the logical shape
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Elements from axis `i` inward: `dims[i] * strides[i]`
    ///
    /// `count(0)` is the total element count; axes past the last return 1.
    #[must_use]
    pub fn count(&self, i: usize) -> usize {
        if self.dims.is_empty() {
            0
        } else if i >= self.dims.len() {
            1
        } else {
            self.dims[i] * self.strides[i]
        }
    }

    /// Exact byte footprint of the logical shape
    #[must_use]
    pub fn get_bytes(&self) -> usize {
        self.dtype.bytes_for(self.count(0))
    }

    /// Bytes reserved by the current buffer
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.storage.len()
    }

    /// Whether a buffer has been reserved
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !self.storage.is_empty()
    }

    /// Shape reserved by the last [`expansion`](Self::expansion)
    #[must_use]
    pub fn expansion_dims(&self) -> &[usize] {
        &self.expansion_dims
    }

    /// Element capacity reserved by the last [`expansion`](Self::expansion)
    #[must_use]
    pub fn expansion_size(&self) -> usize {
        self.expansion_size
    }

    /// Current placement
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether the tensor must stay in host memory
    #[must_use]
    pub fn is_locked_in_cpu(&self) -> bool {
        self.lock_in_cpu
    }

    /// Pin (or unpin) the tensor to host memory
    pub fn set_lock_in_cpu(&mut self, lock: bool) {
        self.lock_in_cpu = lock || self.dtype == DataType::Int32Param;
    }

    /// Role inside a weight table
    #[must_use]
    pub fn weight_type(&self) -> WeightType {
        self.weight_type
    }

    /// Set the role inside a weight table
    pub fn set_weight_type(&mut self, weight_type: WeightType) {
        self.weight_type = weight_type;
    }

    /// Axis of per-channel quantization (`None` = global)
    #[must_use]
    pub fn per_channel_axis(&self) -> Option<usize> {
        self.per_channel_axis
    }

    /// Quantization configs (one global, or one per channel)
    #[must_use]
    pub fn quant_configs(&self) -> &[LowBitConfig] {
        &self.quant_configs
    }

    /// Attach quantization parameters
    ///
    /// A single config along an axis of length 1 is stored as global.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not quantized or the number of
    /// configs does not match the channel count along `axis`.
    pub fn set_quant_configs(
        &mut self,
        axis: Option<usize>,
        configs: Vec<LowBitConfig>,
    ) -> Result<()> {
        if !self.dtype.is_quantized() {
            return Err(TesseraError::UnsupportedOperation {
                operation: "set_quant_configs".to_string(),
                reason: format!("{} tensors carry no quantization parameters", self.dtype),
            });
        }
        let expected = match axis {
            None => 1,
            Some(a) if a < self.dims.len() => self.dims[a],
            Some(a) => {
                return Err(TesseraError::InvalidShape {
                    reason: format!("per-channel axis {a} out of range for {:?}", self.dims),
                })
            },
        };
        if configs.len() != expected {
            return Err(TesseraError::QuantizationError {
                reason: format!("expected {expected} configs, got {}", configs.len()),
            });
        }
        self.per_channel_axis = axis.filter(|_| configs.len() > 1);
        self.quant_configs = configs;
        self.weight_sum = None;
        Ok(())
    }

    /// Per-row code sums from [`calc_weight_sum`](Self::calc_weight_sum)
    ///
    /// `None` until computed, and again after any byte mutation.
    #[must_use]
    pub fn weight_sum(&self) -> Option<&[i64]> {
        self.weight_sum.as_deref()
    }

    /// Whether the bytes are a lazy reference into a mapped file
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.storage.mapped().is_some()
    }

    /// File backing a lazy reference
    #[must_use]
    pub fn file_name(&self) -> Option<&Path> {
        self.storage.mapped().map(MappedRegion::path)
    }

    /// Byte offset of a lazy reference inside its file
    #[must_use]
    pub fn file_pos(&self) -> Option<usize> {
        self.storage.mapped().map(MappedRegion::offset)
    }

    /// Bytes of the logical shape
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let bytes = self.storage.as_slice();
        &bytes[..self.get_bytes().min(bytes.len())]
    }

    /// Mutable bytes of the logical shape
    ///
    /// Materializes a private copy of mapped bytes and invalidates the
    /// cached weight sums.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` if no buffer is allocated.
    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.ensure_allocated("as_bytes_mut")?;
        let n = self.get_bytes();
        self.weight_sum = None;
        Ok(&mut self.storage.make_owned()[..n])
    }

    /// Whole reserved buffer, for in-place moves inside the capacity
    pub(crate) fn capacity_bytes_mut(&mut self) -> &mut Vec<u8> {
        self.weight_sum = None;
        self.storage.make_owned()
    }

    fn ensure_allocated(&self, operation: &str) -> Result<()> {
        if self.is_allocated() {
            Ok(())
        } else {
            Err(TesseraError::UnsupportedOperation {
                operation: operation.to_string(),
                reason: "tensor has no allocated buffer".to_string(),
            })
        }
    }

    /// Reserve a zeroed buffer for the logical shape
    ///
    /// Keeps the current buffer when it is already large enough.
    pub fn allocate(&mut self) {
        let required = self.get_bytes();
        if self.is_allocated() && self.capacity_bytes() >= required {
            return;
        }
        self.storage = Storage::Owned(vec![0u8; required]);
        self.expansion_dims.clear();
        self.expansion_size = 0;
        self.weight_sum = None;
    }

    /// Allocate and fill every element with `value`
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` for quantized tensors without
    /// quantization parameters.
    pub fn allocate_with(&mut self, value: f32) -> Result<()> {
        let count = self.count(0);
        let encoded = if let Some((bit, _)) = self.dtype.quant_params() {
            if self.quant_configs.is_empty() {
                return Err(TesseraError::UnsupportedOperation {
                    operation: "allocate_with".to_string(),
                    reason: format!("{} tensor has no quantization parameters", self.dtype),
                });
            }
            let values = vec![value; count];
            let codes = quantize::quantize_values(
                &values,
                &self.dims,
                self.per_channel_axis,
                &self.quant_configs,
            );
            quantize::pack_codes(&codes, bit)
        } else if self.dtype == DataType::Int32Param {
            (0..count).flat_map(|_| (value as i32).to_le_bytes()).collect()
        } else {
            self.dtype
                .encode_floats(&vec![value; count])
                .unwrap_or_default()
        };

        self.allocate();
        self.as_bytes_mut()?.copy_from_slice(&encoded);
        Ok(())
    }

    /// Reserve capacity for shape `dims`, preserving existing bytes
    ///
    /// Never shrinks the buffer. Subsequent [`resize`](Self::resize) calls
    /// up to `dims` do not reallocate.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `dims` is empty or its rank differs from a
    /// shaped tensor's rank.
    pub fn expansion(&mut self, dims: &[usize]) -> Result<()> {
        if dims.is_empty() {
            return Err(TesseraError::InvalidShape {
                reason: "Expansion shape cannot be empty".to_string(),
            });
        }
        if !self.dims.is_empty() && dims.len() != self.dims.len() {
            return Err(TesseraError::InvalidShape {
                reason: format!(
                    "Expansion rank {} does not match tensor rank {}",
                    dims.len(),
                    self.dims.len()
                ),
            });
        }

        let size: usize = dims.iter().product();
        if size > self.expansion_size {
            self.expansion_dims = dims.to_vec();
            self.expansion_size = size;
        }

        let bytes = self.dtype.bytes_for(size);
        if self.is_allocated() && bytes <= self.capacity_bytes() {
            return Ok(());
        }

        let mut grown = vec![0u8; bytes];
        let old = self.storage.as_slice();
        grown[..old.len()].copy_from_slice(old);
        debug!(
            from = old.len(),
            to = bytes,
            dims = ?dims,
            "expanded tensor capacity"
        );
        self.storage = Storage::Owned(grown);
        Ok(())
    }

    /// Change the logical shape within the reserved capacity
    ///
    /// Bytes are not moved, so the prefix shared by the old and new shape is
    /// unchanged. A tensor with no buffer and no expansion just records the
    /// shape for a later [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the new shape needs more bytes than are
    /// reserved, or `InvalidShape` if it changes the channel count of a
    /// per-channel quantized tensor.
    pub fn resize(&mut self, dims: &[usize]) -> Result<()> {
        self.check_channel_axis(dims, "resize")?;
        let required = self.dtype.bytes_for(element_count(dims));
        if self.is_allocated() || self.expansion_size > 0 {
            let capacity = self.capacity_bytes();
            if required > capacity {
                return Err(TesseraError::CapacityExceeded { required, capacity });
            }
        }
        self.set_dims(dims);
        self.weight_sum = None;
        Ok(())
    }

    /// Reinterpret the shape without touching data
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if the element count changes, or
    /// `InvalidShape` if the new shape breaks per-channel quantization.
    pub fn reshape(&mut self, dims: &[usize]) -> Result<()> {
        let expected = element_count(dims);
        if expected != self.count(0) {
            return Err(TesseraError::DataShapeMismatch {
                data_size: self.count(0),
                shape: dims.to_vec(),
                expected,
            });
        }
        self.check_channel_axis(dims, "reshape")?;
        self.set_dims(dims);
        Ok(())
    }

    fn check_channel_axis(&self, dims: &[usize], operation: &str) -> Result<()> {
        match self.per_channel_axis {
            Some(axis) if dims.get(axis).copied() != Some(self.quant_configs.len()) => {
                Err(TesseraError::InvalidShape {
                    reason: format!(
                        "{operation} to {dims:?} breaks per-channel axis {axis} ({} channels)",
                        self.quant_configs.len()
                    ),
                })
            },
            _ => Ok(()),
        }
    }

    /// Deep copy of `other` into `self`, including quantization metadata
    pub fn copy_from(&mut self, other: &Self) {
        self.clone_from(other);
    }

    /// Move the buffer to `device`
    ///
    /// The destination gets a freshly owned buffer and the old one is
    /// released. Lazy references are materialized on the way.
    ///
    /// # Errors
    ///
    /// Returns `LockedInCpu` when moving a host-locked tensor off the host.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        if &self.device == device {
            return Ok(());
        }
        if self.lock_in_cpu && !device.is_cpu() {
            return Err(TesseraError::LockedInCpu {
                target: device.to_string(),
            });
        }
        if self.is_allocated() {
            let moved = self.storage.as_slice().to_vec();
            self.storage = Storage::Owned(moved);
        }
        debug!(from = %self.device, to = %device, bytes = self.capacity_bytes(), "moved tensor");
        self.device = device.clone();
        Ok(())
    }

    /// Precompute per-row sums of quantized codes
    ///
    /// Rows are slices along axis 0. Used for zero-point bias correction in
    /// quantized matrix multiply; cleared whenever the bytes change.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` for non-quantized or unallocated tensors.
    pub fn calc_weight_sum(&mut self) -> Result<()> {
        let (bit, _) = self
            .dtype
            .quant_params()
            .ok_or_else(|| TesseraError::UnsupportedOperation {
                operation: "calc_weight_sum".to_string(),
                reason: format!("{} tensors have no integer codes", self.dtype),
            })?;
        self.ensure_allocated("calc_weight_sum")?;

        let rows = self.dims.first().copied().unwrap_or(0);
        let row_len = self.count(1);
        let bytes = self.as_bytes();
        let sums: Vec<i64> = (0..rows)
            .into_par_iter()
            .map(|r| {
                (r * row_len..(r + 1) * row_len)
                    .map(|i| i64::from(quantize::unpack_code(bytes, i, bit)))
                    .sum()
            })
            .collect();
        self.weight_sum = Some(sums);
        Ok(())
    }

    fn config_for(&self, index: usize) -> Result<&LowBitConfig> {
        let channel = match self.per_channel_axis {
            Some(axis) => {
                let (channels, inner) = (self.dims[axis], self.strides[axis]);
                quantize::channel_of(index, channels, inner)
            },
            None => 0,
        };
        self.quant_configs
            .get(channel)
            .ok_or_else(|| TesseraError::QuantizationError {
                reason: format!(
                    "no quantization config for channel {channel} ({} stored)",
                    self.quant_configs.len()
                ),
            })
    }

    /// Decode `len` elements starting at element `start` to `f32`
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds, the tensor is not
    /// allocated, or a quantized tensor lacks its parameters.
    pub fn read_f32(&self, start: usize, len: usize) -> Result<Vec<f32>> {
        let count = self.count(0);
        let end = checked_end(start, len, count)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        self.ensure_allocated("read_f32")?;

        let bytes = self.storage.as_slice();
        match self.dtype.quant_params() {
            None => Ok((start..end)
                .map(|i| self.dtype.decode_float(bytes, i))
                .collect()),
            Some((bit, _)) => {
                if self.quant_configs.is_empty() {
                    return Err(TesseraError::QuantizationError {
                        reason: "quantized tensor has no quantization parameters".to_string(),
                    });
                }
                (start..end)
                    .map(|i| {
                        let config = self.config_for(i)?;
                        Ok(config.dequantize(quantize::unpack_code(bytes, i, bit)))
                    })
                    .collect()
            },
        }
    }

    /// Decode every element to `f32`
    ///
    /// # Errors
    ///
    /// See [`read_f32`](Self::read_f32).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.read_f32(0, self.count(0))
    }

    /// Read an `Int32Param` tensor
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` for other types or unallocated tensors.
    pub fn to_i32_vec(&self) -> Result<Vec<i32>> {
        if self.dtype != DataType::Int32Param {
            return Err(TesseraError::UnsupportedOperation {
                operation: "to_i32_vec".to_string(),
                reason: format!("{} is not int32param", self.dtype),
            });
        }
        self.ensure_allocated("to_i32_vec")?;
        Ok(self
            .as_bytes()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Overwrite elements starting at `start` with float values
    ///
    /// # Errors
    ///
    /// Returns an error for non-float tensors, unallocated tensors or an
    /// out-of-bounds range.
    pub fn write_f32(&mut self, start: usize, values: &[f32]) -> Result<()> {
        let encoded =
            self.dtype
                .encode_floats(values)
                .ok_or_else(|| TesseraError::UnsupportedOperation {
                    operation: "write_f32".to_string(),
                    reason: format!("{} is not a float type", self.dtype),
                })?;
        checked_end(start, values.len(), self.count(0))?;
        let offset = start * self.dtype.unit_size();
        let bytes = self.as_bytes_mut()?;
        bytes[offset..offset + encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }
}

/// End of the element range `start..start + len`, bounded by `count`
fn checked_end(start: usize, len: usize, count: usize) -> Result<usize> {
    match start.checked_add(len) {
        Some(end) if end <= count => Ok(end),
        Some(end) => Err(TesseraError::InvalidShape {
            reason: format!("range {start}..{end} exceeds {count} elements"),
        }),
        None => Err(TesseraError::InvalidShape {
            reason: format!("range of {len} elements from {start} overflows"),
        }),
    }
}

fn check_data_len(dims: &[usize], len: usize) -> Result<()> {
    if dims.is_empty() {
        return Err(TesseraError::InvalidShape {
            reason: "Shape cannot be empty".to_string(),
        });
    }
    let expected = element_count(dims);
    if len != expected {
        return Err(TesseraError::DataShapeMismatch {
            data_size: len,
            shape: dims.to_vec(),
            expected,
        });
    }
    Ok(())
}

fn check_buffer_len(dtype: DataType, dims: &[usize], len: usize) -> Result<()> {
    if dims.is_empty() {
        return Err(TesseraError::InvalidShape {
            reason: "Shape cannot be empty".to_string(),
        });
    }
    let required = dtype.bytes_for(element_count(dims));
    if len < required {
        return Err(TesseraError::InvalidShape {
            reason: format!("{dtype} {dims:?} needs {required} bytes, buffer has {len}"),
        });
    }
    Ok(())
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(dtype={}, shape={:?}, device={}",
            self.dtype, self.dims, self.device
        )?;
        if let Some(path) = self.file_name() {
            write!(f, ", mapped={}", path.display())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileMmap;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_strides_invariant() {
        let t = Tensor::with_dims(DataType::Float32, &[2, 3, 4]);
        assert_eq!(t.strides(), &[12, 4, 1]);
        for i in 0..t.ndim() {
            assert_eq!(t.strides()[i], t.dims()[i + 1..].iter().product::<usize>());
        }
        assert_eq!(t.count(0), 24);
        assert_eq!(t.count(1), 12);
        assert_eq!(t.count(3), 1);
    }

    #[test]
    fn test_unshaped_tensor_is_empty() {
        let t = Tensor::new(DataType::Float32);
        assert_eq!(t.count(0), 0);
        assert_eq!(t.get_bytes(), 0);
        assert!(!t.is_allocated());
        assert!(t.as_bytes().is_empty());
    }

    #[test]
    fn test_create_errors() {
        assert!(matches!(
            Tensor::from_f32(&[], &[]),
            Err(TesseraError::InvalidShape { .. })
        ));
        assert!(matches!(
            Tensor::from_f32(&[2, 3], &[1.0, 2.0]),
            Err(TesseraError::DataShapeMismatch { .. })
        ));
        assert!(Tensor::from_raw(DataType::Float16, &[4], vec![0; 7]).is_err());
    }

    #[test]
    fn test_get_bytes_sub_byte() {
        let t = Tensor::with_dims(DataType::Int4, &[3, 3]);
        assert_eq!(t.get_bytes(), 5);
        let t = Tensor::with_dims(DataType::Bit, &[2, 4]);
        assert_eq!(t.get_bytes(), 1);
    }

    #[test]
    fn test_allocate_with_float_types() {
        for dtype in [DataType::Float32, DataType::Float16, DataType::BFloat16] {
            let mut t = Tensor::with_dims(dtype, &[2, 2]);
            t.allocate_with(0.5).unwrap();
            assert_eq!(t.to_f32_vec().unwrap(), vec![0.5; 4]);
        }
        let mut t = Tensor::with_dims(DataType::Int32Param, &[3]);
        t.allocate_with(7.0).unwrap();
        assert_eq!(t.to_i32_vec().unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn test_allocate_with_quantized_requires_configs() {
        let mut t = Tensor::with_dims(DataType::Int8, &[4]);
        assert!(t.allocate_with(1.0).is_err());
        assert!(!t.is_allocated());
    }

    #[test]
    fn test_resize_without_expansion_fails_when_allocated() {
        let mut t = Tensor::with_dims(DataType::Float32, &[2, 2]);
        t.allocate();
        assert!(matches!(
            t.resize(&[3, 2]),
            Err(TesseraError::CapacityExceeded {
                required: 24,
                capacity: 16
            })
        ));
        assert_eq!(t.dims(), &[2, 2]);
        t.resize(&[1, 2]).unwrap();
        assert_eq!(t.get_bytes(), 8);
    }

    #[test]
    fn test_resize_unallocated_records_shape() {
        let mut t = Tensor::new(DataType::Float32);
        t.resize(&[5, 7]).unwrap();
        assert_eq!(t.count(0), 35);
        t.allocate();
        assert_eq!(t.capacity_bytes(), 140);
    }

    #[test]
    fn test_expansion_preserves_bytes() {
        let mut t = Tensor::from_f32(&[1, 3], &[1.0, 2.0, 3.0]).unwrap();
        let before = t.as_bytes().to_vec();
        t.expansion(&[4, 3]).unwrap();
        assert_eq!(t.capacity_bytes(), 48);
        assert_eq!(t.expansion_size(), 12);
        assert_eq!(t.as_bytes(), &before[..]);

        t.resize(&[3, 3]).unwrap();
        assert_eq!(&t.as_bytes()[..12], &before[..]);
        t.resize(&[2, 3]).unwrap();
        assert_eq!(&t.as_bytes()[..12], &before[..]);
        assert!(t.resize(&[5, 3]).is_err());
    }

    #[test]
    fn test_expansion_never_shrinks() {
        let mut t = Tensor::with_dims(DataType::Float32, &[2, 2]);
        t.expansion(&[8, 2]).unwrap();
        t.expansion(&[3, 2]).unwrap();
        assert_eq!(t.capacity_bytes(), 64);
        assert_eq!(t.expansion_dims(), &[8, 2]);
        assert!(t.expansion(&[8]).is_err());
        assert!(t.expansion(&[]).is_err());
    }

    #[test]
    fn test_reshape() {
        let mut t = Tensor::from_f32(&[2, 3], &[0.0; 6]).unwrap();
        t.reshape(&[3, 2]).unwrap();
        assert_eq!(t.strides(), &[2, 1]);
        assert!(matches!(
            t.reshape(&[4, 2]),
            Err(TesseraError::DataShapeMismatch { .. })
        ));
        assert_eq!(t.dims(), &[3, 2]);
    }

    #[test]
    fn test_reshape_respects_per_channel_axis() {
        let data: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut t = Tensor::quantize_from_f32(DataType::Int8, &[2, 3], &data, Some(0)).unwrap();
        assert!(t.reshape(&[3, 2]).is_err());
        t.reshape(&[2, 3, 1]).unwrap();
    }

    #[test]
    fn test_resize_keeps_per_channel_count() {
        let data: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut t = Tensor::quantize_from_f32(DataType::Int8, &[2, 3], &data, Some(0)).unwrap();
        t.expansion(&[4, 3]).unwrap();
        assert!(matches!(
            t.resize(&[4, 3]),
            Err(TesseraError::InvalidShape { .. })
        ));
        assert_eq!(t.dims(), &[2, 3]);
        t.resize(&[2, 2]).unwrap();
        assert_eq!(t.to_f32_vec().unwrap().len(), 4);
        t.resize(&[2, 3]).unwrap();
        let restored = t.to_f32_vec().unwrap();
        for (a, b) in data.iter().zip(&restored) {
            assert!((a - b).abs() <= t.quant_configs()[0].scale.max(t.quant_configs()[1].scale));
        }
    }

    #[test]
    fn test_single_channel_config_is_global() {
        let t = Tensor::quantize_from_f32(DataType::Int8, &[1, 4], &[0.0, 1.0, 2.0, 3.0], Some(0))
            .unwrap();
        assert_eq!(t.quant_configs().len(), 1);
        assert_eq!(t.per_channel_axis(), None);

        let mut t = t;
        t.reshape(&[2, 2]).unwrap();
        let cfg = t.quant_configs()[0];
        let mut row = Tensor::from_raw(DataType::Int8, &[1, 2], vec![0; 2]).unwrap();
        row.set_quant_configs(Some(0), vec![cfg]).unwrap();
        assert_eq!(row.per_channel_axis(), None);
        row.resize(&[1, 1]).unwrap();
    }

    #[test]
    fn test_range_overflow_is_error() {
        let mut t = Tensor::from_f32(&[2], &[1.0, 2.0]).unwrap();
        assert!(matches!(
            t.read_f32(usize::MAX, 2),
            Err(TesseraError::InvalidShape { .. })
        ));
        assert!(matches!(
            t.write_f32(usize::MAX, &[0.0, 0.0]),
            Err(TesseraError::InvalidShape { .. })
        ));
        assert!(t.read_f32(1, 2).is_err());
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_deep_copy_isolation() {
        let source = Tensor::from_f32(&[3], &[1.0, 2.0, 3.0]).unwrap();
        let mut copy = source.clone();
        copy.write_f32(0, &[9.0]).unwrap();
        assert_eq!(source.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0]);

        let mut other = Tensor::new(DataType::Float16);
        other.copy_from(&source);
        other.write_f32(2, &[-1.0]).unwrap();
        assert_eq!(other.dtype(), DataType::Float32);
        assert_eq!(source.to_f32_vec().unwrap()[2], 3.0);
    }

    #[test]
    fn test_to_device() {
        let mut t = Tensor::from_f32(&[2], &[1.0, 2.0]).unwrap();
        t.to_device(&Device::cuda(0)).unwrap();
        assert_eq!(t.device(), &Device::cuda(0));
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, 2.0]);
        t.to_device(&Device::Cpu).unwrap();
        assert!(t.device().is_cpu());
    }

    #[test]
    fn test_locked_tensor_cannot_leave_host() {
        let mut t = Tensor::from_i32(&[2], &[1, 2]).unwrap();
        assert!(t.is_locked_in_cpu());
        assert!(matches!(
            t.to_device(&Device::cuda(1)),
            Err(TesseraError::LockedInCpu { .. })
        ));
        assert!(t.device().is_cpu());

        let mut f = Tensor::from_f32(&[1], &[0.0]).unwrap();
        f.set_lock_in_cpu(true);
        assert!(f.to_device(&Device::Cuda(vec![0, 1])).is_err());
        f.set_lock_in_cpu(false);
        f.to_device(&Device::Cuda(vec![0, 1])).unwrap();
    }

    #[test]
    fn test_calc_weight_sum_and_invalidation() {
        let mut t = Tensor::from_raw(DataType::Int8, &[2, 3], vec![1, 2, 3, 10, 20, 30]).unwrap();
        t.calc_weight_sum().unwrap();
        assert_eq!(t.weight_sum(), Some(&[6i64, 60][..]));
        t.as_bytes_mut().unwrap()[0] = 5;
        assert!(t.weight_sum().is_none());
        t.calc_weight_sum().unwrap();
        assert_eq!(t.weight_sum().unwrap()[0], 10);

        let mut t4 = Tensor::from_raw(DataType::Int4, &[2, 2], vec![0x12, 0xF0]).unwrap();
        t4.calc_weight_sum().unwrap();
        assert_eq!(t4.weight_sum(), Some(&[3i64, 15][..]));

        let mut f = Tensor::from_f32(&[1], &[1.0]).unwrap();
        assert!(f.calc_weight_sum().is_err());
    }

    #[test]
    fn test_quantized_roundtrip_per_channel() {
        let data: Vec<f32> = (0..12).map(|i| (i as f32 - 4.0) * 0.5).collect();
        let t = Tensor::quantize_from_f32(DataType::Int8, &[3, 4], &data, Some(0)).unwrap();
        assert_eq!(t.quant_configs().len(), 3);
        assert_eq!(t.per_channel_axis(), Some(0));
        let restored = t.to_f32_vec().unwrap();
        for (i, (a, b)) in data.iter().zip(&restored).enumerate() {
            assert!((a - b).abs() <= t.quant_configs()[i / 4].scale, "{a} vs {b}");
        }
        let row = t.read_f32(4, 4).unwrap();
        assert_eq!(row, restored[4..8].to_vec());
    }

    #[test]
    fn test_from_values_quantizes_globally() {
        let t = Tensor::from_values(DataType::Int4NoZero, &[4], &[-1.0, 0.0, 0.5, 1.0]).unwrap();
        assert_eq!(t.quant_configs().len(), 1);
        assert_eq!(t.per_channel_axis(), None);
        assert_eq!(t.get_bytes(), 2);
    }

    #[test]
    fn test_set_quant_configs_validation() {
        let mut t = Tensor::from_raw(DataType::Int8, &[2, 2], vec![0; 4]).unwrap();
        let cfg = LowBitConfig::new(-1.0, 1.0, 8, quantize::QuantType::Asymmetric).unwrap();
        assert!(t.set_quant_configs(Some(0), vec![cfg]).is_err());
        assert!(t.set_quant_configs(Some(2), vec![cfg, cfg]).is_err());
        t.set_quant_configs(Some(0), vec![cfg, cfg]).unwrap();
        t.set_quant_configs(None, vec![cfg]).unwrap();
        let mut f = Tensor::from_f32(&[1], &[0.0]).unwrap();
        assert!(f.set_quant_configs(None, vec![cfg]).is_err());
    }

    #[test]
    fn test_mapped_tensor_copy_on_write() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        let payload: Vec<u8> = [1.0f32, 2.0, 3.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        file.write_all(&payload).expect("write");
        file.flush().expect("flush");

        let mmap = FileMmap::open(file.path()).unwrap();
        let region = MappedRegion::new(Arc::clone(&mmap), 0, 12).unwrap();
        let mapped = Tensor::from_mapped(DataType::Float32, &[3], region).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.file_pos(), Some(0));
        assert_eq!(mapped.file_name(), Some(file.path()));

        let mut copy = mapped.clone();
        copy.write_f32(1, &[20.0]).unwrap();
        assert!(!copy.is_mapped());
        assert_eq!(copy.to_f32_vec().unwrap(), vec![1.0, 20.0, 3.0]);
        assert_eq!(mapped.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(mmap.data(), &payload[..]);
    }

    #[test]
    fn test_display() {
        let t = Tensor::with_dims(DataType::Int4, &[2, 8]);
        let display = format!("{t}");
        assert!(display.contains("int4"));
        assert!(display.contains("[2, 8]"));
        assert!(display.contains("cpu"));
    }
}
