//! Quantization and dequantization for reduced-precision weights
//!
//! Implements the linear min/max codec used by every integer tensor format:
//!
//! - **Asymmetric** (`QuantType::Asymmetric`): `q = round(x / scale) + zero_point`,
//!   `x ≈ scale * (q - zero_point)`
//! - **Symmetric** (`QuantType::Symmetric`): the zero point is folded into `min`,
//!   `q = round((x - min) / scale)`, `x ≈ min + scale * q`
//!
//! A tensor carries either one global [`LowBitConfig`] or one per channel along
//! a chosen axis. Per-channel parameters are searched in parallel with rayon.
//!
//! ## Code packing
//!
//! Codes narrower than a byte are packed most-significant-first:
//!
//! ```text
//! 4-bit:  [q0 q0 q0 q0 | q1 q1 q1 q1]
//! 2-bit:  [q0 q0 | q1 q1 | q2 q2 | q3 q3]
//! 1-bit:  [q0 | q1 | q2 | q3 | q4 | q5 | q6 | q7]
//! ```
//!
//! 8-bit codes take one byte, 16-bit codes are little-endian `u16`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Widest supported code
pub const MAX_BITS: u8 = 16;

/// Encode/decode policy of a [`LowBitConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantType {
    /// Zero-point based (type 0)
    Asymmetric,
    /// Zero point folded into `min` (type 1)
    Symmetric,
}

impl QuantType {
    /// Numeric policy tag (0 = asymmetric, 1 = symmetric)
    #[must_use]
    pub fn tag(self) -> i32 {
        match self {
            Self::Asymmetric => 0,
            Self::Symmetric => 1,
        }
    }
}

/// Quantization parameters for one tensor or one channel
///
/// # Examples
///
/// ```
/// use tessera::quantize::{LowBitConfig, QuantType};
///
/// let cfg = LowBitConfig::new(-1.0, 1.0, 8, QuantType::Asymmetric).unwrap();
/// let q = cfg.quantize(0.5);
/// assert!((cfg.dequantize(q) - 0.5).abs() <= cfg.scale);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowBitConfig {
    /// Code width in bits (1..=16)
    pub bit: u8,
    /// Lower bound of the representable range (always <= 0)
    pub min: f32,
    /// Upper bound of the representable range (always >= 0)
    pub max: f32,
    /// Step between adjacent codes
    pub scale: f32,
    /// Code that represents 0.0
    pub zero_point: u32,
    /// Encode/decode policy
    pub quant_type: QuantType,
}

impl LowBitConfig {
    /// Build a config from a value range and derive `scale`/`zero_point`
    ///
    /// # Errors
    ///
    /// Returns `QuantizationError` if `bit` is outside `1..=16` or the range
    /// is not ordered after clamping (NaN bounds).
    pub fn new(min: f32, max: f32, bit: u8, quant_type: QuantType) -> Result<Self> {
        let mut cfg = Self {
            bit,
            min,
            max,
            scale: 0.0,
            zero_point: 0,
            quant_type,
        };
        cfg.reset()?;
        Ok(cfg)
    }

    /// Config for externally pre-scaled signed weights: `x = scale * v`
    ///
    /// Signed values `v` are stored biased by `2^(bit-1)`, so dequantization
    /// reproduces `scale * v` exactly.
    ///
    /// # Errors
    ///
    /// Returns `QuantizationError` on a bad bit width or non-finite scale.
    pub fn from_scale(scale: f32, bit: u8) -> Result<Self> {
        validate_bit(bit)?;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(TesseraError::QuantizationError {
                reason: format!("scale must be finite and positive, got {scale}"),
            });
        }
        let zero_point = 1u32 << (bit - 1);
        let qmax = qmax_for(bit);
        Ok(Self {
            bit,
            min: -scale * zero_point as f32,
            max: scale * (qmax - zero_point) as f32,
            scale,
            zero_point,
            quant_type: QuantType::Asymmetric,
        })
    }

    /// Re-derive `scale` and `zero_point` from `[min, max]` and `bit`
    ///
    /// # Errors
    ///
    /// Returns `QuantizationError` if `bit` is invalid or `min > max`.
    pub fn reset(&mut self) -> Result<()> {
        validate_bit(self.bit)?;
        if self.min.is_nan() || self.max.is_nan() {
            return Err(TesseraError::QuantizationError {
                reason: "range bounds must not be NaN".to_string(),
            });
        }
        self.min = self.min.min(0.0);
        self.max = self.max.max(0.0);
        if !(self.min <= self.max) {
            return Err(TesseraError::QuantizationError {
                reason: format!("min {} > max {}", self.min, self.max),
            });
        }

        let qmax = self.qmax() as f32;
        let range = self.max - self.min;
        // Degenerate all-zero range: any positive step reproduces 0 exactly
        self.scale = if range > 0.0 { range / qmax } else { 1.0 };

        let initial_zero_point = -self.min / self.scale;
        self.zero_point = if initial_zero_point < 0.0 {
            0
        } else if initial_zero_point > qmax {
            self.qmax()
        } else {
            initial_zero_point.round() as u32
        };

        if self.quant_type == QuantType::Symmetric {
            self.min = -self.scale * self.zero_point as f32;
        }
        Ok(())
    }

    /// Largest code, `2^bit - 1`
    #[must_use]
    pub fn qmax(&self) -> u32 {
        qmax_for(self.bit)
    }

    /// Quantize one value (round-half-up, clamped to `[0, qmax]`)
    #[must_use]
    pub fn quantize(&self, x: f32) -> u32 {
        let scale = f64::from(self.scale);
        let shifted = match self.quant_type {
            QuantType::Asymmetric => f64::from(x) / scale + f64::from(self.zero_point),
            QuantType::Symmetric => (f64::from(x) - f64::from(self.min)) / scale,
        };
        let q = (shifted + 0.5).floor();
        if q.is_nan() {
            return self.zero_point;
        }
        q.clamp(0.0, f64::from(self.qmax())) as u32
    }

    /// `(min, max)` pair that rebuilds this config through [`new`](Self::new)
    ///
    /// Symmetric configs store the folded `min` and the matching
    /// `min + scale * qmax`, so the zero point survives a reload.
    #[must_use]
    pub fn stored_range(&self) -> (f32, f32) {
        match self.quant_type {
            QuantType::Asymmetric => (self.min, self.max),
            QuantType::Symmetric => (self.min, self.min + self.scale * self.qmax() as f32),
        }
    }

    /// Exact algebraic inverse of [`quantize`](Self::quantize)
    #[must_use]
    pub fn dequantize(&self, q: u32) -> f32 {
        match self.quant_type {
            QuantType::Asymmetric => self.scale * (q as f32 - self.zero_point as f32),
            QuantType::Symmetric => self.min + self.scale * q as f32,
        }
    }
}

fn validate_bit(bit: u8) -> Result<()> {
    if bit == 0 || bit > MAX_BITS {
        return Err(TesseraError::QuantizationError {
            reason: format!("bit width must be in 1..={MAX_BITS}, got {bit}"),
        });
    }
    Ok(())
}

fn qmax_for(bit: u8) -> u32 {
    (1u32 << bit) - 1
}

/// Split `dims` around `axis` into `(outer, channels, inner)` element counts
pub(crate) fn channel_layout(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

/// Channel that element `index` belongs to
#[inline]
pub(crate) fn channel_of(index: usize, channels: usize, inner: usize) -> usize {
    (index / inner) % channels
}

/// Search quantization parameters for `data` shaped as `dims`
///
/// With `axis == None` one global config is returned; otherwise one config
/// per slice along `axis`.
///
/// # Errors
///
/// Returns an error if `data` does not match `dims`, `axis` is out of range,
/// or the bit width is invalid.
pub fn compute_configs(
    data: &[f32],
    dims: &[usize],
    axis: Option<usize>,
    bit: u8,
    quant_type: QuantType,
) -> Result<Vec<LowBitConfig>> {
    let expected: usize = dims.iter().product();
    if data.len() != expected {
        return Err(TesseraError::DataShapeMismatch {
            data_size: data.len(),
            shape: dims.to_vec(),
            expected,
        });
    }

    let Some(axis) = axis else {
        let (min, max) = min_max(data.iter().copied());
        return Ok(vec![LowBitConfig::new(min, max, bit, quant_type)?]);
    };

    if axis >= dims.len() {
        return Err(TesseraError::InvalidShape {
            reason: format!("per-channel axis {axis} out of range for {} dims", dims.len()),
        });
    }

    let (outer, channels, inner) = channel_layout(dims, axis);
    (0..channels)
        .into_par_iter()
        .map(|c| {
            let values = (0..outer).flat_map(|o| {
                let start = (o * channels + c) * inner;
                data[start..start + inner].iter().copied()
            });
            let (min, max) = min_max(values);
            LowBitConfig::new(min, max, bit, quant_type)
        })
        .collect()
}

fn min_max(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((0.0f32, 0.0f32), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Quantize `data` with per-channel (or global) configs into codes
///
/// `configs.len()` must be 1 (global) or `dims[axis]`.
pub(crate) fn quantize_values(
    data: &[f32],
    dims: &[usize],
    axis: Option<usize>,
    configs: &[LowBitConfig],
) -> Vec<u32> {
    match axis {
        Some(axis) if configs.len() > 1 => {
            let (_, channels, inner) = channel_layout(dims, axis);
            data.iter()
                .enumerate()
                .map(|(i, &x)| configs[channel_of(i, channels, inner)].quantize(x))
                .collect()
        },
        _ => data.iter().map(|&x| configs[0].quantize(x)).collect(),
    }
}

/// Inverse of [`quantize_values`]
#[cfg(test)]
pub(crate) fn dequantize_codes(
    codes: &[u32],
    dims: &[usize],
    axis: Option<usize>,
    configs: &[LowBitConfig],
) -> Vec<f32> {
    match axis {
        Some(axis) if configs.len() > 1 => {
            let (_, channels, inner) = channel_layout(dims, axis);
            codes
                .iter()
                .enumerate()
                .map(|(i, &q)| configs[channel_of(i, channels, inner)].dequantize(q))
                .collect()
        },
        _ => codes.iter().map(|&q| configs[0].dequantize(q)).collect(),
    }
}

/// Pack codes of width `bit` (1, 2, 4, 8 or 16) into bytes
pub(crate) fn pack_codes(codes: &[u32], bit: u8) -> Vec<u8> {
    match bit {
        16 => codes
            .iter()
            .flat_map(|&q| (q as u16).to_le_bytes())
            .collect(),
        8 => codes.iter().map(|&q| q as u8).collect(),
        _ => {
            let per_byte = usize::from(8 / bit);
            let mut out = vec![0u8; codes.len().div_ceil(per_byte)];
            for (i, &q) in codes.iter().enumerate() {
                out[i / per_byte] |= (q as u8) << shift_for(i, bit, per_byte);
            }
            out
        },
    }
}

/// Read the code at `index` from packed bytes
#[inline]
pub(crate) fn unpack_code(bytes: &[u8], index: usize, bit: u8) -> u32 {
    match bit {
        16 => u32::from(u16::from_le_bytes([bytes[2 * index], bytes[2 * index + 1]])),
        8 => u32::from(bytes[index]),
        _ => {
            let per_byte = usize::from(8 / bit);
            let mask = (1u8 << bit) - 1;
            u32::from((bytes[index / per_byte] >> shift_for(index, bit, per_byte)) & mask)
        },
    }
}

/// Unpack the first `count` codes
#[cfg(test)]
pub(crate) fn unpack_codes(bytes: &[u8], count: usize, bit: u8) -> Vec<u32> {
    (0..count).map(|i| unpack_code(bytes, i, bit)).collect()
}

#[inline]
fn shift_for(index: usize, bit: u8, per_byte: usize) -> u32 {
    8 - u32::from(bit) * ((index % per_byte) as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clamps_range_to_include_zero() {
        let cfg = LowBitConfig::new(1.0, 3.0, 8, QuantType::Asymmetric).unwrap();
        assert_eq!(cfg.min, 0.0);
        assert_eq!(cfg.max, 3.0);
        assert_eq!(cfg.zero_point, 0);
        assert!((cfg.scale - 3.0 / 255.0).abs() < 1e-7);

        let cfg = LowBitConfig::new(-4.0, -1.0, 4, QuantType::Asymmetric).unwrap();
        assert_eq!(cfg.max, 0.0);
        assert_eq!(cfg.zero_point, 15);
    }

    #[test]
    fn test_zero_point_rounding() {
        // -min / scale = 1.0 / (3.0 / 15) = 5
        let cfg = LowBitConfig::new(-1.0, 2.0, 4, QuantType::Asymmetric).unwrap();
        assert_eq!(cfg.zero_point, 5);
        assert_eq!(cfg.quantize(0.0), 5);
        assert_eq!(cfg.dequantize(5), 0.0);
    }

    #[test]
    fn test_symmetric_folds_zero_point_into_min() {
        let cfg = LowBitConfig::new(-1.0, 2.0, 4, QuantType::Symmetric).unwrap();
        assert!((cfg.min + cfg.scale * cfg.zero_point as f32).abs() < 1e-6);
        let q = cfg.quantize(0.0);
        assert!(cfg.dequantize(q).abs() < 1e-6);
    }

    #[test]
    fn test_quantize_clamps_out_of_range() {
        let cfg = LowBitConfig::new(-1.0, 1.0, 4, QuantType::Asymmetric).unwrap();
        assert_eq!(cfg.quantize(100.0), 15);
        assert_eq!(cfg.quantize(-100.0), 0);
        assert_eq!(cfg.quantize(f32::NAN), cfg.zero_point);
    }

    #[test]
    fn test_round_half_up() {
        let cfg = LowBitConfig::new(0.0, 15.0, 4, QuantType::Asymmetric).unwrap();
        assert!((cfg.scale - 1.0).abs() < 1e-7);
        assert_eq!(cfg.quantize(2.5), 3);
        assert_eq!(cfg.quantize(2.49), 2);
    }

    #[test]
    fn test_invalid_bit_width() {
        assert!(matches!(
            LowBitConfig::new(-1.0, 1.0, 0, QuantType::Asymmetric),
            Err(TesseraError::QuantizationError { .. })
        ));
        assert!(LowBitConfig::new(-1.0, 1.0, 17, QuantType::Asymmetric).is_err());
    }

    #[test]
    fn test_nan_range_rejected() {
        assert!(LowBitConfig::new(f32::NAN, 1.0, 8, QuantType::Asymmetric).is_err());
    }

    #[test]
    fn test_degenerate_zero_range() {
        let cfg = LowBitConfig::new(0.0, 0.0, 8, QuantType::Asymmetric).unwrap();
        assert_eq!(cfg.dequantize(cfg.quantize(0.0)), 0.0);
    }

    #[test]
    fn test_from_scale_reproduces_signed_values() {
        let cfg = LowBitConfig::from_scale(0.25, 8).unwrap();
        assert_eq!(cfg.zero_point, 128);
        for v in [-128i32, -3, 0, 7, 127] {
            let q = (v + 128) as u32;
            assert!((cfg.dequantize(q) - 0.25 * v as f32).abs() < 1e-6);
        }
        assert!(LowBitConfig::from_scale(0.0, 8).is_err());
    }

    #[test]
    fn test_stored_range_rebuilds_config() {
        for qt in [QuantType::Asymmetric, QuantType::Symmetric] {
            let cfg = LowBitConfig::new(-0.7, 1.9, 4, qt).unwrap();
            let (min, max) = cfg.stored_range();
            let rebuilt = LowBitConfig::new(min, max, 4, qt).unwrap();
            assert_eq!(rebuilt.zero_point, cfg.zero_point);
            assert!((rebuilt.scale - cfg.scale).abs() < 1e-6);
            assert!((rebuilt.min - cfg.min).abs() < 1e-6);
        }
    }

    #[test]
    fn test_pack_unpack_4bit_msb_first() {
        let packed = pack_codes(&[0xA, 0x3, 0xF], 4);
        assert_eq!(packed, vec![0xA3, 0xF0]);
        assert_eq!(unpack_codes(&packed, 3, 4), vec![0xA, 0x3, 0xF]);
    }

    #[test]
    fn test_pack_unpack_narrow_widths() {
        let codes = vec![1, 0, 1, 1, 0, 0, 1, 0, 1];
        let packed = pack_codes(&codes, 1);
        assert_eq!(packed[0], 0b1011_0010);
        assert_eq!(unpack_codes(&packed, codes.len(), 1), codes);

        let codes = vec![3, 0, 2, 1, 2];
        let packed = pack_codes(&codes, 2);
        assert_eq!(packed[0], 0b1100_1001);
        assert_eq!(unpack_codes(&packed, codes.len(), 2), codes);
    }

    #[test]
    fn test_pack_unpack_16bit() {
        let codes = vec![0, 1, 65535, 300];
        let packed = pack_codes(&codes, 16);
        assert_eq!(packed.len(), 8);
        assert_eq!(unpack_codes(&packed, 4, 16), codes);
    }

    #[test]
    fn test_compute_configs_per_channel() {
        // 2 rows x 3 cols, per-row ranges differ
        let data = vec![-1.0, 0.0, 1.0, 0.0, 10.0, 5.0];
        let configs = compute_configs(&data, &[2, 3], Some(0), 8, QuantType::Asymmetric).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].min, -1.0);
        assert_eq!(configs[0].max, 1.0);
        assert_eq!(configs[1].min, 0.0);
        assert_eq!(configs[1].max, 10.0);

        // Per column
        let configs = compute_configs(&data, &[2, 3], Some(1), 8, QuantType::Asymmetric).unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[1].max, 10.0);
        assert_eq!(configs[0].min, -1.0);
    }

    #[test]
    fn test_compute_configs_global_and_errors() {
        let data = vec![-2.0, 4.0];
        let configs = compute_configs(&data, &[2], None, 4, QuantType::Symmetric).unwrap();
        assert_eq!(configs.len(), 1);
        assert!(compute_configs(&data, &[3], None, 4, QuantType::Symmetric).is_err());
        assert!(compute_configs(&data, &[2], Some(1), 4, QuantType::Symmetric).is_err());
    }

    #[test]
    fn test_per_channel_roundtrip_error_bounded() {
        let data: Vec<f32> = (0..24).map(|i| (i as f32 - 12.0) * 0.37).collect();
        let dims = [4, 6];
        let configs = compute_configs(&data, &dims, Some(0), 4, QuantType::Asymmetric).unwrap();
        let codes = quantize_values(&data, &dims, Some(0), &configs);
        let restored = dequantize_codes(&codes, &dims, Some(0), &configs);
        for (i, (a, b)) in data.iter().zip(&restored).enumerate() {
            let scale = configs[i / 6].scale;
            assert!((a - b).abs() <= scale * 1.0001, "element {i}: {a} vs {b}");
        }
    }
}
