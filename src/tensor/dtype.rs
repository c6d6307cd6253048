//! Logical element types and weight roles

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::quantize::QuantType;

/// Logical element type of a [`Tensor`](super::Tensor)
///
/// Byte footprint per element is `unit_size / unit_size_div`; sub-byte
/// formats round the total up to whole bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// IEEE 754 single precision
    Float32,
    /// Brain float (8-bit exponent, 7-bit mantissa)
    BFloat16,
    /// 16-bit asymmetric quantized codes
    Int16,
    /// 8-bit asymmetric quantized codes
    Int8,
    /// 4-bit asymmetric quantized codes
    Int4,
    /// 2-bit asymmetric quantized codes
    Int2,
    /// 1-bit asymmetric quantized codes
    Bit,
    /// IEEE 754 half precision
    Float16,
    /// 4-bit symmetric codes, `value = min + code * scale`
    Int4NoZero,
    /// Signed 32-bit integer parameters, always resident on the host
    Int32Param,
}

impl DataType {
    /// Numeric tag stored in weight files
    #[must_use]
    pub fn tag(self) -> i32 {
        match self {
            Self::Float32 => 0,
            Self::BFloat16 => 1,
            Self::Int16 => 2,
            Self::Int8 => 3,
            Self::Int4 => 4,
            Self::Int2 => 5,
            Self::Bit => 6,
            Self::Float16 => 7,
            Self::Int4NoZero => 8,
            Self::Int32Param => 100,
        }
    }

    /// Parse a numeric tag
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for unknown tags.
    pub fn from_tag(tag: i32) -> Result<Self> {
        Ok(match tag {
            0 => Self::Float32,
            1 => Self::BFloat16,
            2 => Self::Int16,
            3 => Self::Int8,
            4 => Self::Int4,
            5 => Self::Int2,
            6 => Self::Bit,
            7 => Self::Float16,
            8 => Self::Int4NoZero,
            100 => Self::Int32Param,
            _ => {
                return Err(TesseraError::FormatError {
                    reason: format!("Unknown data type tag: {tag}"),
                })
            },
        })
    }

    /// Numerator of the per-element byte size
    #[must_use]
    pub fn unit_size(self) -> usize {
        match self {
            Self::Float32 | Self::Int32Param => 4,
            Self::BFloat16 | Self::Float16 | Self::Int16 => 2,
            Self::Int8 | Self::Int4 | Self::Int4NoZero | Self::Int2 | Self::Bit => 1,
        }
    }

    /// Denominator of the per-element byte size
    #[must_use]
    pub fn unit_size_div(self) -> usize {
        match self {
            Self::Int4 | Self::Int4NoZero => 2,
            Self::Int2 => 4,
            Self::Bit => 8,
            _ => 1,
        }
    }

    /// Exact byte footprint of `count` elements
    #[must_use]
    pub fn bytes_for(self, count: usize) -> usize {
        (count * self.unit_size()).div_ceil(self.unit_size_div())
    }

    /// Codec parameters for integer formats, `None` for float/int32 types
    #[must_use]
    pub fn quant_params(self) -> Option<(u8, QuantType)> {
        match self {
            Self::Int16 => Some((16, QuantType::Asymmetric)),
            Self::Int8 => Some((8, QuantType::Asymmetric)),
            Self::Int4 => Some((4, QuantType::Asymmetric)),
            Self::Int4NoZero => Some((4, QuantType::Symmetric)),
            Self::Int2 => Some((2, QuantType::Asymmetric)),
            Self::Bit => Some((1, QuantType::Asymmetric)),
            _ => None,
        }
    }

    /// Whether values are stored as quantized codes
    #[must_use]
    pub fn is_quantized(self) -> bool {
        self.quant_params().is_some()
    }

    /// Whether values are stored as floating point
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float16 | Self::BFloat16)
    }

    /// Target type for re-serialization at a given bit width
    ///
    /// `0` means "keep the current type" and yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for widths without a storage format.
    pub fn for_bit_width(bit: u32) -> Result<Option<Self>> {
        Ok(match bit {
            0 => None,
            32 => Some(Self::Float32),
            16 => Some(Self::Float16),
            8 => Some(Self::Int8),
            4 => Some(Self::Int4),
            2 => Some(Self::Int2),
            1 => Some(Self::Bit),
            _ => {
                return Err(TesseraError::InvalidConfiguration(format!(
                    "no storage format for {bit}-bit weights (use 0, 1, 2, 4, 8, 16 or 32)"
                )))
            },
        })
    }

    /// Encode float values into this (float) type's byte layout
    pub(crate) fn encode_floats(self, values: &[f32]) -> Option<Vec<u8>> {
        match self {
            Self::Float32 => Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
            Self::Float16 => Some(
                values
                    .iter()
                    .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                    .collect(),
            ),
            Self::BFloat16 => Some(
                values
                    .iter()
                    .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Decode element `index` of a float-typed byte buffer
    #[inline]
    pub(crate) fn decode_float(self, bytes: &[u8], index: usize) -> f32 {
        match self {
            Self::Float32 => {
                let o = index * 4;
                f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
            },
            Self::Float16 => f16::from_le_bytes([bytes[2 * index], bytes[2 * index + 1]]).to_f32(),
            Self::BFloat16 => {
                bf16::from_le_bytes([bytes[2 * index], bytes[2 * index + 1]]).to_f32()
            },
            Self::Int32Param => {
                let o = index * 4;
                i32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]) as f32
            },
            _ => f32::NAN,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::BFloat16 => "bfloat16",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
            Self::Int2 => "int2",
            Self::Bit => "bit",
            Self::Float16 => "float16",
            Self::Int4NoZero => "int4_nozero",
            Self::Int32Param => "int32param",
        };
        f.write_str(name)
    }
}

/// Role of a tensor inside a weight table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WeightType {
    /// Not a weight, or unknown role
    #[default]
    None,
    /// Linear layer weight (quantized per output row)
    Linear,
    /// Embedding matrix
    Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for dtype in [
            DataType::Float32,
            DataType::BFloat16,
            DataType::Int16,
            DataType::Int8,
            DataType::Int4,
            DataType::Int2,
            DataType::Bit,
            DataType::Float16,
            DataType::Int4NoZero,
            DataType::Int32Param,
        ] {
            assert_eq!(DataType::from_tag(dtype.tag()).unwrap(), dtype);
        }
        assert!(matches!(
            DataType::from_tag(42),
            Err(TesseraError::FormatError { .. })
        ));
    }

    #[test]
    fn test_bytes_for_sub_byte_types() {
        assert_eq!(DataType::Float32.bytes_for(3), 12);
        assert_eq!(DataType::Int4.bytes_for(3), 2);
        assert_eq!(DataType::Int2.bytes_for(5), 2);
        assert_eq!(DataType::Bit.bytes_for(9), 2);
        assert_eq!(DataType::Bit.bytes_for(0), 0);
    }

    #[test]
    fn test_quant_params() {
        assert_eq!(
            DataType::Int4NoZero.quant_params(),
            Some((4, QuantType::Symmetric))
        );
        assert!(DataType::Int16.is_quantized());
        assert!(!DataType::Float16.is_quantized());
        assert!(!DataType::Int32Param.is_float());
    }

    #[test]
    fn test_for_bit_width() {
        assert_eq!(DataType::for_bit_width(0).unwrap(), None);
        assert_eq!(DataType::for_bit_width(4).unwrap(), Some(DataType::Int4));
        assert!(DataType::for_bit_width(3).is_err());
    }

    #[test]
    fn test_float_encode_decode() {
        let values = [1.5f32, -2.25, 0.0];
        for dtype in [DataType::Float32, DataType::Float16, DataType::BFloat16] {
            let bytes = dtype.encode_floats(&values).unwrap();
            assert_eq!(bytes.len(), dtype.bytes_for(values.len()));
            for (i, &v) in values.iter().enumerate() {
                assert_eq!(dtype.decode_float(&bytes, i), v);
            }
        }
        assert!(DataType::Int8.encode_floats(&values).is_none());
    }
}
