//! Sequential little-endian reader over a byte range
//!
//! Every read is bounds-checked; running past the end of the buffer is a
//! `FormatError`, never a panic.

use std::io::SeekFrom;

use crate::error::{Result, TesseraError};

/// Fixed-size little-endian primitive
pub trait FromLeBytes: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode from exactly [`SIZE`](Self::SIZE) bytes
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_from_le_bytes {
    ($($t:ty),*) => {
        $(
            impl FromLeBytes for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_from_le_bytes!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Cursor over a weight-file buffer
#[derive(Debug, Clone)]
pub struct ModelLoader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ModelLoader<'a> {
    /// Start reading at the beginning of `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Total buffer size
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Current offset
    #[must_use]
    pub fn tell(&self) -> usize {
        self.offset
    }

    /// Bytes left after the cursor
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Move the cursor; the target must lie within `0..=size`
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the target is outside the buffer.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<usize> {
        let (base, delta) = match pos {
            SeekFrom::Start(p) => (0i128, i128::from(p)),
            SeekFrom::Current(d) => (self.offset as i128, i128::from(d)),
            SeekFrom::End(d) => (self.data.len() as i128, i128::from(d)),
        };
        let target = base + delta;
        if target < 0 || target > self.data.len() as i128 {
            return Err(TesseraError::FormatError {
                reason: format!("seek to {target} outside buffer of {} bytes", self.data.len()),
            });
        }
        self.offset = target as usize;
        Ok(self.offset)
    }

    /// Borrow the next `len` bytes
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(TesseraError::FormatError {
                reason: format!(
                    "read of {len} bytes at offset {} passes end of buffer ({} bytes)",
                    self.offset,
                    self.data.len()
                ),
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Read one little-endian primitive
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on truncation.
    pub fn read_basic<T: FromLeBytes>(&mut self) -> Result<T> {
        self.read_bytes(T::SIZE).map(T::from_le_slice)
    }

    /// Read an `i32`
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on truncation.
    pub fn read_int(&mut self) -> Result<i32> {
        self.read_basic()
    }

    /// Read an `f32`
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on truncation.
    pub fn read_float(&mut self) -> Result<f32> {
        self.read_basic()
    }

    /// Read a non-negative `i32` count or length
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on truncation or a negative value.
    pub fn read_len(&mut self) -> Result<usize> {
        let at = self.offset;
        let value = self.read_int()?;
        usize::try_from(value).map_err(|_| TesseraError::FormatError {
            reason: format!("negative length {value} at offset {at}"),
        })
    }

    /// Read an `i32`-length-prefixed byte string
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on truncation or a negative length.
    pub fn read_string_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    /// Read an `i32`-length-prefixed UTF-8 string
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on truncation or invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String> {
        let at = self.offset;
        let bytes = self.read_string_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| TesseraError::FormatError {
            reason: format!("invalid UTF-8 string at offset {at}: {e}"),
        })
    }
}
