//! Little-endian writer, the counterpart of [`ModelLoader`](super::ModelLoader)

use std::io::Write;

use crate::error::{Result, TesseraError};

/// Buffered writer for the weight file layout
#[derive(Debug)]
pub struct ModelWriter<W: Write> {
    inner: W,
    written: usize,
}

impl<W: Write> ModelWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Bytes written so far
    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Write raw bytes
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the underlying writer fails.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| TesseraError::IoError {
                message: format!("write failed after {} bytes: {e}", self.written),
            })?;
        self.written += bytes.len();
        Ok(())
    }

    /// Write an `i32`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the underlying writer fails.
    pub fn write_int(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write an `f32`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the underlying writer fails.
    pub fn write_float(&mut self, value: f32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a count or length as `i32`
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if `len` does not fit in an `i32`.
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let value = i32::try_from(len).map_err(|_| TesseraError::FormatError {
            reason: format!("length {len} does not fit in i32"),
        })?;
        self.write_int(value)
    }

    /// Write an `i32`-length-prefixed byte string
    ///
    /// # Errors
    ///
    /// Returns `FormatError` or `IoError`.
    pub fn write_string(&mut self, bytes: impl AsRef<[u8]>) -> Result<()> {
        let bytes = bytes.as_ref();
        self.write_len(bytes.len())?;
        self.write_bytes(bytes)
    }

    /// Flush and return the inner writer
    ///
    /// # Errors
    ///
    /// Returns `IoError` if flushing fails.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush().map_err(|e| TesseraError::IoError {
            message: format!("flush failed: {e}"),
        })?;
        Ok(self.inner)
    }
}
