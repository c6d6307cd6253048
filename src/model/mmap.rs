//! Memory-mapped weight files
//!
//! A [`FileMmap`] is shared through `Arc`: every lazily-loaded tensor holds a
//! [`MappedRegion`] that keeps the mapping alive, so the mapping is released
//! only when the last tensor referencing it is dropped.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Result, TesseraError};

/// Read-only memory mapping of a weight file
#[derive(Debug)]
pub struct FileMmap {
    mmap: Mmap,
    path: PathBuf,
}

impl FileMmap {
    /// Map `path` read-only
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be opened or mapped.
    #[allow(unsafe_code)]
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TesseraError::IoError {
            message: format!("Failed to open '{}': {e}", path.display()),
        })?;

        // SAFETY: the file is opened read-only and never written through the
        // mapping. Truncating it externally while mapped raises SIGBUS.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| TesseraError::IoError {
                message: format!("Failed to mmap '{}': {e}", path.display()),
            })?
        };

        #[cfg(unix)]
        if let Err(e) = mmap.advise(memmap2::Advice::Sequential) {
            tracing::warn!(path = %path.display(), error = %e, "madvise(MADV_SEQUENTIAL) failed");
        }

        Ok(Arc::new(Self {
            mmap,
            path: path.to_path_buf(),
        }))
    }

    /// Whole file contents
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// File size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the file is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the mapping was opened from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Byte range inside a shared mapping
#[derive(Debug, Clone)]
pub struct MappedRegion {
    file: Arc<FileMmap>,
    offset: usize,
    len: usize,
}

impl MappedRegion {
    /// Reference `len` bytes at `offset`
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the range falls outside the mapping.
    pub fn new(file: Arc<FileMmap>, offset: usize, len: usize) -> Result<Self> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= file.len());
        if !in_bounds {
            return Err(TesseraError::FormatError {
                reason: format!(
                    "Mapped range {offset}+{len} exceeds file size {} of '{}'",
                    file.len(),
                    file.path().display()
                ),
            });
        }
        Ok(Self { file, offset, len })
    }

    /// Referenced bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.file.data()[self.offset..self.offset + self.len]
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset into the file
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Shared mapping handle
    #[must_use]
    pub fn file(&self) -> &Arc<FileMmap> {
        &self.file
    }
}
