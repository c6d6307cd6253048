//! Tensor byte storage
//!
//! A tensor either owns its buffer or holds a read-only reference into a
//! shared mapping. Mutable access to a mapped buffer first materializes a
//! private copy, so mappings are never written through.

use crate::model::MappedRegion;

#[derive(Debug, Clone, Default)]
pub(crate) enum Storage {
    /// No buffer reserved yet
    #[default]
    Empty,
    /// Exclusively owned bytes (host or accelerator-tagged)
    Owned(Vec<u8>),
    /// Lazy zero-copy view into a weight file
    Mapped(MappedRegion),
}

impl Storage {
    /// Reserved bytes
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Owned(bytes) => bytes.len(),
            Self::Mapped(region) => region.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Owned(bytes) => bytes,
            Self::Mapped(region) => region.as_slice(),
        }
    }

    pub(crate) fn mapped(&self) -> Option<&MappedRegion> {
        match self {
            Self::Mapped(region) => Some(region),
            _ => None,
        }
    }

    /// Owned buffer, copying out of a mapping if needed
    pub(crate) fn make_owned(&mut self) -> &mut Vec<u8> {
        if !matches!(self, Self::Owned(_)) {
            let bytes = self.as_slice().to_vec();
            *self = Self::Owned(bytes);
        }
        match self {
            Self::Owned(bytes) => bytes,
            _ => unreachable!("storage was just made owned"),
        }
    }
}
