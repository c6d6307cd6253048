//! Device placement tags

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Where a tensor's buffer lives
///
/// An accelerator placement may span several device ids for model-parallel
/// layouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    /// Host memory
    #[default]
    Cpu,
    /// One or more CUDA device ordinals
    Cuda(Vec<usize>),
}

impl Device {
    /// Single CUDA device
    #[must_use]
    pub fn cuda(id: usize) -> Self {
        Self::Cuda(vec![id])
    }

    /// Whether this is host memory
    #[must_use]
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Accelerator ordinals (empty for host)
    #[must_use]
    pub fn ids(&self) -> &[usize] {
        match self {
            Self::Cpu => &[],
            Self::Cuda(ids) => ids,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ids) => {
                f.write_str("cuda:")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            },
        }
    }
}

impl FromStr for Device {
    type Err = TesseraError;

    /// Parse `cpu`, `cuda`, `cuda:N` or `cuda:N,M,...`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::Cpu);
        }
        if s.eq_ignore_ascii_case("cuda") {
            return Ok(Self::cuda(0));
        }
        let ids = s
            .strip_prefix("cuda:")
            .ok_or_else(|| TesseraError::InvalidConfiguration(format!("Unknown device: '{s}'")))?;
        let ids = ids
            .split(',')
            .map(|id| {
                id.trim().parse::<usize>().map_err(|e| {
                    TesseraError::InvalidConfiguration(format!("Bad device id in '{s}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::Cuda(ids))
    }
}
