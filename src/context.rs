//! Engine context
//!
//! Thread count, device placement, low-memory mode and KV-cache pinning are
//! fixed before inference starts. They live in one immutable [`EngineContext`]
//! value that is passed to the entry points needing them.
//!
//! ```
//! use tessera::{Device, EngineContext};
//!
//! let ctx = EngineContext::new()
//!     .with_threads(8)
//!     .with_device_map([("cuda:0", 1), ("cuda:1", 1)])
//!     .unwrap()
//!     .with_kv_cache_in_cpu(true);
//! assert_eq!(ctx.device_for_layer(0, 32).unwrap(), Device::cuda(0));
//! assert_eq!(ctx.device_for_layer(16, 32).unwrap(), Device::cuda(1));
//! assert_eq!(ctx.kv_cache_device(&Device::cuda(1)), Device::Cpu);
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TesseraError};
use crate::tensor::Device;

/// Payloads at least this large are referenced lazily from the mapping
pub const DEFAULT_LAZY_THRESHOLD: usize = 1 << 20;

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn default_lazy_threshold() -> usize {
    DEFAULT_LAZY_THRESHOLD
}

/// Process-level settings, set once and read-only afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineContext {
    #[serde(default = "default_threads")]
    threads: usize,
    device_map: BTreeMap<String, usize>,
    low_mem_mode: bool,
    kv_cache_in_cpu: bool,
    #[serde(default = "default_lazy_threshold")]
    lazy_threshold: usize,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            device_map: BTreeMap::new(),
            low_mem_mode: false,
            kv_cache_in_cpu: false,
            lazy_threshold: DEFAULT_LAZY_THRESHOLD,
        }
    }
}

impl EngineContext {
    /// Context with defaults: all cores, host placement, eager loading of
    /// small weights
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document such as
    /// `{"threads": 4, "device_map": {"cuda:0": 3, "cpu": 1}}`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for malformed JSON or an invalid
    /// device map.
    pub fn from_json(json: &str) -> Result<Self> {
        let ctx: Self = serde_json::from_str(json)
            .map_err(|e| TesseraError::InvalidConfiguration(format!("engine context: {e}")))?;
        ctx.validate()?;
        Ok(ctx)
    }

    /// Read and parse a JSON config file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| TesseraError::IoError {
            message: format!("Failed to read '{}': {e}", path.display()),
        })?;
        Self::from_json(&content)
    }

    /// Set the worker thread count (at least 1)
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set the device placement map (device name → layer share)
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for unknown device names or a map
    /// whose shares are all zero.
    pub fn with_device_map<K: Into<String>>(
        mut self,
        map: impl IntoIterator<Item = (K, usize)>,
    ) -> Result<Self> {
        self.device_map = map.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.validate()?;
        Ok(self)
    }

    /// Reference every weight payload lazily
    #[must_use]
    pub fn with_low_mem_mode(mut self, enabled: bool) -> Self {
        self.low_mem_mode = enabled;
        self
    }

    /// Keep key/value cache state in host memory
    #[must_use]
    pub fn with_kv_cache_in_cpu(mut self, enabled: bool) -> Self {
        self.kv_cache_in_cpu = enabled;
        self
    }

    /// Minimum payload size for lazy references
    #[must_use]
    pub fn with_lazy_threshold(mut self, bytes: usize) -> Self {
        self.lazy_threshold = bytes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(TesseraError::InvalidConfiguration(
                "threads must be at least 1".to_string(),
            ));
        }
        for (name, &share) in &self.device_map {
            name.parse::<Device>()?;
            if share == 0 {
                warn!(device = %name, "device map entry has zero share and receives no layers");
            }
        }
        if !self.device_map.is_empty() && self.device_map.values().all(|&s| s == 0) {
            return Err(TesseraError::InvalidConfiguration(
                "device map shares sum to zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker thread count
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Device name → layer share
    #[must_use]
    pub fn device_map(&self) -> &BTreeMap<String, usize> {
        &self.device_map
    }

    /// Whether every weight is referenced lazily
    #[must_use]
    pub fn low_mem_mode(&self) -> bool {
        self.low_mem_mode
    }

    /// Whether key/value caches are pinned to host memory
    #[must_use]
    pub fn kv_cache_in_cpu(&self) -> bool {
        self.kv_cache_in_cpu
    }

    /// Minimum payload size for lazy references
    #[must_use]
    pub fn lazy_threshold(&self) -> usize {
        self.lazy_threshold
    }

    /// Whether a payload of `bytes` should stay in the mapping
    #[must_use]
    pub fn is_lazy(&self, bytes: usize) -> bool {
        self.low_mem_mode || bytes >= self.lazy_threshold
    }

    /// Thread pool sized to [`threads`](Self::threads) for CPU kernels
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the pool cannot be created.
    pub fn build_thread_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("tessera-worker-{i}"))
            .build()
            .map_err(|e| TesseraError::InvalidConfiguration(format!("thread pool: {e}")))
    }

    /// Device for layer `current` of `total`
    ///
    /// Layers are split into contiguous runs, one per device in map order,
    /// each run proportional to the device's share. An empty map places
    /// everything on the host.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `current >= total`.
    pub fn device_for_layer(&self, current: usize, total: usize) -> Result<Device> {
        if current >= total {
            return Err(TesseraError::InvalidConfiguration(format!(
                "layer {current} out of range for {total} layers"
            )));
        }
        let total_share: usize = self.device_map.values().sum();
        if total_share == 0 {
            return Ok(Device::Cpu);
        }

        let position = current * total_share / total;
        let mut cumulative = 0;
        let mut chosen = None;
        for (name, &share) in &self.device_map {
            cumulative += share;
            if position < cumulative {
                chosen = Some(name);
                break;
            }
        }
        match chosen {
            Some(name) => name.parse(),
            None => Ok(Device::Cpu),
        }
    }

    /// Placement for key/value cache tensors
    #[must_use]
    pub fn kv_cache_device(&self, default: &Device) -> Device {
        if self.kv_cache_in_cpu {
            Device::Cpu
        } else {
            default.clone()
        }
    }
}
