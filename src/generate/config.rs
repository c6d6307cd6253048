//! Sampling policy

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Sampling policy for one generation call
///
/// # Examples
///
/// ```
/// use tessera::GenerationConfig;
///
/// let config = GenerationConfig::default()
///     .with_top_k(40)
///     .with_top_p(0.9)
///     .with_temperature(0.7)
///     .with_repeat_penalty(1.1)
///     .with_output_token_limit(128);
/// assert!(!config.is_simple_greedy());
/// assert!(GenerationConfig::greedy().is_simple_greedy());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate (`None` = unlimited)
    pub output_token_limit: Option<usize>,
    /// Repetition window size
    pub last_n: usize,
    /// Repetition penalty (1.0 = off)
    pub repeat_penalty: f32,
    /// Candidates kept by top-k (0 = whole vocabulary)
    pub top_k: usize,
    /// Nucleus threshold
    pub top_p: f32,
    /// Softmax temperature
    pub temperature: f32,
    /// Keep the logits of every step
    pub output_logits: bool,
    /// Tag the session with a hash id
    pub enable_hash_id: bool,
    /// Tokens that end generation
    pub stop_token_ids: BTreeSet<u32>,
    /// Seed for the sampling draws (`None` = from entropy)
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            output_token_limit: None,
            last_n: 64,
            repeat_penalty: 1.0,
            top_k: 1,
            top_p: 1.0,
            temperature: 1.0,
            output_logits: false,
            enable_hash_id: false,
            stop_token_ids: BTreeSet::new(),
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Argmax decoding
    #[must_use]
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Set top-k
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the repetition penalty
    #[must_use]
    pub fn with_repeat_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = penalty;
        self
    }

    /// Set the repetition window size
    #[must_use]
    pub fn with_last_n(mut self, last_n: usize) -> Self {
        self.last_n = last_n;
        self
    }

    /// Cap the number of generated tokens
    #[must_use]
    pub fn with_output_token_limit(mut self, limit: usize) -> Self {
        self.output_token_limit = Some(limit);
        self
    }

    /// Record logits for every step
    #[must_use]
    pub fn with_output_logits(mut self, enabled: bool) -> Self {
        self.output_logits = enabled;
        self
    }

    /// Tag sessions with a hash id
    #[must_use]
    pub fn with_hash_id(mut self, enabled: bool) -> Self {
        self.enable_hash_id = enabled;
        self
    }

    /// Add a stop token
    #[must_use]
    pub fn with_stop_token(mut self, id: u32) -> Self {
        self.stop_token_ids.insert(id);
        self
    }

    /// Seed the sampling draws
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// True when sampling reduces to argmax: no penalty and `top_k <= 1`
    #[must_use]
    pub fn is_simple_greedy(&self) -> bool {
        (self.repeat_penalty - 1.0).abs() < 1e-8 && self.top_k <= 1
    }

    /// Check parameter ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for a non-positive temperature or
    /// penalty, or `top_p` outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !(self.repeat_penalty.is_finite() && self.repeat_penalty > 0.0) {
            return Err(TesseraError::InvalidConfiguration(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        if self.is_simple_greedy() {
            return Ok(());
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(TesseraError::InvalidConfiguration(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(TesseraError::InvalidConfiguration(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}
