//! Per-sequence generation driver

use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{llm_sampling, GenerationConfig, LastTokensUnit};
use crate::error::Result;
use crate::tensor::Tensor;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

/// Session hash id: FNV-1a 64 over `sequence` and the prompt ids (all
/// little-endian), as 16 lowercase hex digits
#[must_use]
pub fn session_hash_id(sequence: u64, prompt: &[u32]) -> String {
    let hash = prompt
        .iter()
        .fold(fnv1a(FNV_OFFSET, &sequence.to_le_bytes()), |h, id| {
            fnv1a(h, &id.to_le_bytes())
        });
    format!("{hash:016x}")
}

/// Sampling state of one sequence
///
/// Owns the repetition window (seeded with the prompt), the random source
/// and the output so far. Generation stops at a stop token or at the
/// configured token limit.
///
/// ```
/// use tessera::{GenerationConfig, GenerationSession, Tensor};
///
/// let config = GenerationConfig::greedy().with_output_token_limit(2);
/// let mut session = GenerationSession::new(config, &[1, 2]).unwrap();
/// let logits = Tensor::from_f32(&[1, 3], &[0.0, 0.0, 1.0]).unwrap();
/// assert_eq!(session.step(&logits, 0).unwrap(), Some(2));
/// assert_eq!(session.step(&logits, 0).unwrap(), Some(2));
/// assert_eq!(session.step(&logits, 0).unwrap(), None);
/// ```
#[derive(Debug, Clone)]
pub struct GenerationSession {
    config: GenerationConfig,
    window: LastTokensUnit,
    rng: StdRng,
    generated: Vec<u32>,
    logits: Vec<Vec<f32>>,
    hash_id: Option<String>,
    finished: bool,
}

impl GenerationSession {
    /// Start a session for `prompt`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `config` fails validation.
    pub fn new(config: GenerationConfig, prompt: &[u32]) -> Result<Self> {
        config.validate()?;
        let mut window = LastTokensUnit::new(config.last_n);
        for &id in prompt {
            window.push(id);
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let hash_id = config.enable_hash_id.then(|| {
            let sequence = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
            session_hash_id(sequence, prompt)
        });
        let finished = config.output_token_limit == Some(0);
        debug!(prompt_len = prompt.len(), hash_id = ?hash_id, "started generation session");
        Ok(Self {
            config,
            window,
            rng,
            generated: Vec::new(),
            logits: Vec::new(),
            hash_id,
            finished,
        })
    }

    /// Sample the next token from row `outer_offset` of `logits`
    ///
    /// Returns `None` once the session has finished.
    ///
    /// # Errors
    ///
    /// Returns the sampling error; the session state is unchanged.
    pub fn step(&mut self, logits: &Tensor, outer_offset: usize) -> Result<Option<u32>> {
        if self.finished {
            return Ok(None);
        }
        let rng_value: f32 = self.rng.gen();
        let token = llm_sampling(logits, outer_offset, &self.config, &self.window, rng_value)?;
        if self.config.output_logits {
            let vocab = logits.dims().last().copied().unwrap_or(0);
            self.logits
                .push(logits.read_f32(outer_offset * vocab, vocab)?);
        }

        self.window.push(token);
        self.generated.push(token);
        let at_limit = self
            .config
            .output_token_limit
            .is_some_and(|limit| self.generated.len() >= limit);
        if at_limit || self.config.stop_token_ids.contains(&token) {
            self.finished = true;
            debug!(tokens = self.generated.len(), "generation session finished");
        }
        Ok(Some(token))
    }

    /// Whether no more tokens will be produced
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Tokens produced so far
    #[must_use]
    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    /// Logits recorded per step (empty unless `output_logits` is set)
    #[must_use]
    pub fn logits(&self) -> &[Vec<f32>] {
        &self.logits
    }

    /// Session hash id (when `enable_hash_id` is set)
    #[must_use]
    pub fn hash_id(&self) -> Option<&str> {
        self.hash_id.as_deref()
    }

    /// Repetition window
    #[must_use]
    pub fn window(&self) -> &LastTokensUnit {
        &self.window
    }

    /// Sampling policy
    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }
}
