//! Text generation: sampling policy, repetition windows and the sampler
//!
//! One step of decoding turns a row of logits into a token id:
//!
//! 1. simple greedy configs (`repeat_penalty == 1`, `top_k <= 1`) take the argmax
//! 2. otherwise ids in the [`LastTokensUnit`] window are penalized
//! 3. top-k, temperature, softmax and top-p shape the distribution
//! 4. a uniform draw selects the token
//!
//! [`GenerationSession`] wraps this for one sequence; the batched entry point
//! [`llm_sampling_batch`] samples independent sequences in parallel.

mod config;
mod sampler;
mod session;
mod window;

pub use config::GenerationConfig;
pub use sampler::{apply_repetition_penalty, llm_sampling, llm_sampling_batch};
pub use session::{session_hash_id, GenerationSession};
pub use window::{LastTokensManager, LastTokensUnit};
