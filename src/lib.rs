//! # Tessera
//!
//! Runtime substrate for large-language-model inference: a mixed-precision
//! tensor container, a memory-mapped weight store, a trie-accelerated BPE
//! tokenizer and a windowed next-token sampler.
//!
//! ## Features
//!
//! - **Mixed precision**: float32/float16/bfloat16 plus 16/8/4/2/1-bit
//!   quantized storage with global or per-channel parameters
//! - **Zero-copy loading**: large weights stay in a shared read-only mapping
//!   that lives as long as the last tensor referencing it
//! - **Append-friendly caches**: pre-expanded capacity lets key/value state
//!   grow one step at a time without reallocating
//! - **Deterministic tokenization**: score-ordered merges with a leftmost
//!   tie-break and `<0xHH>` byte fallback
//!
//! ## Example
//!
//! ```rust
//! use tessera::{DataType, GenerationConfig, GenerationSession, Tensor, WeightMap, WeightType};
//!
//! let mut map = WeightMap::new();
//! map.add_tokenizer_word("hi", 0, 0.0);
//! map.add_tokenizer_word("!", 1, 0.0);
//!
//! let w: Vec<u8> = [0.5f32, -0.5, 1.0, -1.0]
//!     .iter()
//!     .flat_map(|v| v.to_le_bytes())
//!     .collect();
//! map.add_weight("lm_head", &[2, 2], DataType::Int8, WeightType::Linear, DataType::Float32, &w)
//!     .unwrap();
//! assert_eq!(map["lm_head"].quant_configs().len(), 2);
//!
//! let prompt = map.tokenizer().encode_ids("hi");
//! let mut session = GenerationSession::new(GenerationConfig::greedy(), &prompt).unwrap();
//! let logits = Tensor::from_f32(&[1, 2], &[0.1, 0.9]).unwrap();
//! let next = session.step(&logits, 0).unwrap().unwrap();
//! assert_eq!(map.tokenizer().decode(&[next]).unwrap(), "!");
//! ```
//!
//! ## Architecture
//!
//! - [`tensor`]: the [`Tensor`] container, element types and device tags
//! - [`quantize`]: the min/max integer codec
//! - [`model`]: mapped files, the binary cursor and the [`WeightMap`]
//! - [`tokenizer`]: vocabulary trie and encoders
//! - [`generate`]: sampling policy, repetition windows and sessions
//! - [`ops`]: checks shared by compute kernels, and in-place cache append
//! - [`context`]: the immutable [`EngineContext`]

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for token ids and counts
#![allow(clippy::cast_possible_truncation)] // codes are range-checked before narrowing
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests
#![allow(clippy::doc_markdown)]

/// Immutable engine configuration
///
/// Thread count, device placement map, low-memory mode and KV-cache
/// pinning, fixed before inference starts.
pub mod context;
pub mod error;
pub mod generate;
/// Weight files and the weight table
///
/// - `FileMmap` / `MappedRegion`: shared read-only mappings
/// - `ModelLoader` / `ModelWriter`: little-endian cursor and writer
/// - `WeightMap`: named tensors, metadata, vocabulary, low-bit re-save
pub mod model;
/// Kernel boundary checks and in-place cache append
pub mod ops;
pub mod quantize;
pub mod tensor;
pub mod tokenizer;

pub use context::EngineContext;
pub use error::{Result, TesseraError};
pub use generate::{
    llm_sampling, llm_sampling_batch, GenerationConfig, GenerationSession, LastTokensManager,
    LastTokensUnit,
};
pub use model::{FileMmap, MappedRegion, ModelLoader, ModelWriter, WeightMap};
pub use quantize::{LowBitConfig, QuantType};
pub use tensor::{DataType, Device, Tensor, WeightType};
pub use tokenizer::{Tokenizer, TokenizerType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
