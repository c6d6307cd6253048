//! Model store: memory-mapped weight files, the binary cursor and the
//! weight table
//!
//! ## File layout
//!
//! All integers are little-endian `i32`, floats little-endian `f32`, strings
//! are an `i32` length followed by raw bytes.
//!
//! ```text
//! version                          (= VERSION_ID)
//! n_meta   × (key, value)
//! n_vocab  × (token, id, score)
//! n_weight × (name, ndims, dims[ndims], dtype,
//!             [quantized: axis (-1 = global), k × (min, max)],
//!             payload)
//! ```

mod loader;
mod mmap;
mod weight_map;
mod writer;

pub use loader::{FromLeBytes, ModelLoader};
pub use mmap::{FileMmap, MappedRegion};
pub use weight_map::{WeightMap, MODEL_TYPE_KEY, TOKENIZER_TYPE_KEY, VERSION_ID};
pub use writer::ModelWriter;
