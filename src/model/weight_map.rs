//! Weight table: named tensors, metadata and the tokenizer vocabulary
//!
//! Populated once at load time and read-only afterwards. Loading from a file
//! maps it and references large payloads in place; every lazy tensor shares
//! ownership of the mapping.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Index;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{FileMmap, MappedRegion, ModelLoader, ModelWriter};
use crate::context::EngineContext;
use crate::error::{Result, TesseraError};
use crate::quantize::{self, LowBitConfig, QuantType};
use crate::tensor::{element_count, DataType, Device, Tensor, WeightType};
use crate::tokenizer::{Tokenizer, TokenizerType};

/// Binary format version written and accepted by this crate
pub const VERSION_ID: i32 = 2;

/// Metadata key selecting the tokenizer algorithm (`bpe` or `normal`)
pub const TOKENIZER_TYPE_KEY: &str = "tokenizer_type";

/// Metadata key naming the model architecture
pub const MODEL_TYPE_KEY: &str = "model_type";

/// Named weights plus metadata and vocabulary
#[derive(Debug, Clone)]
pub struct WeightMap {
    version_id: i32,
    tokenizer: Tokenizer,
    dicts: BTreeMap<String, String>,
    weights: BTreeMap<String, Tensor>,
    embedding_names: BTreeSet<String>,
}

impl Default for WeightMap {
    fn default() -> Self {
        Self {
            version_id: VERSION_ID,
            tokenizer: Tokenizer::default(),
            dicts: BTreeMap::new(),
            weights: BTreeMap::new(),
            embedding_names: BTreeSet::new(),
        }
    }
}

fn format_error(reason: String) -> TesseraError {
    TesseraError::FormatError { reason }
}

fn check_version(version: i32) -> Result<()> {
    if version == VERSION_ID {
        Ok(())
    } else {
        Err(format_error(format!(
            "unsupported weight file version {version} (expected {VERSION_ID})"
        )))
    }
}

impl WeightMap {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `path` and parse it
    ///
    /// Payloads selected by [`EngineContext::is_lazy`] stay in the mapping;
    /// the rest are copied onto the heap.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be mapped and `FormatError` for
    /// truncated or malformed contents.
    pub fn load_from_file(path: impl AsRef<Path>, ctx: &EngineContext) -> Result<Self> {
        let path = path.as_ref();
        let mmap = FileMmap::open(path)?;
        let map = Self::parse(mmap.data(), Some((&mmap, ctx)))?;
        info!(
            path = %path.display(),
            weights = map.weights.len(),
            lazy = map.weights.values().filter(|t| t.is_mapped()).count(),
            vocab = map.tokenizer.vocab_size(),
            "loaded weight map"
        );
        Ok(map)
    }

    /// Read only the `model_type` metadata entry of a weight file
    ///
    /// Stops after the metadata section, so neither the vocabulary nor any
    /// weight payload is touched.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be mapped and `FormatError` for
    /// a bad version or truncated metadata.
    pub fn model_type_from_file(path: impl AsRef<Path>) -> Result<Option<String>> {
        let mmap = FileMmap::open(path.as_ref())?;
        let mut loader = ModelLoader::new(mmap.data());
        check_version(loader.read_int()?)?;

        let mut model_type = None;
        let n_meta = loader.read_len()?;
        for _ in 0..n_meta {
            let key = loader.read_string()?;
            let value = loader.read_string()?;
            if key == MODEL_TYPE_KEY {
                model_type = Some(value);
            }
        }
        Ok(model_type)
    }

    /// Parse an in-memory image, copying every payload
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for truncated or malformed contents.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse(data, None)
    }

    fn parse(data: &[u8], lazy: Option<(&Arc<FileMmap>, &EngineContext)>) -> Result<Self> {
        let mut loader = ModelLoader::new(data);
        check_version(loader.read_int()?)?;
        let mut map = Self::new();

        let n_meta = loader.read_len()?;
        for _ in 0..n_meta {
            let key = loader.read_string()?;
            let value = loader.read_string()?;
            map.add_dict(key, value);
        }

        let n_vocab = loader.read_len()?;
        for _ in 0..n_vocab {
            let token = loader.read_string_bytes()?;
            let at = loader.tell();
            let id = u32::try_from(loader.read_int()?)
                .map_err(|_| format_error(format!("negative token id at offset {at}")))?;
            let score = loader.read_float()?;
            map.tokenizer.insert(token, id, score);
        }

        let n_weight = loader.read_len()?;
        for _ in 0..n_weight {
            let (name, tensor) = read_weight(&mut loader, lazy)?;
            debug!(name = %name, tensor = %tensor, "read weight");
            map.weights.insert(name, tensor);
        }

        if loader.remaining() > 0 {
            warn!(bytes = loader.remaining(), "trailing bytes after weight records");
        }
        Ok(map)
    }

    /// Write the table to `path`, re-encoding every weight at `bit` width
    ///
    /// `bit` is 0 (keep each weight's type), 32, 16, 8, 4, 2 or 1. Integer
    /// targets are quantized per output row for matrices and globally for
    /// vectors. `Int32Param` weights are written unchanged. The in-memory
    /// table is not modified.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an unsupported `bit`, `IoError` on
    /// write failure, or the first encoding error.
    pub fn save_low_bit_model(&self, path: impl AsRef<Path>, bit: u32) -> Result<()> {
        let path = path.as_ref();
        let target = DataType::for_bit_width(bit)?;
        let file = File::create(path).map_err(|e| TesseraError::IoError {
            message: format!("Failed to create '{}': {e}", path.display()),
        })?;
        let mut writer = ModelWriter::new(BufWriter::new(file));
        self.write_to(&mut writer, target)?;
        let written = writer.written();
        writer.finish()?;
        info!(path = %path.display(), bit, bytes = written, "saved weight map");
        Ok(())
    }

    /// In-memory equivalent of [`save_low_bit_model`](Self::save_low_bit_model)
    ///
    /// # Errors
    ///
    /// See [`save_low_bit_model`](Self::save_low_bit_model).
    pub fn to_bytes(&self, bit: u32) -> Result<Vec<u8>> {
        let target = DataType::for_bit_width(bit)?;
        let mut writer = ModelWriter::new(Vec::new());
        self.write_to(&mut writer, target)?;
        writer.finish()
    }

    fn write_to<W: Write>(&self, writer: &mut ModelWriter<W>, target: Option<DataType>) -> Result<()> {
        writer.write_int(self.version_id)?;

        writer.write_len(self.dicts.len())?;
        for (key, value) in &self.dicts {
            writer.write_string(key)?;
            writer.write_string(value)?;
        }

        let entries = self.tokenizer.entries();
        writer.write_len(entries.len())?;
        for (token, id, score) in entries {
            writer.write_string(token)?;
            writer.write_int(i32::try_from(id).map_err(|_| {
                format_error(format!("token id {id} does not fit in i32"))
            })?)?;
            writer.write_float(score)?;
        }

        writer.write_len(self.weights.len())?;
        for (name, tensor) in &self.weights {
            let encoded = encode_for_save(tensor, target)?;
            debug!(name = %name, from = %tensor.dtype(), to = %encoded.dtype(), "writing weight");
            write_weight(writer, name, &encoded)?;
        }
        Ok(())
    }

    /// Format version of this table
    #[must_use]
    pub fn version_id(&self) -> i32 {
        self.version_id
    }

    /// Embedded vocabulary
    #[must_use]
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Mutable vocabulary
    pub fn tokenizer_mut(&mut self) -> &mut Tokenizer {
        &mut self.tokenizer
    }

    /// Add one vocabulary entry
    pub fn add_tokenizer_word(&mut self, word: impl AsRef<[u8]>, id: u32, score: f32) {
        self.tokenizer.insert(word, id, score);
    }

    /// Set a metadata entry
    ///
    /// [`TOKENIZER_TYPE_KEY`] also switches the tokenizer algorithm; an
    /// unrecognized tokenizer type is dropped with a warning.
    pub fn add_dict(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key == TOKENIZER_TYPE_KEY {
            match value.parse::<TokenizerType>() {
                Ok(kind) => self.tokenizer.set_tokenizer_type(kind),
                Err(e) => {
                    warn!(value = %value, error = %e, "ignoring tokenizer type");
                    return;
                },
            }
        }
        self.dicts.insert(key, value);
    }

    /// Metadata entries
    #[must_use]
    pub fn dicts(&self) -> &BTreeMap<String, String> {
        &self.dicts
    }

    /// One metadata value
    #[must_use]
    pub fn get_dict(&self, key: &str) -> Option<&str> {
        self.dicts.get(key).map(String::as_str)
    }

    /// Convert `data` (encoded as `source_dtype`) into a `dtype` weight
    ///
    /// Integer targets are quantized on the fly: per output row for
    /// `Linear` matrices, globally otherwise.
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if `data` does not match `dims`,
    /// `UnsupportedOperation` for a quantized source, or a quantization
    /// error.
    pub fn add_weight(
        &mut self,
        key: impl Into<String>,
        dims: &[usize],
        dtype: DataType,
        weight_type: WeightType,
        source_dtype: DataType,
        data: &[u8],
    ) -> Result<()> {
        let key = key.into();
        if source_dtype.is_quantized() {
            return Err(TesseraError::UnsupportedOperation {
                operation: "add_weight".to_string(),
                reason: format!("source data for '{key}' is {source_dtype}, which has no parameters"),
            });
        }
        let expected = source_dtype.bytes_for(element_count(dims));
        if data.len() != expected {
            return Err(TesseraError::DataShapeMismatch {
                data_size: data.len(),
                shape: dims.to_vec(),
                expected,
            });
        }

        let mut tensor = if dtype == source_dtype {
            Tensor::from_raw(dtype, dims, data.to_vec())?
        } else {
            let values = Tensor::from_raw(source_dtype, dims, data.to_vec())?.to_f32_vec()?;
            if dtype.is_quantized() {
                let axis = (weight_type == WeightType::Linear && dims.len() >= 2).then_some(0);
                Tensor::quantize_from_f32(dtype, dims, &values, axis)?
            } else {
                Tensor::from_values(dtype, dims, &values)?
            }
        };
        tensor.set_weight_type(weight_type);
        if weight_type == WeightType::Embedding {
            self.embedding_names.insert(key.clone());
        }
        debug!(name = %key, from = %source_dtype, tensor = %tensor, "added weight");
        self.weights.insert(key, tensor);
        Ok(())
    }

    /// Add an externally pre-scaled linear weight
    ///
    /// `codes` holds one signed value per element of the `[rows, cols]`
    /// matrix, and row `r` dequantizes to `scales[r] * code`. 8-bit weights
    /// are stored as `Int8`, 4-bit ones (codes in `-8..=7`) as `Int4NoZero`.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported bit widths, mismatched lengths,
    /// out-of-range 4-bit codes or non-positive scales.
    pub fn add_qlinear_weight(
        &mut self,
        key: impl Into<String>,
        dims: &[usize],
        bit: u8,
        scales: &[f32],
        codes: &[i8],
    ) -> Result<()> {
        let key = key.into();
        let dtype = match bit {
            8 => DataType::Int8,
            4 => DataType::Int4NoZero,
            _ => {
                return Err(TesseraError::QuantizationError {
                    reason: format!("qlinear weights must be 4 or 8 bit, got {bit}"),
                })
            },
        };
        if dims.len() != 2 {
            return Err(TesseraError::InvalidShape {
                reason: format!("qlinear weight '{key}' must be 2-D, got {dims:?}"),
            });
        }
        if scales.len() != dims[0] {
            return Err(TesseraError::DataShapeMismatch {
                data_size: scales.len(),
                shape: dims.to_vec(),
                expected: dims[0],
            });
        }
        if codes.len() != dims[0] * dims[1] {
            return Err(TesseraError::DataShapeMismatch {
                data_size: codes.len(),
                shape: dims.to_vec(),
                expected: dims[0] * dims[1],
            });
        }

        let bias = 1i32 << (bit - 1);
        let biased = codes
            .iter()
            .map(|&c| {
                let q = i32::from(c) + bias;
                u32::try_from(q)
                    .ok()
                    .filter(|&q| q < (1 << bit))
                    .ok_or_else(|| TesseraError::QuantizationError {
                        reason: format!("code {c} out of range for {bit}-bit weight '{key}'"),
                    })
            })
            .collect::<Result<Vec<u32>>>()?;
        let configs = scales
            .iter()
            .map(|&s| {
                let cfg = LowBitConfig::from_scale(s, bit)?;
                Ok(match dtype {
                    DataType::Int4NoZero => LowBitConfig {
                        quant_type: QuantType::Symmetric,
                        ..cfg
                    },
                    _ => cfg,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tensor = Tensor::from_raw(dtype, dims, quantize::pack_codes(&biased, bit))?;
        tensor.set_quant_configs(Some(0), configs)?;
        tensor.set_weight_type(WeightType::Linear);
        debug!(name = %key, tensor = %tensor, "added qlinear weight");
        self.weights.insert(key, tensor);
        Ok(())
    }

    /// Record `name` as an embedding matrix
    ///
    /// Embeddings stay on the host in [`to_device`](Self::to_device).
    pub fn mark_embedding(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Some(tensor) = self.weights.get_mut(&name) {
            tensor.set_weight_type(WeightType::Embedding);
        }
        self.embedding_names.insert(name);
    }

    /// Names recorded as embedding matrices
    #[must_use]
    pub fn embedding_names(&self) -> &BTreeSet<String> {
        &self.embedding_names
    }

    /// Move every weight except embeddings and host-locked tensors
    ///
    /// # Errors
    ///
    /// Returns the first transfer error.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        let mut moved = 0usize;
        for (name, tensor) in &mut self.weights {
            if self.embedding_names.contains(name) || tensor.is_locked_in_cpu() {
                continue;
            }
            tensor.to_device(device)?;
            moved += 1;
        }
        info!(device = %device, moved, "moved weights");
        Ok(())
    }

    /// Weight by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.weights.get(name)
    }

    /// Mutable weight by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.weights.get_mut(name)
    }

    /// Whether a weight exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    /// Weights in name order
    pub fn weights(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of weights
    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether the table has no weights
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl Index<&str> for WeightMap {
    type Output = Tensor;

    /// # Panics
    ///
    /// Panics if no weight is named `name`.
    fn index(&self, name: &str) -> &Tensor {
        match self.weights.get(name) {
            Some(tensor) => tensor,
            None => panic!("no weight named '{name}'"),
        }
    }
}

fn read_weight(
    loader: &mut ModelLoader<'_>,
    lazy: Option<(&Arc<FileMmap>, &EngineContext)>,
) -> Result<(String, Tensor)> {
    let name = loader.read_string()?;
    let ndims = loader.read_len()?;
    let dims = (0..ndims)
        .map(|_| loader.read_len())
        .collect::<Result<Vec<_>>>()?;
    let dtype = DataType::from_tag(loader.read_int()?)?;

    let quant = match dtype.quant_params() {
        Some((bit, quant_type)) => {
            let axis = match loader.read_int()? {
                -1 => None,
                a if a >= 0 && (a as usize) < dims.len() => Some(a as usize),
                a => {
                    return Err(format_error(format!(
                        "weight '{name}': per-channel axis {a} out of range for {dims:?}"
                    )))
                },
            };
            let channels = axis.map_or(1, |a| dims[a]);
            let configs = (0..channels)
                .map(|_| {
                    let min = loader.read_float()?;
                    let max = loader.read_float()?;
                    LowBitConfig::new(min, max, bit, quant_type)
                })
                .collect::<Result<Vec<_>>>()?;
            Some((axis, configs))
        },
        None => None,
    };

    let count = dims
        .iter()
        .try_fold(dtype.unit_size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| format_error(format!("weight '{name}': shape {dims:?} overflows")))?;
    let bytes = count.div_ceil(dtype.unit_size_div());
    let offset = loader.tell();
    let payload = loader.read_bytes(bytes)?;

    let tensor = match lazy {
        Some((mmap, ctx)) if ctx.is_lazy(bytes) => {
            let region = MappedRegion::new(Arc::clone(mmap), offset, bytes)?;
            Tensor::from_mapped(dtype, &dims, region)
        },
        _ => Tensor::from_raw(dtype, &dims, payload.to_vec()),
    };
    let mut tensor = tensor.map_err(|e| format_error(format!("weight '{name}': {e}")))?;
    if let Some((axis, configs)) = quant {
        tensor.set_quant_configs(axis, configs)?;
    }
    Ok((name, tensor))
}

fn encode_for_save(tensor: &Tensor, target: Option<DataType>) -> Result<Cow<'_, Tensor>> {
    let Some(target) = target else {
        return Ok(Cow::Borrowed(tensor));
    };
    if tensor.dtype() == DataType::Int32Param {
        return Ok(Cow::Borrowed(tensor));
    }
    let values = tensor.to_f32_vec()?;
    let converted = if target.is_quantized() {
        let axis = (tensor.ndim() >= 2).then_some(0);
        Tensor::quantize_from_f32(target, tensor.dims(), &values, axis)?
    } else {
        Tensor::from_values(target, tensor.dims(), &values)?
    };
    Ok(Cow::Owned(converted))
}

fn write_weight<W: Write>(writer: &mut ModelWriter<W>, name: &str, tensor: &Tensor) -> Result<()> {
    let bytes = tensor.as_bytes();
    if bytes.len() != tensor.get_bytes() {
        return Err(TesseraError::UnsupportedOperation {
            operation: "save_weight".to_string(),
            reason: format!("weight '{name}' has no allocated buffer"),
        });
    }

    writer.write_string(name)?;
    writer.write_len(tensor.ndim())?;
    for &d in tensor.dims() {
        writer.write_len(d)?;
    }
    writer.write_int(tensor.dtype().tag())?;

    if tensor.dtype().is_quantized() {
        if tensor.quant_configs().is_empty() {
            return Err(TesseraError::QuantizationError {
                reason: format!("weight '{name}' has no quantization parameters"),
            });
        }
        let axis = match tensor.per_channel_axis() {
            Some(a) if tensor.quant_configs().len() > 1 => i32::try_from(a)
                .map_err(|_| format_error(format!("axis {a} does not fit in i32")))?,
            _ => -1,
        };
        writer.write_int(axis)?;
        for cfg in tensor.quant_configs() {
            let (min, max) = cfg.stored_range();
            writer.write_float(min)?;
            writer.write_float(max)?;
        }
    }
    writer.write_bytes(bytes)
}
