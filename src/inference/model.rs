//! Model loading
//!
//! GGUF header validation and llama.cpp model loading with a warm-up pass.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::engine::EngineError;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Reasons a file is rejected before it reaches llama.cpp
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Size of the fixed GGUF header: magic, version, tensor count, kv count
const GGUF_HEADER_LEN: u64 = 24;

/// Fixed-size fields at the start of a GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the GGUF header of the file at `path`.
///
/// Only versions 2 and 3 are accepted.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    if file.seek(SeekFrom::End(0))? < GGUF_HEADER_LEN {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; GGUF_HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    let le_u32 = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let le_u64 = |at: usize| u64::from(le_u32(at)) | (u64::from(le_u32(at + 4)) << 32);

    let magic = le_u32(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = le_u32(4);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufMetadata {
        version,
        tensor_count: le_u64(8),
        metadata_kv_count: le_u64(16),
    })
}

/// How to place a model on the hardware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Layers offloaded to the GPU (0 = CPU only)
    pub n_gpu_layers: u32,
    /// Lock model memory so it is not swapped out
    pub use_mlock: bool,
    /// Discard llama.cpp log output
    pub silent: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mlock: false,
            silent: true,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedModelInfo {
    pub path: String,
    pub vocab_size: i32,
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    pub param_count: u64,
    pub size_bytes: u64,
    /// Wall time spent loading and warming up, in milliseconds
    pub load_time_ms: f64,
}

/// Loads a GGUF model and runs one throwaway decode so the first real call
/// does not pay for lazy initialization.
pub fn load_model(
    backend: &LlamaBackend,
    path: &Path,
    options: &ModelOptions,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let started = Instant::now();

    let model_params = LlamaModelParams::default()
        .with_n_gpu_layers(options.n_gpu_layers)
        .with_use_mlock(options.use_mlock);

    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    if let Err(e) = warm_up(backend, &model) {
        tracing::warn!("Model warm-up failed: {}", e);
    }

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
        load_time_ms: started.elapsed().as_secs_f64() * 1000.0,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx) in {:.2} ms",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length,
        info.load_time_ms
    );

    Ok((model, info))
}

fn warm_up(backend: &LlamaBackend, model: &LlamaModel) -> Result<(), String> {
    let params = LlamaContextParams::default().with_n_ctx(NonZeroU32::new(16));
    let mut ctx = model.new_context(backend, params).map_err(|e| e.to_string())?;

    let mut batch = LlamaBatch::new(2, 1);
    batch
        .add(model.token_bos(), 0, &[0], false)
        .map_err(|e| e.to_string())?;
    batch
        .add(model.token_eos(), 1, &[0], true)
        .map_err(|e| e.to_string())?;
    ctx.decode(&mut batch).map_err(|e| e.to_string())?;
    ctx.clear_kv_cache();

    tracing::debug!("Model warm-up complete");
    Ok(())
}
