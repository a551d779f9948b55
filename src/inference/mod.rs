//! LLM inference engine
//!
//! The capability seam the generation loop drives, its llama.cpp
//! implementation, and the worker-thread engine hosts talk to.

pub mod backend;
pub mod engine;
pub mod llama;
#[cfg(test)]
pub mod mock;
pub mod model;
pub mod runtime;
pub mod streaming;

pub use backend::{BackendError, InferenceBackend, StreamId, Timings, Token};
pub use engine::{EngineError, LlamaEngine, PredictError, PredictHandle};
pub use model::{validate_gguf, GgufMetadata, LoadedModelInfo, ModelError, ModelOptions, GGUF_MAGIC};
pub use runtime::init_backend;
pub use streaming::StreamToken;
