//! llama-predict
//!
//! Incremental text generation on top of llama.cpp: prompt state reuse,
//! session files, classifier-free guidance, antiprompts, and streaming.

pub mod generation;
pub mod inference;
pub mod logging;
pub mod storage;

pub use generation::{predict, FinishReason, GenerateError, GenerationRequest, PredictResult, PromptCache, SamplingParams};
pub use inference::{EngineError, LlamaEngine, ModelOptions, PredictError, StreamToken};
