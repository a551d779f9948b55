//! Incremental generation
//!
//! Everything between a tokenized prompt and a finished completion: prompt
//! state reuse, session files, guidance, sampling, and stop conditions.

pub mod guidance;
pub mod params;
pub mod pipeline;
pub mod prompt_cache;
pub mod result;
pub mod sampling;
pub mod session;
pub mod state;
pub mod stop;

pub use params::{GenerationRequest, SamplingParams};
pub use pipeline::predict;
pub use prompt_cache::{PromptCache, ReuseDecision};
pub use result::{FinishReason, GenerateError, PredictResult};
pub use session::{SessionCache, SessionLoad};
