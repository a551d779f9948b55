//! Generation results and failure kinds

use std::path::PathBuf;

use thiserror::Error;

use crate::generation::prompt_cache::PromptCache;
use crate::inference::backend::{BackendError, Timings, Token};

/// Fatal failures of a generation call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerateError {
    #[error("Failed to load session file {path}: {source}")]
    SessionLoadCorrupt {
        path: PathBuf,
        #[source]
        source: BackendError,
    },

    #[error("Prompt is too long ({n_tokens} tokens, max {max})")]
    PromptTooLong { n_tokens: usize, max: usize },

    #[error("Guidance evaluation failed: {0}")]
    GuidanceEvaluation(#[source] BackendError),

    #[error("Evaluation failed: {0}")]
    PrimaryEvaluation(#[source] BackendError),

    #[error("Tokenization failed: {0}")]
    Tokenization(#[source] BackendError),

    #[error("Sampling failed: {0}")]
    Sampling(#[source] BackendError),
}

impl GenerateError {
    /// Stable numeric status for hosts that only see an integer
    pub fn status_code(&self) -> i32 {
        match self {
            GenerateError::SessionLoadCorrupt { .. } => 1,
            GenerateError::PromptTooLong { .. } => 2,
            GenerateError::GuidanceEvaluation(_) => 3,
            GenerateError::PrimaryEvaluation(_) => 4,
            GenerateError::Tokenization(_) => 5,
            GenerateError::Sampling(_) => 6,
        }
    }
}

/// Why a successful generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// `n_predict` tokens were generated
    Budget,
    /// An antiprompt matched the tail of the output
    Antiprompt,
    /// The engine's end-of-generation token was sampled
    EndOfGeneration,
}

/// Outcome of one generation call.
///
/// The prompt cache handle comes back on every path, failures included.
#[derive(Debug)]
pub struct PredictResult {
    pub outcome: Result<FinishReason, GenerateError>,
    /// Generated text
    pub text: String,
    /// Sampled token ids in order
    pub tokens: Vec<Token>,
    pub prompt_cache: PromptCache,
    pub timings: Timings,
    /// Tokens dropped from oversized evaluation buffers
    pub dropped_tokens: usize,
}

impl PredictResult {
    pub(crate) fn failed(error: GenerateError, prompt_cache: PromptCache, timings: Timings) -> Self {
        Self {
            outcome: Err(error),
            text: String::new(),
            tokens: Vec::new(),
            prompt_cache,
            timings,
            dropped_tokens: 0,
        }
    }

    /// 0 on success, otherwise the error's status code
    pub fn status_code(&self) -> i32 {
        match &self.outcome {
            Ok(_) => 0,
            Err(e) => e.status_code(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&GenerateError> {
        self.outcome.as_ref().err()
    }
}
