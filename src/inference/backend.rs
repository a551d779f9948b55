//! Inference engine capabilities
//!
//! The generation loop never talks to llama.cpp directly. Everything it needs
//! from the engine (tokenization, decode, sampling, state snapshots, session
//! files, timings) goes through [`InferenceBackend`], so the loop can be driven
//! by the llama-cpp-2 implementation or by a scripted backend in tests.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation::params::SamplingParams;

/// Token id under the engine's vocabulary
pub type Token = i32;

/// Which evaluation stream a decode call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    /// The main conversation stream
    Primary,
    /// The classifier-free guidance stream seeded by the negative prompt
    Guidance,
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamId::Primary => write!(f, "primary"),
            StreamId::Guidance => write!(f, "guidance"),
        }
    }
}

/// Errors raised by the inference engine capabilities
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Detokenization failed for token {token}: {message}")]
    Detokenize { token: Token, message: String },

    #[error("Failed to evaluate {stream} stream at position {position}: {message}")]
    Decode {
        stream: StreamId,
        position: usize,
        message: String,
    },

    #[error("Sampling failed: {0}")]
    Sample(String),

    #[error("State snapshot failed: {0}")]
    State(String),

    #[error("Session file error: {0}")]
    Session(String),

    #[error("Guidance context unavailable: {0}")]
    GuidanceUnavailable(String),
}

/// Timing and count telemetry reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub t_start_ms: f64,
    pub t_end_ms: f64,
    pub t_load_ms: f64,
    pub t_sample_ms: f64,
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,
    pub n_sample: i32,
    pub n_p_eval: i32,
    pub n_eval: i32,
}

impl Timings {
    /// Wall-clock milliseconds since the Unix epoch
    pub fn now_ms() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0)
    }

    /// Marks the call as running from `t_start_ms` until now
    pub fn stamp(&mut self, t_start_ms: f64) {
        self.t_start_ms = t_start_ms;
        self.t_end_ms = Self::now_ms().max(t_start_ms);
    }

    /// Records one decode call. Multi-token batches count as prompt
    /// evaluation, single tokens as generation evaluation.
    pub fn record_decode(&mut self, n_tokens: usize, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if n_tokens > 1 {
            self.n_p_eval += n_tokens as i32;
            self.t_p_eval_ms += ms;
        } else {
            self.n_eval += n_tokens as i32;
            self.t_eval_ms += ms;
        }
    }

    /// Records one sampling call
    pub fn record_sample(&mut self, elapsed: Duration) {
        self.n_sample += 1;
        self.t_sample_ms += elapsed.as_secs_f64() * 1000.0;
    }

    /// Average generation speed in tokens per second, if anything was generated
    pub fn tokens_per_second(&self) -> Option<f64> {
        if self.n_eval == 0 || self.t_eval_ms <= 0.0 {
            return None;
        }
        Some(self.n_eval as f64 * 1000.0 / self.t_eval_ms)
    }
}

/// Capabilities the generation loop requires from an inference engine.
///
/// Implementations are single-owner: one generation call at a time.
pub trait InferenceBackend {
    /// Context window of the primary stream, in tokens
    fn n_ctx(&self) -> usize;

    /// Context length the model was trained with
    fn n_ctx_train(&self) -> usize;

    /// Whether prompts should be prefixed with the BOS token
    fn add_bos(&self) -> bool;

    fn bos_token(&self) -> Token;

    fn tokenize(&self, text: &str, add_bos: bool, special: bool) -> Result<Vec<Token>, BackendError>;

    /// Raw bytes of a token's text. Pieces may split multibyte characters.
    fn token_to_piece(&self, token: Token, special: bool) -> Result<Vec<u8>, BackendError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Clears all positional state of the primary stream
    fn clear_cache(&mut self);

    /// Invalidates primary stream positions `from..`
    fn truncate_cache(&mut self, from: usize);

    /// Creates the guidance stream. Called at most once per generation.
    fn open_guidance(&mut self) -> Result<(), BackendError>;

    /// Releases the guidance stream if one is open
    fn close_guidance(&mut self);

    /// Evaluates `tokens` at positions `start..start + tokens.len()` on `stream`
    fn evaluate(&mut self, tokens: &[Token], start: usize, stream: StreamId) -> Result<(), BackendError>;

    /// Prepares the sampler for a generation call
    fn init_sampler(&mut self, params: &SamplingParams) -> Result<(), BackendError>;

    /// Samples the next token from the latest primary logits, blended with the
    /// guidance stream when `use_guidance` is set
    fn sample(&mut self, use_guidance: bool) -> Result<Token, BackendError>;

    /// Feeds a token into the sampler history. Grammar state only advances
    /// when `apply_grammar` is set.
    fn accept(&mut self, token: Token, apply_grammar: bool);

    fn free_sampler(&mut self);

    fn state_size(&self) -> usize;

    /// Serializes the complete primary stream state
    fn capture_state(&self) -> Result<Vec<u8>, BackendError>;

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError>;

    /// Loads a session file, restoring engine state and returning the tokens
    /// it was saved with
    fn load_session(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError>;

    fn save_session(&self, path: &Path, tokens: &[Token]) -> Result<(), BackendError>;

    fn reset_timings(&mut self);

    fn timings(&self) -> Timings;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decode_splits_prompt_and_generation() {
        let mut timings = Timings::default();
        timings.record_decode(12, Duration::from_millis(30));
        timings.record_decode(1, Duration::from_millis(10));
        timings.record_decode(1, Duration::from_millis(10));

        assert_eq!(timings.n_p_eval, 12);
        assert_eq!(timings.n_eval, 2);
        assert!((timings.t_p_eval_ms - 30.0).abs() < 0.5);
        assert!((timings.t_eval_ms - 20.0).abs() < 0.5);
    }

    #[test]
    fn test_tokens_per_second() {
        let mut timings = Timings::default();
        assert!(timings.tokens_per_second().is_none());

        timings.record_decode(1, Duration::from_millis(500));
        let tps = timings.tokens_per_second().unwrap();
        assert!((tps - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_stamp_orders_start_and_end() {
        let mut timings = Timings::default();
        let start = Timings::now_ms();
        timings.stamp(start);

        assert!(timings.t_start_ms > 0.0);
        assert_eq!(timings.t_start_ms, start);
        assert!(timings.t_end_ms >= timings.t_start_ms);
    }

    #[test]
    fn test_stream_id_display() {
        assert_eq!(StreamId::Primary.to_string(), "primary");
        assert_eq!(StreamId::Guidance.to_string(), "guidance");
    }
}
