//! Generation parameters
//!
//! One structured options type per generation call. Every field has a
//! documented default so hosts can start from `GenerationRequest::default()`
//! and override what they need.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Guidance scales at or below this value leave sampling untouched
pub const GUIDANCE_NOOP_SCALE: f32 = 1.0;

/// Sampling configuration handed to the engine's sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// RNG seed (0 = pick a random seed per call)
    pub seed: u32,
    /// Top-k cutoff (<= 0 = vocabulary size)
    pub top_k: i32,
    /// Nucleus threshold (1.0 = disabled)
    pub top_p: f32,
    /// Minimum probability relative to the best token (0.0 = disabled)
    pub min_p: f32,
    /// Locally typical sampling (1.0 = disabled)
    pub typical_p: f32,
    /// Temperature (<= 0.0 = greedy)
    pub temp: f32,
    /// Dynamic temperature range (0.0 = disabled)
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    /// Last n tokens considered for penalties (0 = disabled, -1 = context size)
    pub penalty_last_n: i32,
    /// Repetition penalty (1.0 = disabled)
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    /// 0 = disabled, 1 = mirostat, 2 = mirostat 2.0
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// Classifier-free guidance scale (1.0 = disabled)
    pub cfg_scale: f32,
    /// GBNF grammar constraining sampled tokens
    pub grammar: Option<String>,
    /// Force the EOS logit to -inf
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: 0,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            temp: 0.8,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            cfg_scale: 1.0,
            grammar: None,
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    /// Whether a guidance stream must run alongside the primary one
    pub fn guidance_enabled(&self) -> bool {
        self.cfg_scale > GUIDANCE_NOOP_SCALE
    }

    fn validate(&mut self) {
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.min_p = self.min_p.clamp(0.0, 1.0);
        self.typical_p = self.typical_p.clamp(0.0, 1.0);
        if self.penalty_last_n < -1 {
            self.penalty_last_n = -1;
        }
        if !(0..=2).contains(&self.mirostat) {
            self.mirostat = 0;
        }
        if self.grammar.as_deref().is_some_and(|g| g.trim().is_empty()) {
            self.grammar = None;
        }
    }
}

/// A single generation call. Immutable for the duration of the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    /// Text to evaluate before generating
    pub prompt: String,
    /// Negative prompt for the guidance stream
    pub negative_prompt: String,
    /// Stop sequences
    pub antiprompts: Vec<String>,
    /// Threads used for single-token decode
    pub n_threads: i32,
    /// Threads used for batch decode (<= 0 = same as `n_threads`)
    pub n_threads_batch: i32,
    /// New tokens to generate (-1 = until end of generation)
    pub n_predict: i32,
    /// Context window size
    pub n_ctx: u32,
    /// Maximum tokens per evaluate call
    pub n_batch: u32,
    /// Session file for cross-run prefix reuse
    pub session_path: Option<PathBuf>,
    /// Keep an in-memory snapshot of the processed prompt for exact repeats
    pub prompt_cache_all: bool,
    /// Read the session file but never write it
    pub prompt_cache_ro: bool,
    /// Render special tokens in the output text
    pub include_specials: bool,
    pub sampling: SamplingParams,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4);
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            antiprompts: Vec::new(),
            n_threads: threads,
            n_threads_batch: -1,
            n_predict: -1,
            n_ctx: 2048,
            n_batch: 512,
            session_path: None,
            prompt_cache_all: false,
            prompt_cache_ro: false,
            include_specials: false,
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationRequest {
    /// Creates a request for `prompt` with default settings
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Validate parameter values
    ///
    /// Clamps values into ranges the engine accepts
    pub fn validate(&mut self) {
        if self.n_threads <= 0 {
            self.n_threads = 1;
        }
        if self.n_batch == 0 {
            self.n_batch = 512;
        }
        if self.n_ctx == 0 {
            self.n_ctx = 2048;
        }
        if self.n_predict < -1 {
            self.n_predict = -1;
        }
        self.antiprompts.retain(|a| !a.is_empty());
        self.sampling.validate();
    }

    /// Thread count for batch decode after resolving the fallback
    pub fn threads_batch(&self) -> i32 {
        if self.n_threads_batch > 0 {
            self.n_threads_batch
        } else {
            self.n_threads
        }
    }
}
