//! Sampling history
//!
//! Tracks every token fed to the sampler (prompt and generated) so the stop
//! detector can look back over the tail of the conversation. The engine's
//! sampler keeps its own copy for repetition penalties.

use std::collections::VecDeque;

use crate::generation::params::SamplingParams;
use crate::generation::stop::TAIL_TOKENS;
use crate::inference::backend::{BackendError, InferenceBackend, Token};

#[derive(Debug)]
pub struct SamplingContext {
    prev: VecDeque<Token>,
    capacity: usize,
}

impl SamplingContext {
    /// Initializes the engine sampler and an empty history
    pub fn init<B: InferenceBackend>(backend: &mut B, params: &SamplingParams) -> Result<Self, BackendError> {
        backend.init_sampler(params)?;
        let capacity = TAIL_TOKENS.max(params.penalty_last_n.max(0) as usize);
        Ok(Self {
            prev: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Samples the next token
    pub fn sample<B: InferenceBackend>(&self, backend: &mut B, use_guidance: bool) -> Result<Token, BackendError> {
        backend.sample(use_guidance)
    }

    /// Records a token. Prompt tokens are accepted without grammar.
    pub fn accept<B: InferenceBackend>(&mut self, backend: &mut B, token: Token, apply_grammar: bool) {
        backend.accept(token, apply_grammar);
        if self.prev.len() == self.capacity {
            self.prev.pop_front();
        }
        self.prev.push_back(token);
    }

    pub fn last(&self) -> Option<Token> {
        self.prev.back().copied()
    }

    /// Decodes the last `n` tokens of history into text
    pub fn prev_str<B: InferenceBackend>(&self, backend: &B, n: usize) -> Result<String, BackendError> {
        let skip = self.prev.len().saturating_sub(n);
        let mut bytes = Vec::new();
        for token in self.prev.iter().skip(skip) {
            bytes.extend(backend.token_to_piece(*token, true)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Releases the engine sampler
    pub fn free<B: InferenceBackend>(self, backend: &mut B) {
        backend.free_sampler();
    }
}
