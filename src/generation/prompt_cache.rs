//! Prompt state cache
//!
//! Holds at most one snapshot of engine state taken right after a prompt was
//! evaluated. A later call with the byte-identical prompt restores the
//! snapshot and goes straight to sampling. Any other prompt evicts it.

use uuid::Uuid;

use crate::inference::backend::{BackendError, InferenceBackend, Token};

/// Whether a call may skip prompt evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseDecision {
    /// Restore the snapshot and start sampling
    Reuse,
    /// Tokenize and evaluate the prompt
    Rebuild,
}

/// Single-slot cache of processed prompt state.
///
/// Owned by the caller between calls and handed to each generation by value.
#[derive(Debug, Clone)]
pub struct PromptCache {
    id: Uuid,
    last_prompt: String,
    processed_prompt_tokens: Vec<Token>,
    state: Option<Vec<u8>>,
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptCache {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            last_prompt: String::new(),
            processed_prompt_tokens: Vec::new(),
            state: None,
        }
    }

    /// Decides whether `prompt` can reuse the snapshot in `handle`.
    ///
    /// A mismatched prompt discards the snapshot but keeps the handle. With
    /// caching disabled an existing handle is passed through untouched.
    pub fn lookup(handle: Option<PromptCache>, prompt: &str, cache_all: bool) -> (PromptCache, ReuseDecision) {
        let Some(mut cache) = handle else {
            return (PromptCache::new(), ReuseDecision::Rebuild);
        };

        if !cache_all {
            return (cache, ReuseDecision::Rebuild);
        }

        if cache.state.is_some() && cache.last_prompt == prompt {
            tracing::info!(cache = %cache.id, "Prompt match, reusing processed prompt state");
            return (cache, ReuseDecision::Reuse);
        }

        if cache.state.is_some() {
            tracing::debug!(cache = %cache.id, "New prompt, discarding cached prompt state");
        }
        cache.invalidate();
        (cache, ReuseDecision::Rebuild)
    }

    /// Restores the snapshot into the engine. Returns the number of prompt
    /// tokens the restored state covers.
    pub fn restore<B: InferenceBackend>(&self, backend: &mut B) -> Result<usize, BackendError> {
        let state = self
            .state
            .as_deref()
            .ok_or_else(|| BackendError::State("no snapshot cached".to_string()))?;
        backend.restore_state(state)?;
        Ok(self.processed_prompt_tokens.len())
    }

    /// Captures current engine state as the snapshot for `prompt`
    pub fn save<B: InferenceBackend>(
        &mut self,
        backend: &B,
        prompt: &str,
        tokens: &[Token],
    ) -> Result<(), BackendError> {
        self.invalidate();
        let state = backend.capture_state()?;
        tracing::debug!(
            cache = %self.id,
            "Saved prompt state ({} bytes, {} tokens)",
            state.len(),
            tokens.len()
        );
        self.state = Some(state);
        self.last_prompt = prompt.to_string();
        self.processed_prompt_tokens = tokens.to_vec();
        Ok(())
    }

    /// Drops the snapshot and token list
    pub fn invalidate(&mut self) {
        self.state = None;
        self.processed_prompt_tokens.clear();
    }

    /// Releases the handle
    pub fn free(self) {
        tracing::debug!(cache = %self.id, "Prompt cache freed");
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn last_prompt(&self) -> &str {
        &self.last_prompt
    }

    pub fn processed_prompt_tokens(&self) -> &[Token] {
        &self.processed_prompt_tokens
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }
}
