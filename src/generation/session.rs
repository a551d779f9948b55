//! Session token cache
//!
//! Mirrors the tokens whose evaluation is reflected in the engine state
//! saved to a session file. On load, the longest prefix shared with the new
//! prompt is reused and everything after it is invalidated.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::generation::state::GenerationState;
use crate::inference::backend::{BackendError, InferenceBackend, Token};

/// What was found at the session path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoad {
    /// No file yet; it will be created
    Absent,
    /// The file exists but holds nothing
    Empty,
    /// Tokens (and engine state) were restored
    Loaded(usize),
}

/// How well the session matched the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSimilarity {
    /// Nothing cached
    None,
    /// The prompt was empty and the session supplied it
    FullFromSession,
    /// Every prompt token is cached
    Exact,
    /// Less than half of the prompt is cached
    Low,
    /// Between half and all of the prompt is cached
    Partial,
}

/// Token mirror of a session file
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    path: Option<PathBuf>,
    tokens: Vec<Token>,
    read_only: bool,
}

/// Length of the longest common prefix of `session` and `prompt`
pub fn match_prefix(session: &[Token], prompt: &[Token]) -> usize {
    session
        .iter()
        .zip(prompt)
        .take_while(|(s, p)| s == p)
        .count()
}

impl SessionCache {
    /// A cache with no backing file; appends and persists are no-ops
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Loads the session file at `path`.
    ///
    /// An absent or empty file is a cold start. A file that exists but cannot
    /// be read back by the engine is an error.
    pub fn load<B: InferenceBackend>(
        backend: &mut B,
        path: &Path,
        read_only: bool,
    ) -> Result<(Self, SessionLoad), BackendError> {
        let mut cache = Self {
            path: Some(path.to_path_buf()),
            tokens: Vec::new(),
            read_only,
        };

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((cache, SessionLoad::Absent)),
            Err(e) => return Err(BackendError::Session(e.to_string())),
        };

        if metadata.len() == 0 {
            return Ok((cache, SessionLoad::Empty));
        }

        let capacity = backend.n_ctx();
        cache.tokens = backend.load_session(path, capacity)?;
        let loaded = cache.tokens.len();
        Ok((cache, SessionLoad::Loaded(loaded)))
    }

    /// A cache backed by `path` whose engine state was restored from
    /// elsewhere. The file is not read.
    pub fn seeded(path: &Path, read_only: bool, tokens: &[Token]) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            tokens: tokens.to_vec(),
            read_only,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Matches the cache against the prompt and drops what no longer applies.
    ///
    /// Engine positions past the match are invalidated. When the whole prompt
    /// is cached and the session continues beyond it, the cache is cut to
    /// `prompt.len() - 1` so the last prompt token is evaluated again and its
    /// logits are fresh. Returns the matched length.
    pub fn reconcile<B: InferenceBackend>(&mut self, backend: &mut B, prompt: &[Token]) -> usize {
        if self.tokens.is_empty() {
            return 0;
        }

        let matched = match_prefix(&self.tokens, prompt);
        backend.truncate_cache(matched);

        if !prompt.is_empty() && matched == prompt.len() && self.tokens.len() > prompt.len() {
            tracing::debug!(
                "Session covers the whole prompt, re-evaluating last token (cache {} -> {})",
                self.tokens.len(),
                prompt.len() - 1
            );
            self.tokens.truncate(prompt.len() - 1);
        } else {
            self.tokens.truncate(matched);
        }
        matched
    }

    /// Classifies a match for diagnostics
    pub fn similarity(matched: usize, prompt_len: usize, prompt_was_empty: bool) -> SessionSimilarity {
        if prompt_was_empty && matched == prompt_len {
            SessionSimilarity::FullFromSession
        } else if matched >= prompt_len {
            SessionSimilarity::Exact
        } else if matched < prompt_len / 2 {
            SessionSimilarity::Low
        } else {
            SessionSimilarity::Partial
        }
    }

    /// Skips leading tokens of `batch` that the session already covers,
    /// advancing `n_past` for each. A mismatch truncates the cache there.
    /// Returns how many tokens were removed from the batch.
    pub fn splice(&mut self, batch: &mut Vec<Token>, state: &mut GenerationState) -> usize {
        if state.n_session_consumed >= self.tokens.len() {
            return 0;
        }

        let mut i = 0;
        while i < batch.len() {
            if batch[i] != self.tokens[state.n_session_consumed] {
                self.tokens.truncate(state.n_session_consumed);
                break;
            }

            state.n_past += 1;
            state.n_session_consumed += 1;
            i += 1;

            if state.n_session_consumed >= self.tokens.len() {
                break;
            }
        }

        batch.drain(..i);
        i
    }

    /// Records freshly evaluated tokens
    pub fn append(&mut self, evaluated: &[Token], state: &mut GenerationState) {
        if self.path.is_none() || evaluated.is_empty() {
            return;
        }
        self.tokens.extend_from_slice(evaluated);
        state.n_session_consumed = self.tokens.len();
    }

    /// Writes the mirror and engine state to the session file
    pub fn persist<B: InferenceBackend>(&self, backend: &B) -> Result<bool, BackendError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        if self.read_only {
            return Ok(false);
        }
        backend.save_session(path, &self.tokens)?;
        tracing::debug!("Saved session to {} ({} tokens)", path.display(), self.tokens.len());
        Ok(true)
    }
}
