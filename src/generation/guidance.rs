//! Classifier-free guidance stream
//!
//! The guidance stream replays the primary stream with the negative prompt in
//! place of the original prompt. Its first evaluation feeds the negative prompt
//! tokens plus whatever the primary batch holds past the original prompt;
//! after that it mirrors each primary batch.

use crate::generation::state::GenerationState;
use crate::inference::backend::{BackendError, InferenceBackend, StreamId, Token};

#[derive(Debug, Clone)]
pub struct GuidanceDriver {
    tokens: Vec<Token>,
    original_prompt_len: usize,
}

impl GuidanceDriver {
    /// Opens the guidance stream and tokenizes the negative prompt with BOS.
    ///
    /// `original_prompt_len` is the token count of the primary prompt,
    /// BOS included.
    pub fn open<B: InferenceBackend>(
        backend: &mut B,
        negative_prompt: &str,
        original_prompt_len: usize,
    ) -> Result<Self, BackendError> {
        backend.open_guidance()?;

        let tokens = backend.tokenize(negative_prompt, true, true)?;
        tracing::debug!(
            "Guidance prompt: {} tokens, original prompt: {} tokens",
            tokens.len(),
            original_prompt_len
        );

        Ok(Self {
            tokens,
            original_prompt_len,
        })
    }

    /// Builds the guidance input for this primary batch
    pub fn input(&self, batch: &[Token], n_past_guidance: usize) -> Vec<Token> {
        if n_past_guidance < self.tokens.len() {
            let mut input = self.tokens[n_past_guidance..].to_vec();
            if batch.len() > self.original_prompt_len {
                input.extend_from_slice(&batch[self.original_prompt_len..]);
            }
            input
        } else {
            batch.to_vec()
        }
    }

    /// Evaluates the guidance input for `batch` in chunks of `n_batch`
    pub fn advance<B: InferenceBackend>(
        &self,
        backend: &mut B,
        batch: &[Token],
        n_batch: usize,
        state: &mut GenerationState,
    ) -> Result<(), BackendError> {
        let input = self.input(batch, state.n_past_guidance);
        for chunk in input.chunks(n_batch.max(1)) {
            backend.evaluate(chunk, state.n_past_guidance, StreamId::Guidance)?;
            state.n_past_guidance += chunk.len();
        }
        Ok(())
    }

    pub fn close<B: InferenceBackend>(self, backend: &mut B) {
        backend.close_guidance();
    }
}

/// Blends primary logits with guidance logits in place.
///
/// Both are normalized with log-softmax first, then
/// `l = g + scale * (l - g)`.
pub fn blend_guidance_logits(logits: &mut [f32], guidance: &[f32], scale: f32) {
    log_softmax(logits);
    let mut guidance = guidance.to_vec();
    log_softmax(&mut guidance);

    for (l, g) in logits.iter_mut().zip(guidance) {
        *l = g + scale * (*l - g);
    }
}

fn log_softmax(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    let log_sum = sum.ln();
    for l in logits.iter_mut() {
        *l = *l - max - log_sum;
    }
}
