//! Loop-local generation counters

use crate::inference::backend::Token;

/// Tokens reserved at the end of the context window
pub const CONTEXT_SAFETY_MARGIN: usize = 4;

/// Counters for one generation call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationState {
    /// Tokens evaluated (or reused) on the primary stream
    pub n_past: usize,
    /// Tokens moved from the pending input into evaluation
    pub n_consumed: usize,
    /// Leading session tokens matched so far
    pub n_session_consumed: usize,
    /// Position of the guidance stream
    pub n_past_guidance: usize,
    /// Remaining sampling budget; negative means unbounded
    pub n_remain: i64,
}

impl GenerationState {
    pub fn new(n_predict: i32) -> Self {
        Self {
            n_remain: n_predict as i64,
            ..Self::default()
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.n_remain == 0
    }

    pub fn spend(&mut self) {
        if self.n_remain > 0 {
            self.n_remain -= 1;
        }
    }
}

/// Largest evaluation buffer that fits the context window
pub fn max_batch_len(n_ctx: usize) -> usize {
    n_ctx.saturating_sub(CONTEXT_SAFETY_MARGIN)
}

/// Cuts `batch` down to the context window minus the safety margin by
/// dropping tokens from the front. Returns how many were dropped.
pub fn truncate_to_window(batch: &mut Vec<Token>, n_ctx: usize) -> usize {
    let max = max_batch_len(n_ctx);
    if batch.len() <= max {
        return 0;
    }
    let skipped = batch.len() - max;
    batch.drain(..skipped);
    skipped
}
