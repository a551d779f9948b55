//! Stop-condition detection
//!
//! Antiprompts end generation when they show up at the tail of the output,
//! either as text or, for antiprompts that tokenize to a single token, as the
//! last sampled token id.

use crate::inference::backend::{BackendError, InferenceBackend, Token};

/// Number of trailing history tokens decoded for the substring check
pub const TAIL_TOKENS: usize = 32;

/// Extra characters tolerated after an antiprompt at the tail of the output
pub const LOOKBACK_PADDING: usize = 2;

/// Why the stop detector fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopMatch {
    /// The antiprompt text was found in the tail window
    Text(String),
    /// The last sampled token is a single-token antiprompt
    Token(Token),
}

#[derive(Debug, Clone)]
struct Antiprompt {
    text: String,
    /// Set only when the antiprompt tokenizes to exactly one token
    single_token: Option<Token>,
}

/// Matches configured antiprompts against the generation tail
#[derive(Debug, Clone, Default)]
pub struct StopDetector {
    antiprompts: Vec<Antiprompt>,
}

impl StopDetector {
    /// Tokenizes each antiprompt (without BOS) to find single-token forms.
    /// Empty antiprompts are ignored.
    pub fn new<B: InferenceBackend>(backend: &B, antiprompts: &[String]) -> Result<Self, BackendError> {
        let mut detector = Self::default();
        for text in antiprompts.iter().filter(|a| !a.is_empty()) {
            let ids = backend.tokenize(text, false, true)?;
            let single_token = match ids.as_slice() {
                [id] => Some(*id),
                _ => None,
            };
            detector.antiprompts.push(Antiprompt {
                text: text.clone(),
                single_token,
            });
        }
        Ok(detector)
    }

    pub fn is_empty(&self) -> bool {
        self.antiprompts.is_empty()
    }

    /// Checks the decoded tail and the last sampled token
    pub fn check(&self, tail: &str, last_token: Option<Token>) -> Option<StopMatch> {
        if let Some(text) = self.match_text(tail) {
            return Some(StopMatch::Text(text.to_string()));
        }
        last_token
            .filter(|t| self.match_token(*t))
            .map(StopMatch::Token)
    }

    /// Searches the last `len + LOOKBACK_PADDING` bytes of `tail` for each antiprompt
    pub fn match_text(&self, tail: &str) -> Option<&str> {
        let haystack = tail.as_bytes();
        self.antiprompts
            .iter()
            .map(|a| a.text.as_str())
            .find(|needle| {
                let needle = needle.as_bytes();
                let start = haystack.len().saturating_sub(needle.len() + LOOKBACK_PADDING);
                haystack[start..].windows(needle.len()).any(|w| w == needle)
            })
    }

    pub fn match_token(&self, token: Token) -> bool {
        self.antiprompts.iter().any(|a| a.single_token == Some(token))
    }
}
