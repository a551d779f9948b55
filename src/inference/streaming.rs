//! Streaming output
//!
//! Generated text reaches the host as UTF-8 fragments, followed by a single
//! terminal `Done` or `Error`.

/// One message on a generation stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation failed; the message describes why
    Error(String),
}

impl StreamToken {
    /// True for `Done` and `Error`; nothing follows these
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamToken::Done | StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// Buffers token bytes until they form complete UTF-8 characters.
///
/// Token pieces can end in the middle of a multibyte sequence; only the
/// longest valid prefix is released, the incomplete suffix waits for the
/// next piece.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bytes and returns whatever text is now complete
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let valid_len = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => {
                // Invalid bytes, not a truncated tail
                if e.error_len().is_some() {
                    let text = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    return Some(text);
                }
                e.valid_up_to()
            }
        };

        if valid_len == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid_len);
        let text = String::from_utf8(std::mem::replace(&mut self.pending, rest)).ok()?;
        Some(text)
    }

    /// Releases anything still buffered at end of generation
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
