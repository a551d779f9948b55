//! Scripted inference backend for unit tests
//!
//! Tokenizes by character unless a word is registered, samples from a fixed
//! script, and models the positional cache as a plain token vector so tests
//! can check exactly what was evaluated and where.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use crate::generation::params::SamplingParams;
use crate::inference::backend::{BackendError, InferenceBackend, StreamId, Timings, Token};

pub const BOS: Token = 1;
pub const EOS: Token = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub stream: StreamId,
    pub tokens: Vec<Token>,
    pub start: usize,
}

pub struct MockBackend {
    pub n_ctx: usize,
    pub n_ctx_train: usize,
    vocab: HashMap<String, Vec<Token>>,
    pieces: HashMap<Token, String>,
    script: VecDeque<Token>,
    pub kv: Vec<Token>,
    pub guidance_kv: Option<Vec<Token>>,
    pub evaluations: Vec<Evaluation>,
    pub tokenized: RefCell<Vec<String>>,
    pub accepted: Vec<(Token, bool)>,
    pub samples: Vec<bool>,
    pub sampler_params: Option<SamplingParams>,
    pub sampler_live: bool,
    pub guidance_opened: usize,
    pub restored: usize,
    pub fail_primary_after: Option<usize>,
    pub fail_guidance: bool,
    pub fail_restore: bool,
    primary_calls: usize,
    timings: Timings,
}

impl MockBackend {
    pub fn new(n_ctx: usize) -> Self {
        let mut pieces = HashMap::new();
        pieces.insert(BOS, "<s>".to_string());
        pieces.insert(EOS, "</s>".to_string());
        Self {
            n_ctx,
            n_ctx_train: 4096,
            vocab: HashMap::new(),
            pieces,
            script: VecDeque::new(),
            kv: Vec::new(),
            guidance_kv: None,
            evaluations: Vec::new(),
            tokenized: RefCell::new(Vec::new()),
            accepted: Vec::new(),
            samples: Vec::new(),
            sampler_params: None,
            sampler_live: false,
            guidance_opened: 0,
            restored: 0,
            fail_primary_after: None,
            fail_guidance: false,
            fail_restore: false,
            primary_calls: 0,
            timings: Timings::default(),
        }
    }

    /// Registers a whole-text tokenization and the piece for a single token
    pub fn with_word(mut self, text: &str, ids: &[Token]) -> Self {
        self.vocab.insert(text.to_string(), ids.to_vec());
        if ids.len() == 1 {
            self.pieces.insert(ids[0], text.to_string());
        }
        self
    }

    /// Queues tokens returned by successive `sample` calls
    pub fn with_script(mut self, tokens: &[Token]) -> Self {
        self.script = tokens.iter().copied().collect();
        self
    }

    /// Queues one token per character of `text`
    pub fn with_script_text(self, text: &str) -> Self {
        let tokens: Vec<Token> = text.chars().map(|c| c as Token).collect();
        self.with_script(&tokens)
    }

    pub fn refill_script_text(&mut self, text: &str) {
        self.script = text.chars().map(|c| c as Token).collect();
    }

    pub fn primary_evaluations(&self) -> Vec<&Evaluation> {
        self.evaluations
            .iter()
            .filter(|e| e.stream == StreamId::Primary)
            .collect()
    }

    pub fn guidance_evaluations(&self) -> Vec<&Evaluation> {
        self.evaluations
            .iter()
            .filter(|e| e.stream == StreamId::Guidance)
            .collect()
    }

    /// Clears per-call bookkeeping while keeping the cache contents
    pub fn reset_log(&mut self) {
        self.evaluations.clear();
        self.tokenized.borrow_mut().clear();
        self.accepted.clear();
        self.samples.clear();
        self.restored = 0;
        self.primary_calls = 0;
    }
}

impl InferenceBackend for MockBackend {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_ctx_train(&self) -> usize {
        self.n_ctx_train
    }

    fn add_bos(&self) -> bool {
        true
    }

    fn bos_token(&self) -> Token {
        BOS
    }

    fn tokenize(&self, text: &str, add_bos: bool, _special: bool) -> Result<Vec<Token>, BackendError> {
        self.tokenized.borrow_mut().push(text.to_string());
        let mut tokens = if add_bos { vec![BOS] } else { Vec::new() };
        match self.vocab.get(text) {
            Some(ids) => tokens.extend_from_slice(ids),
            None => tokens.extend(text.chars().map(|c| c as Token)),
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Result<Vec<u8>, BackendError> {
        if token == BOS || token == EOS {
            return Ok(if special {
                self.pieces[&token].clone().into_bytes()
            } else {
                Vec::new()
            });
        }
        if let Some(piece) = self.pieces.get(&token) {
            return Ok(piece.clone().into_bytes());
        }
        char::from_u32(token as u32)
            .map(|c| c.to_string().into_bytes())
            .ok_or_else(|| BackendError::Detokenize {
                token,
                message: "not a character".to_string(),
            })
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOS
    }

    fn clear_cache(&mut self) {
        self.kv.clear();
    }

    fn truncate_cache(&mut self, from: usize) {
        self.kv.truncate(from);
    }

    fn open_guidance(&mut self) -> Result<(), BackendError> {
        self.guidance_opened += 1;
        self.guidance_kv = Some(Vec::new());
        Ok(())
    }

    fn close_guidance(&mut self) {
        self.guidance_kv = None;
    }

    fn evaluate(&mut self, tokens: &[Token], start: usize, stream: StreamId) -> Result<(), BackendError> {
        self.evaluations.push(Evaluation {
            stream,
            tokens: tokens.to_vec(),
            start,
        });
        let fail = |message: &str| BackendError::Decode {
            stream,
            position: start,
            message: message.to_string(),
        };
        let cache = match stream {
            StreamId::Primary => {
                if let Some(limit) = self.fail_primary_after {
                    if self.primary_calls >= limit {
                        return Err(fail("injected failure"));
                    }
                }
                self.primary_calls += 1;
                &mut self.kv
            }
            StreamId::Guidance => {
                if self.fail_guidance {
                    return Err(fail("injected failure"));
                }
                self.guidance_kv
                    .as_mut()
                    .ok_or_else(|| BackendError::GuidanceUnavailable("not opened".to_string()))?
            }
        };
        if start > cache.len() {
            return Err(fail("position gap"));
        }
        if start + tokens.len() > self.n_ctx {
            return Err(fail("context full"));
        }
        cache.truncate(start);
        cache.extend_from_slice(tokens);
        if stream == StreamId::Primary {
            self.timings.record_decode(tokens.len(), Duration::ZERO);
        }
        Ok(())
    }

    fn init_sampler(&mut self, params: &SamplingParams) -> Result<(), BackendError> {
        self.sampler_params = Some(params.clone());
        self.sampler_live = true;
        Ok(())
    }

    fn sample(&mut self, use_guidance: bool) -> Result<Token, BackendError> {
        if !self.sampler_live {
            return Err(BackendError::Sample("sampler not initialized".to_string()));
        }
        self.samples.push(use_guidance);
        self.timings.record_sample(Duration::ZERO);
        Ok(self.script.pop_front().unwrap_or(EOS))
    }

    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.accepted.push((token, apply_grammar));
    }

    fn free_sampler(&mut self) {
        self.sampler_live = false;
    }

    fn state_size(&self) -> usize {
        self.kv.len() * 4
    }

    fn capture_state(&self) -> Result<Vec<u8>, BackendError> {
        Ok(self.kv.iter().flat_map(|t| t.to_le_bytes()).collect())
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        if self.fail_restore || state.len() % 4 != 0 {
            return Err(BackendError::State("bad snapshot".to_string()));
        }
        self.kv = state
            .chunks_exact(4)
            .map(|c| Token::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.restored += 1;
        Ok(())
    }

    fn load_session(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError> {
        let bytes = std::fs::read(path).map_err(|e| BackendError::Session(e.to_string()))?;
        let tokens: Vec<Token> =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Session(e.to_string()))?;
        if tokens.len() > capacity {
            return Err(BackendError::Session("token count exceeds capacity".to_string()));
        }
        self.kv = tokens.clone();
        Ok(tokens)
    }

    fn save_session(&self, path: &Path, tokens: &[Token]) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(tokens).map_err(|e| BackendError::Session(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| BackendError::Session(e.to_string()))
    }

    fn reset_timings(&mut self) {
        self.timings = Timings::default();
    }

    fn timings(&self) -> Timings {
        self.timings
    }
}
