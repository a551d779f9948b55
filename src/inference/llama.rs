//! llama.cpp implementation of [`InferenceBackend`]
//!
//! A context is created per generation call on the worker thread that owns
//! the model. Only the last token of each evaluated chunk requests logits, so
//! `get_logits` always refers to the most recent evaluation.

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::data::LlamaTokenData;
use llama_cpp_2::token::data_array::LlamaTokenDataArray;
use llama_cpp_2::token::LlamaToken;

use crate::generation::guidance::blend_guidance_logits;
use crate::generation::params::{GenerationRequest, SamplingParams};
use crate::inference::backend::{BackendError, InferenceBackend, StreamId, Timings, Token};
use crate::inference::engine::EngineError;

/// Context sizing shared by the primary and guidance contexts
#[derive(Debug, Clone, Copy)]
struct ContextOptions {
    n_ctx: u32,
    n_batch: u32,
    n_threads: i32,
    n_threads_batch: i32,
}

impl ContextOptions {
    fn from_request(request: &GenerationRequest) -> Self {
        Self {
            n_ctx: request.n_ctx,
            n_batch: request.n_batch,
            n_threads: request.n_threads,
            n_threads_batch: request.threads_batch(),
        }
    }

    fn params(&self) -> LlamaContextParams {
        LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_batch(self.n_batch)
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads_batch)
    }
}

struct SamplerState {
    chain: LlamaSampler,
    grammar: Option<LlamaSampler>,
    cfg_scale: f32,
    ignore_eos: bool,
}

/// Engine adapter over one llama.cpp context (plus an optional guidance context)
pub struct LlamaCppBackend<'a> {
    backend: &'a LlamaBackend,
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    guidance: Option<LlamaContext<'a>>,
    guidance_ready: bool,
    options: ContextOptions,
    sampler: Option<SamplerState>,
    timings: Timings,
}

impl<'a> LlamaCppBackend<'a> {
    /// Creates the primary context sized for `request`
    pub fn new(
        backend: &'a LlamaBackend,
        model: &'a LlamaModel,
        request: &GenerationRequest,
    ) -> Result<Self, EngineError> {
        let options = ContextOptions::from_request(request);
        let ctx = model
            .new_context(backend, options.params())
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        tracing::debug!(
            "Created context (n_ctx = {}, n_batch = {}, threads = {}/{})",
            ctx.n_ctx(),
            options.n_batch,
            options.n_threads,
            options.n_threads_batch
        );

        Ok(Self {
            backend,
            model,
            ctx,
            guidance: None,
            guidance_ready: false,
            options,
            sampler: None,
            timings: Timings::default(),
        })
    }

    fn build_chain(&self, params: &SamplingParams) -> LlamaSampler {
        let penalty_last_n = if params.penalty_last_n < 0 {
            self.n_ctx() as i32
        } else {
            params.penalty_last_n
        };

        let mut samplers = vec![LlamaSampler::penalties(
            penalty_last_n,
            params.penalty_repeat,
            params.penalty_freq,
            params.penalty_present,
        )];

        if params.temp <= 0.0 {
            samplers.push(LlamaSampler::greedy());
        } else if params.mirostat == 1 {
            samplers.push(LlamaSampler::temp(params.temp));
            samplers.push(LlamaSampler::mirostat(
                self.model.n_vocab(),
                params.seed,
                params.mirostat_tau,
                params.mirostat_eta,
                100,
            ));
        } else if params.mirostat == 2 {
            samplers.push(LlamaSampler::temp(params.temp));
            samplers.push(LlamaSampler::mirostat_v2(
                params.seed,
                params.mirostat_tau,
                params.mirostat_eta,
            ));
        } else {
            if params.top_k > 0 {
                samplers.push(LlamaSampler::top_k(params.top_k));
            }
            samplers.push(LlamaSampler::typical(params.typical_p, 1));
            samplers.push(LlamaSampler::top_p(params.top_p, 1));
            samplers.push(LlamaSampler::min_p(params.min_p, 1));
            samplers.push(LlamaSampler::temp_ext(
                params.temp,
                params.dynatemp_range,
                params.dynatemp_exponent,
            ));
            samplers.push(LlamaSampler::dist(params.seed));
        }

        LlamaSampler::chain_simple(samplers)
    }

    fn context_for(&mut self, stream: StreamId) -> Result<&mut LlamaContext<'a>, BackendError> {
        match stream {
            StreamId::Primary => Ok(&mut self.ctx),
            StreamId::Guidance => self
                .guidance
                .as_mut()
                .ok_or_else(|| BackendError::GuidanceUnavailable("not opened".to_string())),
        }
    }
}

impl InferenceBackend for LlamaCppBackend<'_> {
    fn n_ctx(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn n_ctx_train(&self) -> usize {
        self.model.n_ctx_train() as usize
    }

    fn add_bos(&self) -> bool {
        true
    }

    fn bos_token(&self) -> Token {
        self.model.token_bos().0
    }

    fn tokenize(&self, text: &str, add_bos: bool, _special: bool) -> Result<Vec<Token>, BackendError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Result<Vec<u8>, BackendError> {
        let special = if special { Special::Tokenize } else { Special::Plaintext };
        self.model
            .token_to_bytes(LlamaToken::new(token), special)
            .map_err(|e| BackendError::Detokenize {
                token,
                message: e.to_string(),
            })
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn clear_cache(&mut self) {
        self.ctx.clear_kv_cache();
    }

    fn truncate_cache(&mut self, from: usize) {
        if let Err(e) = self.ctx.clear_kv_cache_seq(None, Some(from as u32), None) {
            tracing::warn!("Failed to truncate KV cache at {}: {}", from, e);
        }
    }

    fn open_guidance(&mut self) -> Result<(), BackendError> {
        let ctx = self
            .model
            .new_context(self.backend, self.options.params())
            .map_err(|e| BackendError::GuidanceUnavailable(e.to_string()))?;
        self.guidance = Some(ctx);
        self.guidance_ready = false;
        Ok(())
    }

    fn close_guidance(&mut self) {
        self.guidance = None;
        self.guidance_ready = false;
    }

    fn evaluate(&mut self, tokens: &[Token], start: usize, stream: StreamId) -> Result<(), BackendError> {
        if tokens.is_empty() {
            return Ok(());
        }

        let decode_error = |message: String| BackendError::Decode {
            stream,
            position: start,
            message,
        };

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken::new(*token), (start + i) as i32, &[0], i == last)
                .map_err(|e| decode_error(e.to_string()))?;
        }

        let started = Instant::now();
        self.context_for(stream)?
            .decode(&mut batch)
            .map_err(|e| decode_error(e.to_string()))?;

        match stream {
            StreamId::Primary => self.timings.record_decode(tokens.len(), started.elapsed()),
            StreamId::Guidance => self.guidance_ready = true,
        }
        Ok(())
    }

    fn init_sampler(&mut self, params: &SamplingParams) -> Result<(), BackendError> {
        let grammar = match params.grammar.as_deref() {
            Some(grammar) => Some(
                LlamaSampler::grammar(self.model, grammar, "root")
                    .map_err(|e| BackendError::Sample(format!("invalid grammar: {}", e)))?,
            ),
            None => None,
        };

        self.sampler = Some(SamplerState {
            chain: self.build_chain(params),
            grammar,
            cfg_scale: params.cfg_scale,
            ignore_eos: params.ignore_eos,
        });
        Ok(())
    }

    fn sample(&mut self, use_guidance: bool) -> Result<Token, BackendError> {
        let started = Instant::now();
        let sampler = self
            .sampler
            .as_ref()
            .ok_or_else(|| BackendError::Sample("sampler not initialized".to_string()))?;

        let n_vocab = self.model.n_vocab().max(0) as usize;
        let mut logits = self.ctx.get_logits().to_vec();
        logits.truncate(n_vocab);

        if use_guidance {
            match self.guidance.as_ref().filter(|_| self.guidance_ready) {
                Some(guidance) => blend_guidance_logits(&mut logits, guidance.get_logits(), sampler.cfg_scale),
                None => tracing::debug!("No guidance logits yet, sampling unguided"),
            }
        }

        if sampler.ignore_eos {
            let eos = self.model.token_eos().0 as usize;
            if let Some(logit) = logits.get_mut(eos) {
                *logit = f32::NEG_INFINITY;
            }
        }

        let mut candidates = LlamaTokenDataArray::from_iter(
            logits
                .iter()
                .enumerate()
                .map(|(id, logit)| LlamaTokenData::new(LlamaToken::new(id as i32), *logit, 0.0)),
            false,
        );

        if let Some(grammar) = &sampler.grammar {
            candidates.apply_sampler(grammar);
        }
        candidates.apply_sampler(&sampler.chain);

        let token = candidates
            .selected_token()
            .ok_or_else(|| BackendError::Sample("no token selected".to_string()))?;

        self.timings.record_sample(started.elapsed());
        Ok(token.0)
    }

    fn accept(&mut self, token: Token, apply_grammar: bool) {
        let Some(sampler) = self.sampler.as_mut() else {
            return;
        };
        let token = LlamaToken::new(token);
        if apply_grammar {
            if let Some(grammar) = sampler.grammar.as_mut() {
                grammar.accept(token);
            }
        }
        sampler.chain.accept(token);
    }

    fn free_sampler(&mut self) {
        self.sampler = None;
    }

    fn state_size(&self) -> usize {
        self.ctx.get_state_size()
    }

    fn capture_state(&self) -> Result<Vec<u8>, BackendError> {
        let mut state = vec![0u8; self.ctx.get_state_size()];
        // SAFETY: the buffer is sized by llama.cpp for this context
        let written = unsafe { self.ctx.copy_state_data(state.as_mut_ptr()) };
        if written == 0 {
            return Err(BackendError::State("llama.cpp wrote no state".to_string()));
        }
        state.truncate(written);
        Ok(state)
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), BackendError> {
        // SAFETY: the snapshot was captured from a context of the same model
        let read = unsafe { self.ctx.set_state_data(state) };
        if read == 0 {
            return Err(BackendError::State("llama.cpp rejected the snapshot".to_string()));
        }
        Ok(())
    }

    fn load_session(&mut self, path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError> {
        self.ctx
            .load_session_file(path, capacity)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| BackendError::Session(e.to_string()))
    }

    fn save_session(&self, path: &Path, tokens: &[Token]) -> Result<(), BackendError> {
        let tokens: Vec<LlamaToken> = tokens.iter().copied().map(LlamaToken::new).collect();
        self.ctx
            .save_session_file(path, &tokens)
            .map_err(|e| BackendError::Session(e.to_string()))
    }

    fn reset_timings(&mut self) {
        self.timings = Timings::default();
    }

    fn timings(&self) -> Timings {
        self.timings
    }
}
