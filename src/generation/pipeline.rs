//! Incremental generation loop
//!
//! Turns a prompt into sampled tokens while reusing as much earlier work as
//! possible: an in-memory snapshot of an identical prompt, or the longest
//! cached prefix from a session file.
//!
//! Each iteration either drains up to one batch of pending prompt tokens or
//! samples one new token. Whatever was queued in the previous iteration is
//! evaluated first, so evaluation only ever covers tokens consumed by the
//! iteration right before it.

use std::sync::mpsc::Sender;

use crate::generation::guidance::GuidanceDriver;
use crate::generation::params::{GenerationRequest, SamplingParams};
use crate::generation::prompt_cache::{PromptCache, ReuseDecision};
use crate::generation::result::{FinishReason, GenerateError, PredictResult};
use crate::generation::sampling::SamplingContext;
use crate::generation::session::{SessionCache, SessionLoad, SessionSimilarity};
use crate::generation::state::{max_batch_len, truncate_to_window, GenerationState};
use crate::generation::stop::{StopDetector, TAIL_TOKENS};
use crate::inference::backend::{InferenceBackend, StreamId, Timings, Token};
use crate::inference::streaming::{StreamToken, Utf8Accumulator};

/// Output of a generation that ran to completion
#[derive(Debug, Default)]
struct Generated {
    bytes: Vec<u8>,
    tokens: Vec<Token>,
    dropped_tokens: usize,
    finish: Option<FinishReason>,
}

/// Runs one generation call against `backend`.
///
/// `prompt_cache` is the handle returned by the previous call on the same
/// conversation, if any. It is handed back in the result on every path.
/// Generated text is streamed through `sink` as it becomes valid UTF-8.
pub fn predict<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    prompt_cache: Option<PromptCache>,
    sink: Option<&Sender<StreamToken>>,
) -> PredictResult {
    backend.clear_cache();
    backend.reset_timings();
    let t_start_ms = Timings::now_ms();

    let n_ctx = backend.n_ctx();
    let n_ctx_train = backend.n_ctx_train();
    if n_ctx > n_ctx_train {
        tracing::warn!(
            "Model was trained on only {} context tokens ({} specified)",
            n_ctx_train,
            n_ctx
        );
    }

    let (mut cache, decision) = PromptCache::lookup(prompt_cache, &request.prompt, request.prompt_cache_all);

    match run(backend, request, &mut cache, decision, sink) {
        Ok(generated) => {
            let text = String::from_utf8_lossy(&generated.bytes).into_owned();
            let mut timings = backend.timings();
            timings.stamp(t_start_ms);
            tracing::info!(
                "Generated {} tokens (prompt eval {} tokens in {:.2} ms, eval {} tokens in {:.2} ms)",
                generated.tokens.len(),
                timings.n_p_eval,
                timings.t_p_eval_ms,
                timings.n_eval,
                timings.t_eval_ms
            );
            PredictResult {
                outcome: Ok(generated.finish.unwrap_or(FinishReason::Budget)),
                text,
                tokens: generated.tokens,
                prompt_cache: cache,
                timings,
                dropped_tokens: generated.dropped_tokens,
            }
        }
        Err(error) => {
            tracing::error!("Generation failed: {}", error);
            let timings = match error {
                GenerateError::SessionLoadCorrupt { .. } | GenerateError::PromptTooLong { .. } => {
                    Timings::default()
                }
                _ => {
                    let mut timings = backend.timings();
                    timings.stamp(t_start_ms);
                    timings
                }
            };
            PredictResult::failed(error, cache, timings)
        }
    }
}

fn run<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    cache: &mut PromptCache,
    decision: ReuseDecision,
    sink: Option<&Sender<StreamToken>>,
) -> Result<Generated, GenerateError> {
    let mut state = GenerationState::new(request.n_predict);

    let reuse = match decision {
        ReuseDecision::Reuse => match cache.restore(backend) {
            Ok(n_past) => {
                state.n_past = n_past;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to restore prompt state, re-evaluating prompt: {}", e);
                cache.invalidate();
                backend.clear_cache();
                false
            }
        },
        ReuseDecision::Rebuild => false,
    };

    let mut session = open_session(backend, request, cache, reuse)?;
    if reuse {
        state.n_session_consumed = session.len();
    }

    // A restored snapshot skips the prompt loop, so the prompt is replayed
    // into the penalty history and the guidance stream instead
    let primed: Vec<Token> = if reuse {
        cache.processed_prompt_tokens().to_vec()
    } else {
        Vec::new()
    };

    let mut embd_inp = Vec::new();
    let mut prompt_len = primed.len();
    if !reuse {
        if !request.prompt.is_empty() || session.is_empty() {
            embd_inp = backend
                .tokenize(&request.prompt, backend.add_bos(), true)
                .map_err(GenerateError::Tokenization)?;
            if embd_inp.is_empty() {
                embd_inp.push(backend.bos_token());
            }
            prompt_len = embd_inp.len();
        } else {
            tracing::debug!("Using session tokens as prompt");
            embd_inp = session.tokens().to_vec();
            // The empty prompt stands for BOS alone
            prompt_len = 1;
        }
    }
    tracing::debug!("Prompt tokens: {:?}", embd_inp);

    let max = max_batch_len(backend.n_ctx());
    if embd_inp.len() > max {
        return Err(GenerateError::PromptTooLong {
            n_tokens: embd_inp.len(),
            max,
        });
    }

    // The seeded mirror already matches the restored state on reuse
    let mut need_to_save_session = false;
    if !reuse {
        let matched = session.reconcile(backend, &embd_inp);
        if !session.is_empty() || matched > 0 {
            log_similarity(matched, embd_inp.len(), request.prompt.is_empty());
        }
        need_to_save_session = session.is_enabled() && matched < embd_inp.len();
    }

    let stop = StopDetector::new(backend, &request.antiprompts).map_err(GenerateError::Tokenization)?;

    let guidance = if request.sampling.guidance_enabled() {
        let opened = GuidanceDriver::open(backend, &request.negative_prompt, prompt_len).and_then(|driver| {
            if !primed.is_empty() {
                let n_batch = request.n_batch.max(1) as usize;
                driver.advance(backend, &primed, n_batch, &mut state)?;
            }
            Ok(driver)
        });
        match opened {
            Ok(driver) => Some(driver),
            Err(e) => {
                backend.close_guidance();
                return Err(GenerateError::GuidanceEvaluation(e));
            }
        }
    } else {
        None
    };

    let params = resolve_seed(&request.sampling);
    let result = match SamplingContext::init(backend, &params) {
        Ok(mut sampling) => {
            for &token in &primed {
                sampling.accept(backend, token, false);
            }
            let mut ctx = LoopContext {
                request,
                cache,
                session: &mut session,
                guidance: guidance.as_ref(),
                stop: &stop,
                sink,
                need_to_save_session,
                need_to_save_state: request.prompt_cache_all && !reuse,
            };
            let result = ctx.drive(backend, &mut sampling, embd_inp, &mut state);
            sampling.free(backend);
            result
        }
        Err(e) => Err(GenerateError::Sampling(e)),
    };

    if let Some(driver) = guidance {
        driver.close(backend);
    }

    let generated = result?;

    if let Err(e) = session.persist(backend) {
        tracing::warn!("Failed to save final session: {}", e);
    }

    Ok(generated)
}

/// Loads the session file, or seeds the mirror from the restored prompt when
/// the in-memory snapshot is reused (its state supersedes the file's).
fn open_session<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    cache: &PromptCache,
    reuse: bool,
) -> Result<SessionCache, GenerateError> {
    let Some(path) = request.session_path.as_deref() else {
        return Ok(SessionCache::disabled());
    };

    if reuse {
        return Ok(SessionCache::seeded(
            path,
            request.prompt_cache_ro,
            cache.processed_prompt_tokens(),
        ));
    }

    tracing::info!("Attempting to load saved session from {}", path.display());
    let (session, load) = SessionCache::load(backend, path, request.prompt_cache_ro).map_err(|source| {
        GenerateError::SessionLoadCorrupt {
            path: path.to_path_buf(),
            source,
        }
    })?;
    match load {
        SessionLoad::Absent => tracing::info!("Session file {} does not exist, will create", path.display()),
        SessionLoad::Empty => tracing::info!("Session file {} is empty, starting a new session", path.display()),
        SessionLoad::Loaded(n) => tracing::info!("Loaded session {} with {} tokens", path.display(), n),
    }
    Ok(session)
}

fn log_similarity(matched: usize, prompt_len: usize, prompt_was_empty: bool) {
    match SessionCache::similarity(matched, prompt_len, prompt_was_empty) {
        SessionSimilarity::None => {}
        SessionSimilarity::FullFromSession => tracing::info!("Using full prompt from session file"),
        SessionSimilarity::Exact => tracing::info!("Session file has exact match for prompt"),
        SessionSimilarity::Low => tracing::warn!(
            "Session file has low similarity to prompt ({} / {} tokens); will mostly be reevaluated",
            matched,
            prompt_len
        ),
        SessionSimilarity::Partial => {
            tracing::info!("Session file matches {} / {} tokens of prompt", matched, prompt_len)
        }
    }
}

fn resolve_seed(params: &SamplingParams) -> SamplingParams {
    let mut params = params.clone();
    if params.seed == 0 {
        params.seed = rand_seed();
        tracing::info!("Seed == 0, generated seed {}", params.seed);
    }
    params
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// Everything the loop borrows for one call
struct LoopContext<'a> {
    request: &'a GenerationRequest,
    cache: &'a mut PromptCache,
    session: &'a mut SessionCache,
    guidance: Option<&'a GuidanceDriver>,
    stop: &'a StopDetector,
    sink: Option<&'a Sender<StreamToken>>,
    need_to_save_session: bool,
    need_to_save_state: bool,
}

impl LoopContext<'_> {
    fn drive<B: InferenceBackend>(
        &mut self,
        backend: &mut B,
        sampling: &mut SamplingContext,
        embd_inp: Vec<Token>,
        state: &mut GenerationState,
    ) -> Result<Generated, GenerateError> {
        let n_ctx = backend.n_ctx();
        let n_batch = self.request.n_batch.max(1) as usize;
        let mut generated = Generated::default();
        let mut utf8 = Utf8Accumulator::new();
        let mut embd: Vec<Token> = Vec::new();

        while !state.budget_exhausted() {
            if !embd.is_empty() {
                let dropped = truncate_to_window(&mut embd, n_ctx);
                if dropped > 0 {
                    tracing::warn!(
                        "Input too long: skipped {} token{}",
                        dropped,
                        if dropped != 1 { "s" } else { "" }
                    );
                    generated.dropped_tokens += dropped;
                }

                self.session.splice(&mut embd, state);

                if let Some(guidance) = self.guidance {
                    guidance
                        .advance(backend, &embd, n_batch, state)
                        .map_err(GenerateError::GuidanceEvaluation)?;
                    tracing::trace!("n_past_guidance = {}", state.n_past_guidance);
                }

                for chunk in embd.chunks(n_batch) {
                    backend
                        .evaluate(chunk, state.n_past, StreamId::Primary)
                        .map_err(GenerateError::PrimaryEvaluation)?;
                    state.n_past += chunk.len();
                    tracing::trace!("n_past = {} / {}", state.n_past, n_ctx);
                }

                self.session.append(&embd, state);
            }

            embd.clear();
            let mut sampled = None;

            if embd_inp.len() <= state.n_consumed {
                self.checkpoint(backend, &embd_inp);

                let id = sampling
                    .sample(backend, self.guidance.is_some())
                    .map_err(GenerateError::Sampling)?;
                sampling.accept(backend, id, true);
                embd.push(id);
                state.spend();
                sampled = Some(id);

                let piece = backend
                    .token_to_piece(id, self.request.include_specials)
                    .map_err(GenerateError::Tokenization)?;
                generated.tokens.push(id);
                generated.bytes.extend_from_slice(&piece);
                if let Some(tx) = self.sink {
                    if let Some(text) = utf8.push(&piece) {
                        let _ = tx.send(StreamToken::Token(text));
                    }
                }
            } else {
                while embd_inp.len() > state.n_consumed {
                    let token = embd_inp[state.n_consumed];
                    embd.push(token);
                    sampling.accept(backend, token, false);
                    state.n_consumed += 1;
                    if embd.len() >= n_batch {
                        break;
                    }
                }
            }

            if sampled.is_some() && !self.stop.is_empty() {
                let tail = sampling
                    .prev_str(backend, TAIL_TOKENS)
                    .map_err(GenerateError::Tokenization)?;
                if let Some(hit) = self.stop.check(&tail, sampling.last()) {
                    tracing::info!("Found antiprompt {:?}", hit);
                    generated.finish = Some(FinishReason::Antiprompt);
                    break;
                }
            }

            if sampled.is_some_and(|id| backend.is_end_of_generation(id)) {
                tracing::debug!("End of generation token encountered");
                generated.finish = Some(FinishReason::EndOfGeneration);
                break;
            }
        }

        if let (Some(tx), Some(text)) = (self.sink, utf8.flush()) {
            let _ = tx.send(StreamToken::Token(text));
        }

        Ok(generated)
    }

    /// Persists the session and prompt snapshot the first time the loop
    /// reaches sampling, when engine state covers exactly the prompt.
    fn checkpoint<B: InferenceBackend>(&mut self, backend: &B, embd_inp: &[Token]) {
        if self.need_to_save_session {
            self.need_to_save_session = false;
            if let Err(e) = self.session.persist(backend) {
                tracing::warn!("Failed to save session: {}", e);
            }
        }

        if self.need_to_save_state {
            self.need_to_save_state = false;
            tracing::debug!("Saving processed prompt state ({} bytes)", backend.state_size());
            if let Err(e) = self.cache.save(backend, &self.request.prompt, embd_inp) {
                tracing::warn!("Failed to snapshot prompt state: {}", e);
                self.cache.invalidate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{MockBackend, EOS};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn hello_backend(script: &str) -> MockBackend {
        MockBackend::new(64)
            .with_word("Hello", &[15043])
            .with_script_text(script)
    }

    fn request(prompt: &str, n_predict: i32) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt);
        request.n_predict = n_predict;
        request.sampling.seed = 42;
        request
    }

    #[test]
    fn test_hello_end_to_end() {
        let mut backend = hello_backend("abc");
        let result = predict(&mut backend, &request("Hello", 3), None, None);

        assert_eq!(result.status_code(), 0);
        assert_eq!(result.outcome, Ok(FinishReason::Budget));
        assert_eq!(result.text, "abc");
        assert_eq!(result.tokens, vec!['a' as Token, 'b' as Token, 'c' as Token]);
        assert_eq!(backend.samples.len(), 3);

        let evals = backend.primary_evaluations();
        assert_eq!(evals[0].tokens, vec![1, 15043]);
        assert_eq!(evals[0].start, 0);
        assert_eq!(evals.iter().filter(|e| e.tokens == vec![1, 15043]).count(), 1);
        assert_eq!(evals[1].tokens, vec!['a' as Token]);
        assert_eq!(evals[1].start, 2);
        assert_eq!(evals.len(), 3);

        assert_eq!(result.timings.n_p_eval, 2);
        assert_eq!(result.timings.n_sample, 3);
        assert!(result.timings.t_start_ms > 0.0);
        assert!(result.timings.t_end_ms >= result.timings.t_start_ms);
        assert!(!backend.sampler_live);
    }

    #[test]
    fn test_prompt_tokens_accepted_without_grammar() {
        let mut backend = hello_backend("ab");
        predict(&mut backend, &request("Hello", 2), None, None);
        assert_eq!(
            backend.accepted,
            vec![(1, false), (15043, false), ('a' as Token, true), ('b' as Token, true)]
        );
    }

    #[test]
    fn test_zero_budget_returns_immediately() {
        let mut backend = hello_backend("abc");
        let result = predict(&mut backend, &request("Hello", 0), None, None);

        assert!(result.is_success());
        assert_eq!(result.outcome, Ok(FinishReason::Budget));
        assert!(result.text.is_empty());
        assert!(backend.samples.is_empty());
        assert!(backend.evaluations.is_empty());
    }

    #[test]
    fn test_end_of_generation_stops() {
        let mut backend = hello_backend("ab");
        let result = predict(&mut backend, &request("Hello", -1), None, None);

        assert_eq!(result.outcome, Ok(FinishReason::EndOfGeneration));
        assert_eq!(result.tokens, vec!['a' as Token, 'b' as Token, EOS]);
        assert_eq!(result.text, "ab");
    }

    #[test]
    fn test_antiprompt_stops() {
        let mut backend = hello_backend("hi User: more text");
        let mut req = request("Hello", 50);
        req.antiprompts = vec!["User:".to_string()];
        let result = predict(&mut backend, &req, None, None);

        assert_eq!(result.outcome, Ok(FinishReason::Antiprompt));
        assert_eq!(result.text, "hi User:");
    }

    #[test]
    fn test_single_token_antiprompt_stops() {
        let mut backend = MockBackend::new(64)
            .with_word("Hello", &[15043])
            .with_word("<|end|>", &[9000])
            .with_script(&['h' as Token, 9000, 'x' as Token]);
        let mut req = request("Hello", 50);
        req.antiprompts = vec!["<|end|>".to_string()];
        let result = predict(&mut backend, &req, None, None);

        assert_eq!(result.outcome, Ok(FinishReason::Antiprompt));
        assert_eq!(result.tokens, vec!['h' as Token, 9000]);
    }

    #[test]
    fn test_prompt_too_long() {
        let mut backend = MockBackend::new(8).with_script_text("abc");
        let result = predict(&mut backend, &request("abcdefgh", 3), None, None);

        assert_eq!(result.status_code(), 2);
        assert!(matches!(
            result.error(),
            Some(GenerateError::PromptTooLong { n_tokens: 9, max: 4 })
        ));
        assert_eq!(result.timings, Timings::default());
        assert!(backend.evaluations.is_empty());
    }

    #[test]
    fn test_primary_failure_keeps_partial_telemetry() {
        let mut backend = hello_backend("abc");
        backend.fail_primary_after = Some(1);
        let result = predict(&mut backend, &request("Hello", 3), None, None);

        assert_eq!(result.status_code(), 4);
        assert_eq!(result.timings.n_p_eval, 2);
        assert_eq!(result.timings.n_sample, 1);
        assert!(result.timings.t_end_ms >= result.timings.t_start_ms);
        assert!(result.timings.t_start_ms > 0.0);
        assert!(!backend.sampler_live);
    }

    #[test]
    fn test_empty_prompt_evaluates_bos() {
        let mut backend = hello_backend("a");
        let result = predict(&mut backend, &request("", 1), None, None);

        assert!(result.is_success());
        assert_eq!(backend.primary_evaluations()[0].tokens, vec![1]);
    }

    #[test]
    fn test_guidance_runs_in_lockstep() {
        let mut backend = hello_backend("ab");
        let mut req = request("Hello", 2);
        req.sampling.cfg_scale = 2.0;
        req.negative_prompt = "no".to_string();
        let result = predict(&mut backend, &req, None, None);

        assert!(result.is_success());
        assert_eq!(backend.guidance_opened, 1);
        assert!(backend.guidance_kv.is_none());
        assert_eq!(backend.samples, vec![true, true]);

        let evals = backend.guidance_evaluations();
        assert_eq!(evals[0].tokens, vec![1, 'n' as Token, 'o' as Token]);
        assert_eq!(evals[0].start, 0);
        assert_eq!(evals[1].tokens, vec!['a' as Token]);
        assert_eq!(evals[1].start, 3);
    }

    #[test]
    fn test_guidance_failure_releases_resources() {
        let mut backend = hello_backend("ab");
        backend.fail_guidance = true;
        let mut req = request("Hello", 2);
        req.sampling.cfg_scale = 3.0;
        req.negative_prompt = "no".to_string();
        let result = predict(&mut backend, &req, None, None);

        assert_eq!(result.status_code(), 3);
        assert!(backend.guidance_kv.is_none());
        assert!(!backend.sampler_live);
        assert!(backend.primary_evaluations().is_empty());
    }

    #[test]
    fn test_prompt_state_reuse() {
        let mut backend = hello_backend("abc");
        let mut req = request("Hello", 3);
        req.prompt_cache_all = true;

        let first = predict(&mut backend, &req, None, None);
        assert!(first.prompt_cache.has_state());
        assert_eq!(first.prompt_cache.processed_prompt_tokens(), &[1, 15043]);

        backend.reset_log();
        backend.refill_script_text("abc");
        let second = predict(&mut backend, &req, Some(first.prompt_cache), None);

        assert_eq!(second.text, first.text);
        assert_eq!(backend.restored, 1);
        assert!(!backend.tokenized.borrow().contains(&"Hello".to_string()));
        let evals = backend.primary_evaluations();
        assert!(evals.iter().all(|e| e.tokens != vec![1, 15043]));
        assert_eq!(evals[0].tokens, vec!['a' as Token]);
        assert_eq!(evals[0].start, 2);
        assert_eq!(second.timings.n_p_eval, 0);
    }

    #[test]
    fn test_prompt_reuse_replays_guidance_prompt() {
        let mut backend = hello_backend("ab");
        let mut req = request("Hello", 2);
        req.prompt_cache_all = true;
        req.sampling.cfg_scale = 2.0;
        req.negative_prompt = "no".to_string();
        let first = predict(&mut backend, &req, None, None);

        backend.reset_log();
        backend.refill_script_text("ab");
        let second = predict(&mut backend, &req, Some(first.prompt_cache), None);
        assert!(second.is_success());
        assert_eq!(*backend.tokenized.borrow(), vec!["no".to_string()]);

        let evals = backend.guidance_evaluations();
        assert_eq!(evals[0].tokens, vec![1, 'n' as Token, 'o' as Token]);
        assert_eq!(evals[0].start, 0);
        assert_eq!(evals[1].tokens, vec!['a' as Token]);
        assert_eq!(evals[1].start, 3);
    }

    #[test]
    fn test_prompt_reuse_with_session_keeps_restored_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reuse.session");
        let mut req = request("Hello", 3);
        req.prompt_cache_all = true;
        req.session_path = Some(path.clone());

        let mut backend = hello_backend("abc");
        let first = predict(&mut backend, &req, None, None);
        assert!(first.is_success());

        backend.reset_log();
        backend.refill_script_text("abc");
        let second = predict(&mut backend, &req, Some(first.prompt_cache), None);

        assert!(second.is_success());
        assert_eq!(second.text, "abc");
        assert_eq!(backend.restored, 1);
        let evals = backend.primary_evaluations();
        assert_eq!(evals[0].tokens, vec!['a' as Token]);
        assert_eq!(evals[0].start, 2);
        assert_eq!(backend.kv, vec![1, 15043, 'a' as Token, 'b' as Token]);

        // The session keeps the prompt prefix the snapshot covers
        let saved: Vec<Token> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved, vec![1, 15043, 'a' as Token, 'b' as Token]);
    }

    #[test]
    fn test_prompt_change_invalidates_snapshot() {
        let mut backend = hello_backend("abc");
        let mut req = request("Hello", 1);
        req.prompt_cache_all = true;
        let first = predict(&mut backend, &req, None, None);

        let mut other = req.clone();
        other.prompt = "Bye".to_string();
        backend.refill_script_text("x");
        let second = predict(&mut backend, &other, Some(first.prompt_cache), None);
        assert_eq!(second.prompt_cache.last_prompt(), "Bye");

        backend.reset_log();
        backend.refill_script_text("y");
        let third = predict(&mut backend, &req, Some(second.prompt_cache), None);
        assert!(third.is_success());
        assert_eq!(backend.restored, 0);
        assert_eq!(backend.primary_evaluations()[0].tokens, vec![1, 15043]);
        assert_eq!(third.prompt_cache.last_prompt(), "Hello");
    }

    #[test]
    fn test_failed_restore_falls_back_to_rebuild() {
        let mut backend = hello_backend("a");
        let mut req = request("Hello", 1);
        req.prompt_cache_all = true;
        let first = predict(&mut backend, &req, None, None);

        backend.reset_log();
        backend.fail_restore = true;
        backend.refill_script_text("a");
        let second = predict(&mut backend, &req, Some(first.prompt_cache), None);
        assert!(second.is_success());
        assert_eq!(backend.primary_evaluations()[0].tokens, vec![1, 15043]);
    }

    #[test]
    fn test_session_reuse_across_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.session");
        let mut req = request("Hello", 3);
        req.session_path = Some(path.clone());

        let mut backend = hello_backend("abc");
        assert!(predict(&mut backend, &req, None, None).is_success());
        let saved: Vec<Token> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved, vec![1, 15043, 'a' as Token, 'b' as Token]);

        let mut backend = hello_backend("abc");
        let result = predict(&mut backend, &req, None, None);
        assert!(result.is_success());
        assert_eq!(result.text, "abc");

        // Only the last prompt token is re-evaluated
        let evals = backend.primary_evaluations();
        assert_eq!(evals[0].tokens, vec![15043]);
        assert_eq!(evals[0].start, 1);
    }

    #[test]
    fn test_session_saved_on_first_sample() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("first.session");
        let mut req = request("Hello", 3);
        req.session_path = Some(path.clone());

        let mut backend = hello_backend("abc");
        backend.fail_primary_after = Some(1);
        let result = predict(&mut backend, &req, None, None);
        assert_eq!(result.status_code(), 4);

        // The prompt was persisted before the failing evaluation
        let saved: Vec<Token> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved, vec![1, 15043]);
    }

    #[test]
    fn test_corrupt_session_aborts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.session");
        std::fs::write(&path, b"garbage").unwrap();
        let mut req = request("Hello", 3);
        req.session_path = Some(path);

        let mut backend = hello_backend("abc");
        let result = predict(&mut backend, &req, None, None);
        assert_eq!(result.status_code(), 1);
        assert_eq!(result.timings, Timings::default());
        assert!(backend.evaluations.is_empty());
    }

    #[test]
    fn test_empty_session_file_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.session");
        std::fs::write(&path, b"").unwrap();
        let mut req = request("Hello", 1);
        req.session_path = Some(path.clone());

        let mut backend = hello_backend("a");
        let result = predict(&mut backend, &req, None, None);
        assert!(result.is_success());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_read_only_session_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro.session");
        let mut req = request("Hello", 2);
        req.session_path = Some(path.clone());
        req.prompt_cache_ro = true;

        let mut backend = hello_backend("ab");
        assert!(predict(&mut backend, &req, None, None).is_success());
        assert!(!path.exists());
    }

    #[test]
    fn test_session_supplies_empty_prompt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.session");
        std::fs::write(&path, serde_json::to_vec(&vec![1, 15043, 'a' as Token]).unwrap()).unwrap();
        let mut req = request("", 1);
        req.session_path = Some(path);

        let mut backend = hello_backend("z");
        let result = predict(&mut backend, &req, None, None);
        assert!(result.is_success());
        assert_eq!(result.text, "z");
        assert!(backend.primary_evaluations().is_empty());
    }

    #[test]
    fn test_streaming_matches_text() {
        let mut backend = hello_backend("héllo");
        let (tx, rx) = mpsc::channel();
        let result = predict(&mut backend, &request("Hello", 5), None, Some(&tx));
        drop(tx);

        let streamed: String = rx.iter().filter_map(|t| t.as_token().map(str::to_string)).collect();
        assert_eq!(streamed, result.text);
        assert_eq!(result.text, "héllo");
    }

    #[test]
    fn test_random_seed_when_zero() {
        let mut backend = hello_backend("a");
        let mut req = request("Hello", 1);
        req.sampling.seed = 0;
        predict(&mut backend, &req, None, None);
        assert_ne!(backend.sampler_params.as_ref().unwrap().seed, 0);
    }

    #[test]
    fn test_reuse_primes_penalty_history() {
        let mut backend = hello_backend("a");
        let mut req = request("Hello", 1);
        req.prompt_cache_all = true;
        let first = predict(&mut backend, &req, None, None);

        backend.reset_log();
        backend.refill_script_text("a");
        predict(&mut backend, &req, Some(first.prompt_cache), None);
        assert_eq!(backend.accepted, vec![(1, false), (15043, false), ('a' as Token, true)]);
    }
}
