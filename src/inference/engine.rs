//! Host-facing inference engine
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaModel`, `LlamaContext`) hold raw pointers and are
//! not `Send`, so the model lives on a dedicated worker thread. Callers talk
//! to it over channels. Generation calls are serialized by the command queue.
//!
//! The prompt cache handle is moved into each call and returned with the
//! result, so a handle can never be used by two generations at once.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::LlamaModel;
use thiserror::Error;

use crate::generation::params::GenerationRequest;
use crate::generation::pipeline;
use crate::generation::prompt_cache::PromptCache;
use crate::generation::result::PredictResult;
use crate::inference::llama::LlamaCppBackend;
use crate::inference::model::{self, validate_gguf, LoadedModelInfo, ModelError, ModelOptions};
use crate::inference::runtime;
use crate::inference::streaming::StreamToken;

/// Errors that can occur outside a generation call
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// A generation that never ran. The prompt cache handle it was given comes
/// back here, unless the worker thread itself was lost.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PredictError {
    pub source: EngineError,
    pub prompt_cache: Option<PromptCache>,
}

impl PredictError {
    fn new(source: EngineError, prompt_cache: Option<PromptCache>) -> Self {
        Self { source, prompt_cache }
    }
}

type Reply<T> = Sender<Result<T, EngineError>>;
type PredictReply = Receiver<Result<PredictResult, PredictError>>;

/// Commands sent to the worker thread
enum WorkerCommand {
    Init {
        silent: bool,
        response_tx: Reply<()>,
    },
    LoadModel {
        path: PathBuf,
        options: ModelOptions,
        response_tx: Reply<LoadedModelInfo>,
    },
    FreeModel,
    Generate {
        request: Box<GenerationRequest>,
        prompt_cache: Option<PromptCache>,
        token_tx: Option<Sender<StreamToken>>,
        response_tx: Sender<Result<PredictResult, PredictError>>,
    },
    Shutdown,
}

/// A generation running on the worker thread
pub struct PredictHandle {
    /// Text fragments as they are generated, then `Done` or `Error`
    pub tokens: Receiver<StreamToken>,
    result: PredictReply,
}

impl PredictHandle {
    /// Blocks until the generation finishes
    pub fn wait(self) -> Result<PredictResult, PredictError> {
        recv_result(&self.result)
    }
}

/// llama.cpp engine running on its own thread
pub struct LlamaEngine {
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    model_info: Option<LoadedModelInfo>,
}

impl LlamaEngine {
    /// Creates a new uninitialized engine
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            model_info: None,
        }
    }

    /// Starts the worker thread and initializes the llama.cpp backend.
    ///
    /// Calling it again is a no-op.
    pub fn init(&mut self, silent: bool) -> Result<(), EngineError> {
        if self.command_tx.is_some() {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_thread_main(command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Init { silent, response_tx })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        self.command_tx = Some(command_tx);
        self.worker_handle = Some(handle);

        if let Err(e) = recv(&response_rx) {
            self.shutdown();
            return Err(e);
        }
        tracing::info!("LlamaEngine worker thread started");
        Ok(())
    }

    /// Loads a GGUF model, replacing any model already loaded
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        options: ModelOptions,
    ) -> Result<LoadedModelInfo, EngineError> {
        let command_tx = self.sender()?;
        let path = path.as_ref();

        let metadata = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} header ok for {:?} ({} tensors)",
            metadata.version,
            path,
            metadata.tensor_count
        );

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                options,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let info = recv(&response_rx)?;
        self.model_info = Some(info.clone());
        Ok(info)
    }

    /// Drops the current model and frees its memory
    pub fn free_model(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::FreeModel);
        }
        self.model_info = None;
        tracing::info!("Model free requested");
    }

    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model_info.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.command_tx.is_some()
    }

    /// Runs one generation and blocks until it finishes
    pub fn predict(
        &self,
        request: &GenerationRequest,
        prompt_cache: Option<PromptCache>,
    ) -> Result<PredictResult, PredictError> {
        let result = self.submit(request, prompt_cache, None)?;
        recv_result(&result)
    }

    /// Starts one generation and streams its text as it is produced
    pub fn predict_stream(
        &self,
        request: &GenerationRequest,
        prompt_cache: Option<PromptCache>,
    ) -> Result<PredictHandle, PredictError> {
        let (token_tx, token_rx) = mpsc::channel();
        let result = self.submit(request, prompt_cache, Some(token_tx))?;
        Ok(PredictHandle {
            tokens: token_rx,
            result,
        })
    }

    fn submit(
        &self,
        request: &GenerationRequest,
        prompt_cache: Option<PromptCache>,
        token_tx: Option<Sender<StreamToken>>,
    ) -> Result<PredictReply, PredictError> {
        let command_tx = match self.sender() {
            Ok(tx) => tx,
            Err(e) => return Err(PredictError::new(e, prompt_cache)),
        };
        if self.model_info.is_none() {
            return Err(PredictError::new(EngineError::NoModelLoaded, prompt_cache));
        }

        let mut request = request.clone();
        request.validate();

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Generate {
                request: Box::new(request),
                prompt_cache,
                token_tx,
                response_tx,
            })
            .map_err(|mpsc::SendError(command)| {
                let prompt_cache = match command {
                    WorkerCommand::Generate { prompt_cache, .. } => prompt_cache,
                    _ => None,
                };
                PredictError::new(
                    EngineError::WorkerError("sending on a closed channel".to_string()),
                    prompt_cache,
                )
            })?;
        Ok(response_rx)
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        self.model_info = None;
    }

    fn sender(&self) -> Result<&Sender<WorkerCommand>, EngineError> {
        self.command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recv<T>(rx: &Receiver<Result<T, EngineError>>) -> Result<T, EngineError> {
    rx.recv()
        .map_err(|e| EngineError::WorkerError(e.to_string()))?
}

fn recv_result(rx: &PredictReply) -> Result<PredictResult, PredictError> {
    rx.recv()
        .map_err(|e| PredictError::new(EngineError::WorkerError(e.to_string()), None))?
}

/// Loaded model plus its load telemetry
struct WorkerModel {
    model: LlamaModel,
    load_time_ms: f64,
}

/// Worker thread main loop
///
/// Owns the loaded model and serves commands until shutdown.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<&'static LlamaBackend> = None;
    let mut loaded: Option<WorkerModel> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Init { silent, response_tx }) => {
                let result = runtime::init_backend(silent).map(|b| {
                    backend = Some(b);
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::LoadModel {
                path,
                options,
                response_tx,
            }) => {
                let Some(b) = backend else {
                    let _ = response_tx.send(Err(EngineError::BackendNotInitialized));
                    continue;
                };
                // Release the old weights before mapping the new ones
                loaded = None;
                let result = model::load_model(b, &path, &options).map(|(m, info)| {
                    loaded = Some(WorkerModel {
                        model: m,
                        load_time_ms: info.load_time_ms,
                    });
                    info
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::FreeModel) => {
                loaded = None;
                tracing::info!("Model freed in worker thread");
            }
            Ok(WorkerCommand::Generate {
                request,
                prompt_cache,
                token_tx,
                response_tx,
            }) => {
                let result = match (backend, &loaded) {
                    (Some(b), Some(m)) => run_generation(b, m, &request, prompt_cache, token_tx.as_ref()),
                    (None, _) => Err(PredictError::new(EngineError::BackendNotInitialized, prompt_cache)),
                    (_, None) => Err(PredictError::new(EngineError::NoModelLoaded, prompt_cache)),
                };

                if let Some(tx) = &token_tx {
                    let end = match &result {
                        Ok(r) => match r.error() {
                            Some(e) => StreamToken::Error(e.to_string()),
                            None => StreamToken::Done,
                        },
                        Err(e) => StreamToken::Error(e.to_string()),
                    };
                    let _ = tx.send(end);
                }
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn run_generation(
    backend: &LlamaBackend,
    model: &WorkerModel,
    request: &GenerationRequest,
    prompt_cache: Option<PromptCache>,
    token_tx: Option<&Sender<StreamToken>>,
) -> Result<PredictResult, PredictError> {
    let mut llama = match LlamaCppBackend::new(backend, &model.model, request) {
        Ok(llama) => llama,
        Err(e) => return Err(PredictError::new(e, prompt_cache)),
    };
    let mut result = pipeline::predict(&mut llama, request, prompt_cache, token_tx);
    result.timings.t_load_ms = model.load_time_ms;

    tracing::info!(
        "Generation finished with status {} ({} tokens, {:.2} tok/s)",
        result.status_code(),
        result.tokens.len(),
        result.timings.tokens_per_second().unwrap_or(0.0)
    );
    Ok(result)
}
