//! Process-wide llama.cpp backend
//!
//! llama.cpp may only be initialized once per process, so the backend lives
//! in a static for the lifetime of the program.

use llama_cpp_2::llama_backend::LlamaBackend;
use once_cell::sync::OnceCell;

use crate::inference::engine::EngineError;

static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// Initializes the backend on first use and returns it.
///
/// With `silent` set, llama.cpp's own log output is discarded. The flag only
/// takes effect on the first call.
pub fn init_backend(silent: bool) -> Result<&'static LlamaBackend, EngineError> {
    LLAMA_BACKEND.get_or_try_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        if silent {
            backend.void_logs();
        }
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

pub fn is_initialized() -> bool {
    LLAMA_BACKEND.get().is_some()
}
