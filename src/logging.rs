//! Tracing setup for hosts

use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"llama_predict=info"`).
///
/// Returns false if the directive does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let directive: Directive = match default_directive.parse() {
        Ok(directive) => directive,
        Err(e) => {
            eprintln!("Invalid log directive {default_directive:?}: {e}");
            return false;
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(directive))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_directive_is_rejected() {
        assert!(!init_tracing("llama_predict=loudest"));
    }

    #[test]
    fn test_second_install_fails_quietly() {
        init_tracing("llama_predict=debug");
        assert!(!init_tracing("llama_predict=debug"));
    }
}
