//! Logging configuration built on tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static STRATA_LOG_ENV_VAR: &str = "STRATA_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Also used to enable logging in tests, so wrap in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();
    });
}

/// List of crates in the workspace.
const STRATA_CRATES: &[&str] = &[
    "checker",
    "meta_kv",
    "monitoring",
    "strata_config",
    "stratad",
    "vault_store",
];

fn env_filter() -> EnvFilter {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse_lossy(&directive_string);

    let log_level = std::env::var(STRATA_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in STRATA_CRATES {
        // Add directives for each workspace crate, unless overridden by RUST_LOG
        if !directive_string.contains(&format!("{crate_name}=")) {
            if let Ok(directive) = format!("{crate_name}={log_level}").parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    env_filter
}

/// Collect the error source chain as a vector of strings for tracing.
///
/// Walks the `.source()` chain of the provided error and collects each
/// source's Display representation. Returns an empty vector if the error
/// has no source chain.
pub fn error_source(err: &dyn std::error::Error) -> tracing::field::DebugValue<Vec<String>> {
    let mut sources = Vec::new();
    let mut current = err.source();

    while let Some(curr) = current {
        sources.push(curr.to_string());
        current = curr.source();
    }

    tracing::field::debug(sources)
}
