//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging with optional file
//! output. Logs go to STDERR so that `generate` can stream story text on
//! STDOUT undisturbed.

use crate::config::LoggingConfig;
use anyhow::Result;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging based on configuration.
///
/// `RUST_LOG` takes precedence over `config.level`.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or the log file
/// cannot be opened.
///
/// # Examples
///
/// ```no_run
/// use storyrelay::config::LoggingConfig;
/// use storyrelay::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_format {
        let stderr_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(Arc::new(file));

            registry.with(stderr_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stderr_layer).try_init()?;
        }
    } else {
        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));

            registry.with(stderr_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?)
}

/// Create a span carrying the identifying fields of a session.
///
/// # Examples
///
/// ```ignore
/// let span = session_span!(session_id, workspace_id, project_id, chapter_order);
/// ```
#[macro_export]
macro_rules! session_span {
    ($session_id:expr, $workspace_id:expr, $project_id:expr, $chapter_order:expr) => {
        tracing::info_span!(
            "session",
            session_id = %$session_id,
            workspace_id = %$workspace_id,
            project_id = %$project_id,
            chapter_order = $chapter_order
        )
    };
}
