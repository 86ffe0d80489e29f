use std::fs::{create_dir_all, OpenOptions};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` directives are honoured on top
/// of the configured level; with a log file, output is appended without
/// colours.
pub fn setup_logging(cfg: &LoggingConfig) -> Result<()> {
    let level = cfg
        .level
        .parse::<tracing::Level>()
        .with_context(|| format!("LOG_LEVEL {:?} is not a tracing level", cfg.level))?;

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    match &cfg.file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    create_dir_all(dir)
                        .with_context(|| format!("could not create log directory {}", dir.display()))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("could not open log file {}", path.display()))?;

            fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow!("logging already initialised: {e}"))
        }
        None => fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(|e| anyhow!("logging already initialised: {e}")),
    }
}
