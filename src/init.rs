//! Initialization helpers for the application startup.

use crate::backend::{KvBackend, MemoryBackend, SqliteBackend};
use crate::config::Config;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

/// Sets up the tracing subscriber with the configured filters.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Opens the configured key-value backend.
pub fn init_backend(config: &Config) -> Result<Arc<dyn KvBackend>> {
    match config.storage.backend.as_str() {
        "sqlite" => {
            let backend = SqliteBackend::open(config.storage.sqlite_path.clone())
                .with_context(|| format!("Failed to open {}", config.storage.sqlite_path))?;
            backend
                .initialize()
                .context("Failed to initialize SQLite schema")?;
            Ok(Arc::new(backend))
        }
        "memory" => {
            info!("Using in-memory backend; nothing will be persisted.");
            Ok(Arc::new(MemoryBackend::new()))
        }
        other => bail!("Unknown storage backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = Config::default();
        config.storage.backend = "redis".to_string();
        assert!(init_backend(&config).is_err());
    }

    #[test]
    fn test_memory_backend() {
        let mut config = Config::default();
        config.storage.backend = "memory".to_string();
        let backend = init_backend(&config).unwrap();
        backend.write("history", "a.com", "{}").unwrap();
        assert!(backend.read("history", "a.com").unwrap().is_some());
    }
}
