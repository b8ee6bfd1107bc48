use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("backend lock poisoned")]
    Poisoned,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Hierarchical `(path, key) -> value` store the policy stores persist into.
///
/// Values are opaque text. Each store only touches its own sub-paths, so
/// implementations need single-key atomicity and nothing more.
pub trait KvBackend: Send + Sync {
    fn write(&self, path: &str, key: &str, value: &str) -> BackendResult<()>;

    /// Returns `None` when either the path or the key does not exist.
    fn read(&self, path: &str, key: &str) -> BackendResult<Option<String>>;

    /// All keys under `path`. An absent path yields an empty map.
    fn enumerate(&self, path: &str) -> BackendResult<BTreeMap<String, String>>;

    fn delete(&self, path: &str, key: &str) -> BackendResult<()>;

    /// Removes every key under `path`, returning how many were dropped.
    fn delete_all(&self, path: &str) -> BackendResult<usize>;
}
