use super::traits::{BackendError, BackendResult, KvBackend};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

type Tree = BTreeMap<String, BTreeMap<String, String>>;

/// Process-local backend. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tree: Mutex<Tree>,
    // When set, every mutating call fails. Reads keep working.
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of keys stored under `path`.
    pub fn key_count(&self, path: &str) -> usize {
        self.tree
            .lock()
            .map(|t| t.get(path).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn guard(&self) -> BackendResult<MutexGuard<'_, Tree>> {
        self.tree.lock().map_err(|_| BackendError::Poisoned)
    }

    fn check_writable(&self) -> BackendResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl KvBackend for MemoryBackend {
    fn write(&self, path: &str, key: &str, value: &str) -> BackendResult<()> {
        self.check_writable()?;
        self.guard()?
            .entry(path.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn read(&self, path: &str, key: &str) -> BackendResult<Option<String>> {
        Ok(self.guard()?.get(path).and_then(|m| m.get(key)).cloned())
    }

    fn enumerate(&self, path: &str) -> BackendResult<BTreeMap<String, String>> {
        Ok(self.guard()?.get(path).cloned().unwrap_or_default())
    }

    fn delete(&self, path: &str, key: &str) -> BackendResult<()> {
        self.check_writable()?;
        let mut tree = self.guard()?;
        if let Some(keys) = tree.get_mut(path) {
            keys.remove(key);
            if keys.is_empty() {
                tree.remove(path);
            }
        }
        Ok(())
    }

    fn delete_all(&self, path: &str) -> BackendResult<usize> {
        self.check_writable()?;
        Ok(self.guard()?.remove(path).map_or(0, |m| m.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let backend = MemoryBackend::new();
        backend.write("locked/tls", "example.com", "4").unwrap();

        assert_eq!(
            backend.read("locked/tls", "example.com").unwrap().as_deref(),
            Some("4")
        );
        assert_eq!(backend.read("locked/tls", "missing.com").unwrap(), None);
        assert_eq!(backend.read("locked/quic", "example.com").unwrap(), None);

        backend.delete("locked/tls", "example.com").unwrap();
        assert_eq!(backend.key_count("locked/tls"), 0);
        assert!(backend.enumerate("locked/tls").unwrap().is_empty());
    }

    #[test]
    fn test_delete_all_counts_keys() {
        let backend = MemoryBackend::new();
        backend.write("history", "a.com", "{}").unwrap();
        backend.write("history", "b.com", "{}").unwrap();
        backend.write("locked/tls", "a.com", "1").unwrap();

        assert_eq!(backend.delete_all("history").unwrap(), 2);
        assert_eq!(backend.delete_all("history").unwrap(), 0);
        assert_eq!(backend.key_count("locked/tls"), 1);
    }

    #[test]
    fn test_fail_writes_keeps_reads() {
        let backend = MemoryBackend::new();
        backend.write("blocked/tls", "a.com", "[2]").unwrap();
        backend.set_fail_writes(true);

        assert!(backend.write("blocked/tls", "b.com", "[3]").is_err());
        assert!(backend.delete("blocked/tls", "a.com").is_err());
        assert_eq!(backend.key_count("blocked/tls"), 1);
    }
}
