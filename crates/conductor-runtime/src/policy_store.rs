//! Hot-swappable policy.
//!
//! Readers grab an `Arc<PolicySnapshot>` and keep using it for as long as
//! they like; a reload builds a complete new snapshot and swaps the pointer.
//! A reload that fails validation leaves the current snapshot in place.

use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conductor_core::{PolicyDocument, PolicyError, PolicySnapshot};

pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
    reloads: AtomicU64,
}

impl PolicyStore {
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicySnapshot::new(document))),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        Ok(Self::new(PolicyDocument::from_file(path)?))
    }

    /// The active snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    /// Replace the active snapshot, returning the previous one.
    pub fn swap(&self, document: PolicyDocument) -> Arc<PolicySnapshot> {
        let next = Arc::new(PolicySnapshot::new(document));
        let previous = std::mem::replace(&mut *self.current.write(), next.clone());
        self.reloads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            previous = %previous.version(),
            version = %next.version(),
            rules = next.rules().len(),
            "Policy swapped"
        );
        previous
    }

    /// Load, validate and swap in a policy file.
    pub fn reload_from_file(&self, path: &Path) -> Result<Arc<PolicySnapshot>, PolicyError> {
        match PolicyDocument::from_file(path) {
            Ok(document) => {
                self.swap(document);
                Ok(self.snapshot())
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    version = %self.snapshot().version(),
                    "Policy reload rejected; keeping current snapshot"
                );
                Err(e)
            }
        }
    }

    /// Successful swaps since construction.
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const V1: &str = r#"
version: "1"
rules:
  - id: all
    match: { task: generate }
    choose: { provider_order: [local], model: m1, max_cost_usd: 0.1, latency_p95_ms: 1000 }
"#;

    const V2: &str = r#"
version: "2"
rules:
  - id: all
    match: { task: generate }
    choose: { provider_order: [remote], model: m2, max_cost_usd: 0.2, latency_p95_ms: 1000 }
"#;

    #[test]
    fn test_held_snapshot_survives_swap() {
        let store = PolicyStore::new(PolicyDocument::from_yaml(V1).unwrap());
        let held = store.snapshot();
        store.swap(PolicyDocument::from_yaml(V2).unwrap());

        assert_eq!(held.version(), "1");
        assert_eq!(store.snapshot().version(), "2");
        assert_eq!(store.reloads(), 1);
    }

    #[test]
    fn test_bad_reload_keeps_current() {
        let store = PolicyStore::new(PolicyDocument::from_yaml(V1).unwrap());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rules: [{{ id: broken }}]").unwrap();

        assert!(store.reload_from_file(file.path()).is_err());
        assert_eq!(store.snapshot().version(), "1");
        assert_eq!(store.reloads(), 0);
    }

    #[test]
    fn test_reload_from_file() {
        let store = PolicyStore::new(PolicyDocument::from_yaml(V1).unwrap());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(V2.as_bytes()).unwrap();

        let snapshot = store.reload_from_file(file.path()).unwrap();
        assert_eq!(snapshot.version(), "2");
    }
}
