use std::path::PathBuf;
use std::sync::RwLock;

use tracing::warn;

/// Owns the last-observed app-version string, backed by a file at a caller-supplied path.
///
/// Re-architected from the original's process-wide mutable global (§9): the path is a
/// construction parameter and reads/writes are mediated through one lock instead of a bare
/// module-level variable.
pub struct VersionStore {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<String> {
        if let Some(version) = self.cached.read().expect("version store lock poisoned").clone() {
            return Some(version);
        }
        let loaded = std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(ref version) = loaded {
            *self.cached.write().expect("version store lock poisoned") = Some(version.clone());
        }
        loaded
    }

    /// Sets the version to `new` only if the currently observed value is `old`; returns
    /// whether the write happened. Persists to disk on success.
    pub fn compare_and_set(&self, old: Option<&str>, new: &str) -> bool {
        let current = self.get();
        if current.as_deref() != old {
            return false;
        }
        if let Err(e) = std::fs::write(&self.path, new) {
            warn!(error = %e, path = %self.path.display(), "failed to persist version file");
            return false;
        }
        *self.cached.write().expect("version store lock poisoned") = Some(new.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("clanwatch-version-store-test-{name}.txt"))
    }

    #[test]
    fn get_returns_none_when_file_is_absent() {
        let path = temp_path("absent");
        let _ = std::fs::remove_file(&path);
        let store = VersionStore::new(&path);
        assert_eq!(store.get(), None);
    }

    #[test]
    fn compare_and_set_only_writes_when_old_matches() {
        let path = temp_path("cas");
        let _ = std::fs::remove_file(&path);
        let store = VersionStore::new(&path);

        assert!(store.compare_and_set(None, "1.0.0"));
        assert_eq!(store.get().as_deref(), Some("1.0.0"));

        assert!(!store.compare_and_set(Some("wrong"), "2.0.0"));
        assert_eq!(store.get().as_deref(), Some("1.0.0"));

        assert!(store.compare_and_set(Some("1.0.0"), "2.0.0"));
        assert_eq!(store.get().as_deref(), Some("2.0.0"));

        let _ = std::fs::remove_file(&path);
    }
}
