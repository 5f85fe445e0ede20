use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::compile::{CompiledTemplate, encode_mtime};
use crate::error::Result;

/// Disk-backed store of compiled templates, one JSON artifact per template
/// identity under the cache directory.
///
/// A hit requires the recorded source mtime to be at least the live source's
/// current mtime; anything else — stale, missing, or undecodable — is a miss
/// and the caller recompiles. Disabling the store bypasses lookups and
/// writes without touching existing artifacts.
pub(crate) struct CacheStore {
    dir: PathBuf,
    enabled: bool,
}

impl CacheStore {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Artifact names must be filesystem-safe regardless of the template
    /// name, so the identity is percent-encoded.
    fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(name)))
    }

    /// Look up a compiled template, validating freshness against the live
    /// source mtime.
    pub(crate) fn get(&self, name: &str, source_mtime: SystemTime) -> Option<CompiledTemplate> {
        if !self.enabled {
            return None;
        }
        let path = self.artifact_path(name);
        let bytes = fs::read(&path).ok()?;
        // A torn or corrupt artifact reads as a miss, never an error.
        let compiled: CompiledTemplate = serde_json::from_slice(&bytes).ok()?;
        if compiled.source_mtime >= encode_mtime(source_mtime) {
            debug!(template = name, "compiled template cache hit");
            Some(compiled)
        } else {
            debug!(template = name, "cache artifact stale, recompiling");
            None
        }
    }

    /// Persist a compiled template. The artifact is written to a temp file
    /// in the cache directory and atomically renamed into place, so a
    /// concurrent reader never observes a partial write.
    pub(crate) fn put(&self, compiled: &CompiledTemplate) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(compiled)?)?;
        tmp.persist(self.artifact_path(&compiled.name))
            .map_err(|e| e.error)?;
        debug!(template = compiled.name.as_str(), "cache artifact written");
        Ok(())
    }

    pub(crate) fn invalidate(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.artifact_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every persisted artifact, regardless of the enabled flag.
    pub(crate) fn clear(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path)?;
            }
        }
        debug!(dir = %self.dir.display(), "cache cleared");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::registry::Registry;
    use std::time::Duration;

    fn compiled(name: &str, source: &str, mtime: SystemTime) -> CompiledTemplate {
        let program = parse(&tokenize(source).unwrap()).unwrap();
        compile(name, program, &Registry::with_builtins(), mtime).unwrap()
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mtime = SystemTime::now();

        let template = compiled("greeting", "Hello {{ name }}!", mtime);
        store.put(&template).unwrap();

        let loaded = store.get("greeting", mtime).unwrap();
        assert_eq!(loaded.program, template.program);
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_stale_artifact_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let old = SystemTime::now();

        store.put(&compiled("t", "old", old)).unwrap();

        let newer = old + Duration::from_secs(5);
        assert!(store.get("t", newer).is_none());
        // Equal-or-newer recorded mtime stays valid.
        assert!(store.get("t", old).is_some());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_disabled_store_bypasses_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::new(dir.path());
        let mtime = SystemTime::now();

        store.put(&compiled("t", "body", mtime)).unwrap();
        store.set_enabled(false);

        assert!(store.get("t", mtime).is_none());
        store.put(&compiled("t2", "body", mtime)).unwrap();
        assert!(!store.artifact_path("t2").exists());

        // Artifacts written while enabled are still on disk.
        store.set_enabled(true);
        assert!(store.get("t", mtime).is_some());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_corrupt_artifact_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mtime = SystemTime::now();

        store.put(&compiled("t", "body", mtime)).unwrap();
        fs::write(store.artifact_path("t"), b"{ not json").unwrap();

        assert!(store.get("t", mtime).is_none());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_invalidate_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mtime = SystemTime::now();

        store.put(&compiled("a", "A", mtime)).unwrap();
        store.put(&compiled("b", "B", mtime)).unwrap();

        store.invalidate("a").unwrap();
        assert!(store.get("a", mtime).is_none());
        assert!(store.get("b", mtime).is_some());

        store.clear().unwrap();
        assert!(store.get("b", mtime).is_none());

        // Clearing an already-empty store is fine.
        store.clear().unwrap();
        store.invalidate("never-existed").unwrap();
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_artifact_names_are_filesystem_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mtime = SystemTime::now();

        store
            .put(&compiled("pages/home page.html", "x", mtime))
            .unwrap();
        assert!(store.get("pages/home page.html", mtime).is_some());
        // Only one artifact, directly under the cache dir.
        let count = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(count, 1);
    }
}
