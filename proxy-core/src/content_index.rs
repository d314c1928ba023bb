//! Content Index — a `hash -> path` map over every blob under the models
//! tree, rebuilt by reading manifests (never by hashing file content) and
//! persisted atomically (write to a tempfile, then rename) so a crash
//! mid-write never corrupts the index on disk.

use crate::registry::{ManifestFile, ModelRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContentIndex {
    /// sha256 hex digest -> absolute path of the file holding that content.
    entries: HashMap<String, PathBuf>,
}

impl ContentIndex {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    /// Rebuild from every installed model's manifest: a `(declared_hash,
    /// path)` pair is recorded only when the manifest names a sha256 and
    /// the file on disk exists with exactly the declared size. Existence +
    /// size is the full check — contents are never re-hashed here, since
    /// that is the downloader's duty after a transfer completes. Persists
    /// the result to `index_path` via tempfile-then-rename.
    pub fn rebuild(registry: &ModelRegistry, index_path: &Path) -> std::io::Result<Self> {
        let mut entries = HashMap::new();

        for model in registry.resolve_all() {
            record_if_matches(&mut entries, &model.manifest.gguf_file, &model.blob_path);
            if let (Some(mmproj_file), Some(mmproj_path)) =
                (&model.manifest.mmproj_file, &model.mmproj_path)
            {
                record_if_matches(&mut entries, mmproj_file, mmproj_path);
            }
        }

        let index = ContentIndex { entries };
        index.persist(index_path)?;
        Ok(index)
    }

    pub fn lookup(&self, hash: &str) -> Option<&Path> {
        self.entries.get(hash).map(|p| p.as_path())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(h, p)| (h.as_str(), p.as_path()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self, index_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = index_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)
            .expect("ContentIndex serialization cannot fail");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, index_path)?;
        Ok(())
    }
}

/// Record `file`'s declared hash under `path` iff a hash is declared and
/// the file on disk exists with exactly the declared size.
fn record_if_matches(entries: &mut HashMap<String, PathBuf>, file: &ManifestFile, path: &Path) {
    let Some(hash) = &file.sha256 else { return };
    let Ok(meta) = std::fs::metadata(path) else { return };
    if meta.len() == file.size {
        entries.insert(hash.to_lowercase(), path.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Manifest, ManifestFile as MFile};
    use std::fs;
    use tempfile::TempDir;

    fn install(root: &Path, owner: &str, name: &str, quant: &str, content: &[u8], declared_hash: Option<&str>, declared_size: u64) {
        let dir = root.join(owner).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{quant}.gguf")), content).unwrap();
        let manifest = Manifest {
            gguf_file: MFile {
                path: format!("{quant}.gguf"),
                size: declared_size,
                sha256: declared_hash.map(|h| h.to_string()),
            },
            mmproj_file: None,
        };
        fs::write(
            dir.join(format!("{quant}.manifest.json")),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn rebuild_indexes_declared_hash_when_size_matches() {
        let root = TempDir::new().unwrap();
        install(root.path(), "alpha", "llama-3", "Q4", b"hello world", Some("deadbeef"), 11);

        let index_path = root.path().join("content_index.json");
        let registry = ModelRegistry::new(root.path());
        let index = ContentIndex::rebuild(&registry, &index_path).unwrap();

        assert_eq!(index.len(), 1);
        assert!(index.lookup("deadbeef").is_some());
    }

    #[test]
    fn rebuild_skips_entries_with_no_declared_hash() {
        let root = TempDir::new().unwrap();
        install(root.path(), "alpha", "llama-3", "Q4", b"hello world", None, 11);

        let index_path = root.path().join("content_index.json");
        let registry = ModelRegistry::new(root.path());
        let index = ContentIndex::rebuild(&registry, &index_path).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn rebuild_skips_entries_whose_size_does_not_match() {
        let root = TempDir::new().unwrap();
        // Declared size (999) does not match the actual file's size (11 bytes).
        install(root.path(), "alpha", "llama-3", "Q4", b"hello world", Some("deadbeef"), 999);

        let index_path = root.path().join("content_index.json");
        let registry = ModelRegistry::new(root.path());
        let index = ContentIndex::rebuild(&registry, &index_path).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn rebuild_persists_and_reloads() {
        let root = TempDir::new().unwrap();
        install(root.path(), "alpha", "llama-3", "Q4", b"content", Some("abc123"), 7);

        let index_path = root.path().join("content_index.json");
        let registry = ModelRegistry::new(root.path());
        ContentIndex::rebuild(&registry, &index_path).unwrap();

        let reloaded = ContentIndex::load(&index_path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.lookup("abc123").is_some());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let root = TempDir::new().unwrap();
        install(root.path(), "alpha", "llama-3", "Q4", b"content", Some("abc123"), 7);

        let index_path = root.path().join("content_index.json");
        let registry = ModelRegistry::new(root.path());
        let first = ContentIndex::rebuild(&registry, &index_path).unwrap();
        let second = ContentIndex::rebuild(&registry, &index_path).unwrap();
        assert_eq!(first.len(), second.len());
    }
}
