//! Model Registry — pure read-side enumeration and resolution over the
//! on-disk model tree (§4.D).
//!
//! Layout: `<models_root>/<owner>/<name>/<quant>.gguf` (single file) or
//! `<models_root>/<owner>/<name>/<quant>/` (split files), each accompanied
//! by `<quant>.manifest.json`. A model only counts as installed when both
//! the blob and a parseable manifest exist.

use crate::model::ModelId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Per-file manifest entry (`{path, size, sha256?}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    pub sha256: Option<String>,
}

/// `<quant>.manifest.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub gguf_file: ManifestFile,
    #[serde(default)]
    pub mmproj_file: Option<ManifestFile>,
}

/// A model resolved to an exact, installed identifier.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub id: ModelId,
    /// Absolute path to the primary blob (first split part for multi-file models).
    pub blob_path: PathBuf,
    /// Directory holding the model's files; used as the spawn argument for
    /// split models.
    pub dir_path: PathBuf,
    pub mmproj_path: Option<PathBuf>,
    pub manifest: Manifest,
}

#[derive(Debug)]
pub enum ResolveOutcome {
    Exact(ResolvedModel),
    Ambiguous(Vec<String>),
    NotFound(Vec<String>),
}

#[derive(Debug, Clone)]
struct InstalledEntry {
    id: ModelId,
    dir: PathBuf,
}

pub struct ModelRegistry {
    models_root: PathBuf,
}

impl ModelRegistry {
    pub fn new(models_root: impl Into<PathBuf>) -> Self {
        Self {
            models_root: models_root.into(),
        }
    }

    /// Full enumeration of canonical identifiers found on disk.
    pub fn list(&self) -> Vec<ModelId> {
        self.scan().into_iter().map(|e| e.id).collect()
    }

    /// Every installed model, fully resolved (manifest parsed, blob/mmproj
    /// paths computed). Used by the Content Index rebuild so it doesn't
    /// have to re-walk the models tree a second time.
    pub fn resolve_all(&self) -> Vec<ResolvedModel> {
        self.scan().iter().map(|e| self.load(e)).collect()
    }

    /// Resolve a free-text query per §3's resolution rules: exact match
    /// wins; else unique case-insensitive suffix; else unique substring;
    /// else ambiguous or not-found with suggestions.
    pub fn resolve(&self, query: &str) -> ResolveOutcome {
        let entries = self.scan();
        let query_lower = query.to_lowercase();

        // Exact match (case-sensitive against the canonical form).
        if let Some(hit) = entries.iter().find(|e| e.id.canonical() == query) {
            return ResolveOutcome::Exact(self.load(hit));
        }

        // Unique case-insensitive suffix match.
        let suffix_hits: Vec<&InstalledEntry> = entries
            .iter()
            .filter(|e| e.id.canonical_lower().ends_with(&query_lower))
            .collect();
        if suffix_hits.len() == 1 {
            return ResolveOutcome::Exact(self.load(suffix_hits[0]));
        }
        if suffix_hits.len() > 1 {
            return ResolveOutcome::Ambiguous(
                suffix_hits.iter().map(|e| e.id.canonical()).collect(),
            );
        }

        // Unique substring match.
        let substr_hits: Vec<&InstalledEntry> = entries
            .iter()
            .filter(|e| e.id.canonical_lower().contains(&query_lower))
            .collect();
        if substr_hits.len() == 1 {
            return ResolveOutcome::Exact(self.load(substr_hits[0]));
        }
        if substr_hits.len() > 1 {
            return ResolveOutcome::Ambiguous(
                substr_hits.iter().map(|e| e.id.canonical()).collect(),
            );
        }

        ResolveOutcome::NotFound(self.suggest(&entries, &query_lower))
    }

    /// Resolve an already-canonical identifier (used to confirm the
    /// fixpoint property in §8: `resolve(resolve(x).canonical) == resolve(x)`).
    pub fn resolve_exact(&self, id: &ModelId) -> ResolveOutcome {
        self.resolve(&id.canonical())
    }

    // ------------------------------------------------------------------

    fn scan(&self) -> Vec<InstalledEntry> {
        let mut out = Vec::new();
        let owners = match std::fs::read_dir(&self.models_root) {
            Ok(rd) => rd,
            Err(_) => return out,
        };

        for owner_entry in owners.flatten() {
            if !owner_entry.path().is_dir() {
                continue;
            }
            let owner = owner_entry.file_name().to_string_lossy().to_string();

            let names = match std::fs::read_dir(owner_entry.path()) {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            for name_entry in names.flatten() {
                let name_path = name_entry.path();
                if !name_path.is_dir() {
                    continue;
                }
                let name = name_entry.file_name().to_string_lossy().to_string();

                let Ok(files) = std::fs::read_dir(&name_path) else {
                    continue;
                };
                for file_entry in files.flatten() {
                    let path = file_entry.path();
                    let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
                        continue;
                    };
                    let Some(quant) = file_name.strip_suffix(".manifest.json") else {
                        continue;
                    };
                    if self.is_installed(&name_path, quant) {
                        out.push(InstalledEntry {
                            id: ModelId::new(&owner, &name, quant),
                            dir: name_path.clone(),
                        });
                    }
                }
            }
        }
        out
    }

    fn is_installed(&self, name_dir: &Path, quant: &str) -> bool {
        let manifest_path = name_dir.join(format!("{quant}.manifest.json"));
        let Ok(content) = std::fs::read_to_string(&manifest_path) else {
            return false;
        };
        if serde_json::from_str::<Manifest>(&content).is_err() {
            return false;
        }
        let single = name_dir.join(format!("{quant}.gguf"));
        let split_dir = name_dir.join(quant);
        single.is_file() || split_dir.is_dir()
    }

    fn load(&self, entry: &InstalledEntry) -> ResolvedModel {
        let quant = &entry.id.quantization;
        let manifest_path = entry.dir.join(format!("{quant}.manifest.json"));
        let manifest: Manifest = std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or(Manifest {
                gguf_file: ManifestFile {
                    path: format!("{quant}.gguf"),
                    size: 0,
                    sha256: None,
                },
                mmproj_file: None,
            });

        let single = entry.dir.join(format!("{quant}.gguf"));
        let split_dir = entry.dir.join(quant);
        let (blob_path, dir_path) = if single.is_file() {
            (single, entry.dir.clone())
        } else {
            (first_split_part(&split_dir).unwrap_or_else(|| split_dir.clone()), split_dir)
        };

        let mmproj_path = entry.dir.join(format!("{quant}.mmproj.gguf"));
        let mmproj_path = if mmproj_path.is_file() {
            Some(mmproj_path)
        } else {
            None
        };

        ResolvedModel {
            id: entry.id.clone(),
            blob_path,
            dir_path,
            mmproj_path,
            manifest,
        }
    }

    /// Five highest-scoring near-miss suggestions, by token overlap on
    /// lowercased `owner/name/quantization` pieces.
    fn suggest(&self, entries: &[InstalledEntry], query_lower: &str) -> Vec<String> {
        let query_tokens = tokenize(query_lower);
        let mut scored: Vec<(usize, String)> = entries
            .iter()
            .map(|e| {
                let tokens = tokenize(&e.id.canonical_lower());
                let overlap = query_tokens.intersection(&tokens).count();
                (overlap, e.id.canonical())
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(5).map(|(_, name)| name).collect()
    }
}

fn tokenize(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Locate the lowest-numbered split part `*-00001-of-NNNNN.gguf` in a
/// quantization directory.
fn first_split_part(dir: &Path) -> Option<PathBuf> {
    let mut parts: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("gguf")
                && p.file_name()
                    .and_then(|f| f.to_str())
                    .map(|f| f.contains("-of-"))
                    .unwrap_or(false)
        })
        .collect();
    parts.sort();
    parts.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, quant: &str, size: u64) {
        let manifest = Manifest {
            gguf_file: ManifestFile {
                path: format!("{quant}.gguf"),
                size,
                sha256: Some("deadbeef".into()),
            },
            mmproj_file: None,
        };
        fs::write(
            dir.join(format!("{quant}.manifest.json")),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn install_single(root: &Path, owner: &str, name: &str, quant: &str, size: u64) {
        let dir = root.join(owner).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{quant}.gguf")), vec![0u8; size as usize]).unwrap();
        write_manifest(&dir, quant, size);
    }

    #[test]
    fn list_enumerates_installed_models() {
        let tmp = TempDir::new().unwrap();
        install_single(tmp.path(), "alpha", "llama-3", "Q4", 10);
        install_single(tmp.path(), "beta", "llama-3", "Q4", 10);
        let reg = ModelRegistry::new(tmp.path());
        let mut ids: Vec<String> = reg.list().iter().map(|m| m.canonical()).collect();
        ids.sort();
        assert_eq!(ids, vec!["alpha/llama-3:Q4", "beta/llama-3:Q4"]);
    }

    #[test]
    fn resolve_exact_match() {
        let tmp = TempDir::new().unwrap();
        install_single(tmp.path(), "alpha", "llama-3", "Q4", 10);
        let reg = ModelRegistry::new(tmp.path());
        match reg.resolve("alpha/llama-3:Q4") {
            ResolveOutcome::Exact(m) => assert_eq!(m.id.canonical(), "alpha/llama-3:Q4"),
            other => panic!("expected exact match, got {other:?}"),
        }
    }

    #[test]
    fn resolve_ambiguous_suffix() {
        let tmp = TempDir::new().unwrap();
        install_single(tmp.path(), "alpha", "llama-3", "Q4", 10);
        install_single(tmp.path(), "beta", "llama-3", "Q4", 10);
        let reg = ModelRegistry::new(tmp.path());
        match reg.resolve("llama-3") {
            ResolveOutcome::Ambiguous(candidates) => {
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn resolve_unique_substring() {
        let tmp = TempDir::new().unwrap();
        install_single(tmp.path(), "alpha", "llama-3", "Q4", 10);
        let reg = ModelRegistry::new(tmp.path());
        match reg.resolve("alpha/llama-3") {
            ResolveOutcome::Exact(m) => assert_eq!(m.id.canonical(), "alpha/llama-3:Q4"),
            other => panic!("expected exact, got {other:?}"),
        }
    }

    #[test]
    fn resolve_not_found_with_suggestions() {
        let tmp = TempDir::new().unwrap();
        install_single(tmp.path(), "alpha", "llama-3", "Q4", 10);
        install_single(tmp.path(), "beta", "llama-3", "Q4", 10);
        let reg = ModelRegistry::new(tmp.path());
        match reg.resolve("llama3") {
            ResolveOutcome::NotFound(suggestions) => {
                assert_eq!(suggestions.len(), 2);
            }
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn missing_manifest_is_not_installed() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alpha").join("llama-3");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Q4.gguf"), vec![0u8; 10]).unwrap();
        // No manifest written.
        let reg = ModelRegistry::new(tmp.path());
        assert!(reg.list().is_empty());
    }

    #[test]
    fn resolution_is_a_fixpoint() {
        let tmp = TempDir::new().unwrap();
        install_single(tmp.path(), "alpha", "llama-3", "Q4", 10);
        let reg = ModelRegistry::new(tmp.path());
        let first = match reg.resolve("alpha/llama-3") {
            ResolveOutcome::Exact(m) => m.id,
            other => panic!("expected exact, got {other:?}"),
        };
        let second = match reg.resolve_exact(&first) {
            ResolveOutcome::Exact(m) => m.id,
            other => panic!("expected exact, got {other:?}"),
        };
        assert_eq!(first, second);
    }

    #[test]
    fn split_model_resolves_first_part() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alpha").join("big");
        let split_dir = dir.join("Q8");
        fs::create_dir_all(&split_dir).unwrap();
        fs::write(split_dir.join("model-00001-of-00002.gguf"), vec![0u8; 5]).unwrap();
        fs::write(split_dir.join("model-00002-of-00002.gguf"), vec![0u8; 5]).unwrap();
        write_manifest(&dir, "Q8", 10);

        let reg = ModelRegistry::new(tmp.path());
        match reg.resolve("alpha/big:Q8") {
            ResolveOutcome::Exact(m) => {
                assert!(m.blob_path.ends_with("model-00001-of-00002.gguf"));
                assert_eq!(m.dir_path, split_dir);
            }
            other => panic!("expected exact, got {other:?}"),
        }
    }
}
