//! Registry: the sole authority on range ownership. Two JSON files
//! under `cyber_range_dir` — `ranges_metadata.json` and
//! `ranges_resources.json` — rewritten in full on every mutation under a
//! single lock, so the in-memory and on-disk views agree after every
//! completed public operation.
//!
//! Not to be confused with the base-image preset list in `crate::images`,
//! which is an unrelated static catalog consulted only by `config-init`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::RangeError;
use crate::model::{RangeMetadata, RangeResources, RangeStatus};
use crate::paths;

struct RegistryData {
    metadata: HashMap<String, RangeMetadata>,
    resources: HashMap<String, RangeResources>,
}

/// In-memory range registry, backed by the two JSON files. All reads and
/// writes go through one lock so a completed `create`/`destroy`/`remove`
/// always leaves disk and memory in agreement.
pub struct Registry {
    cyber_range_dir: PathBuf,
    data: Mutex<RegistryData>,
}

impl Registry {
    /// Loads both JSON files from `cyber_range_dir`. A missing or
    /// unparsable file logs a warning and starts empty — the registry
    /// never refuses to start.
    pub fn load(cyber_range_dir: &Path) -> Self {
        let metadata = load_json(&paths::metadata_file(cyber_range_dir)).unwrap_or_else(|| {
            HashMap::new()
        });
        let resources = load_json(&paths::resources_file(cyber_range_dir)).unwrap_or_else(|| {
            HashMap::new()
        });
        Self {
            cyber_range_dir: cyber_range_dir.to_path_buf(),
            data: Mutex::new(RegistryData { metadata, resources }),
        }
    }

    pub fn exists(&self, range_id: &str) -> bool {
        self.data.lock().unwrap().metadata.contains_key(range_id)
    }

    pub fn get_metadata(&self, range_id: &str) -> Option<RangeMetadata> {
        self.data.lock().unwrap().metadata.get(range_id).cloned()
    }

    pub fn get_resources(&self, range_id: &str) -> Option<RangeResources> {
        self.data.lock().unwrap().resources.get(range_id).cloned()
    }

    /// All known ranges, sorted by range id for stable `list` output.
    pub fn list(&self, include_destroyed: bool) -> Vec<RangeMetadata> {
        let data = self.data.lock().unwrap();
        let mut out: Vec<RangeMetadata> = data
            .metadata
            .values()
            .filter(|m| include_destroyed || m.status != RangeStatus::Destroyed)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.range_id.cmp(&b.range_id));
        out
    }

    /// Inserts fresh metadata for a range that must not already exist —
    /// creating over an id already in the registry is rejected.
    /// Persists immediately so a crash right after this call still leaves
    /// the range visible in CREATING on restart.
    pub fn insert_new(&self, metadata: RangeMetadata) -> Result<(), RangeError> {
        {
            let mut data = self.data.lock().unwrap();
            if data.metadata.contains_key(&metadata.range_id) {
                return Err(RangeError::RangeExists {
                    range_id: metadata.range_id,
                });
            }
            data.metadata.insert(metadata.range_id.clone(), metadata.clone());
            data.resources
                .insert(metadata.range_id.clone(), RangeResources::default());
        }
        self.persist()
    }

    /// Mutates one range's metadata in place and persists the result.
    /// No-ops (returning `RangeNotFound`) if the id is unknown.
    pub fn update_metadata(
        &self,
        range_id: &str,
        f: impl FnOnce(&mut RangeMetadata),
    ) -> Result<(), RangeError> {
        {
            let mut data = self.data.lock().unwrap();
            let entry = data
                .metadata
                .get_mut(range_id)
                .ok_or_else(|| RangeError::RangeNotFound {
                    range_id: range_id.to_string(),
                })?;
            f(entry);
        }
        self.persist()
    }

    pub fn update_resources(
        &self,
        range_id: &str,
        f: impl FnOnce(&mut RangeResources),
    ) -> Result<(), RangeError> {
        {
            let mut data = self.data.lock().unwrap();
            let entry = data.resources.entry(range_id.to_string()).or_default();
            f(entry);
        }
        self.persist()
    }

    /// Removes a range's metadata and resources entirely (`rm`).
    pub fn remove(&self, range_id: &str) -> Result<(), RangeError> {
        {
            let mut data = self.data.lock().unwrap();
            if data.metadata.remove(range_id).is_none() {
                return Err(RangeError::RangeNotFound {
                    range_id: range_id.to_string(),
                });
            }
            data.resources.remove(range_id);
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), RangeError> {
        let data = self.data.lock().unwrap();
        write_json(&paths::metadata_file(&self.cyber_range_dir), &data.metadata)?;
        write_json(&paths::resources_file(&self.cyber_range_dir), &data.resources)?;
        Ok(())
    }
}

fn load_json<T: facet::Facet<'static>>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match facet_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse registry file, starting empty");
            None
        }
    }
}

fn write_json<T: facet::Facet<'static>>(path: &Path, value: &T) -> Result<(), RangeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RangeError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    let json = facet_json::to_string(value);
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|e| RangeError::Io {
        context: format!("writing {}", tmp_path.display()),
        source: e,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| RangeError::Io {
        context: format!("renaming {} to {}", tmp_path.display(), path.display()),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_metadata(range_id: &str) -> RangeMetadata {
        RangeMetadata {
            range_id: range_id.to_string(),
            display_name: range_id.to_string(),
            description: String::new(),
            created_at: "2026-01-01T00-00-00".into(),
            last_modified: "2026-01-01T00-00-00".into(),
            owner: "tester".into(),
            tags: Map::new(),
            status: RangeStatus::Creating,
            provider_uri: None,
            ip_assignments: Map::new(),
            task_results: vec![],
        }
    }

    #[test]
    fn insert_and_persist_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path());
        registry.insert_new(sample_metadata("101")).unwrap();
        assert!(registry.exists("101"));

        let reloaded = Registry::load(dir.path());
        assert!(reloaded.exists("101"));
        assert_eq!(reloaded.get_metadata("101").unwrap().status, RangeStatus::Creating);
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path());
        registry.insert_new(sample_metadata("101")).unwrap();
        let err = registry.insert_new(sample_metadata("101")).unwrap_err();
        assert!(matches!(err, RangeError::RangeExists { .. }));
    }

    #[test]
    fn update_status_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path());
        registry.insert_new(sample_metadata("101")).unwrap();
        registry
            .update_metadata("101", |m| m.status = RangeStatus::Active)
            .unwrap();

        let reloaded = Registry::load(dir.path());
        assert_eq!(reloaded.get_metadata("101").unwrap().status, RangeStatus::Active);
    }

    #[test]
    fn update_missing_range_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path());
        let err = registry.update_metadata("nope", |_| {}).unwrap_err();
        assert!(matches!(err, RangeError::RangeNotFound { .. }));
    }

    #[test]
    fn remove_deletes_metadata_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path());
        registry.insert_new(sample_metadata("101")).unwrap();
        registry.remove("101").unwrap();
        assert!(!registry.exists("101"));

        let reloaded = Registry::load(dir.path());
        assert!(!reloaded.exists("101"));
    }

    #[test]
    fn list_excludes_destroyed_unless_requested() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(dir.path());
        registry.insert_new(sample_metadata("101")).unwrap();
        registry
            .update_metadata("101", |m| m.status = RangeStatus::Destroyed)
            .unwrap();

        assert!(registry.list(false).is_empty());
        assert_eq!(registry.list(true).len(), 1);
    }

    #[test]
    fn corrupt_metadata_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(paths::metadata_file(dir.path()), "{not valid json").unwrap();
        let registry = Registry::load(dir.path());
        assert!(registry.list(true).is_empty());
    }
}
