//! Durable `person_id -> display_name` registry.
//!
//! Stored as a flat JSON object with string keys (`{"1": "Alice"}`).
//! Loading never fails: a missing file is an empty registry and unparseable
//! content is reset to empty with a warning. Every mutation rewrites the
//! whole file atomically before returning.

use crate::persist::write_atomic;
use crate::types::PersonId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to write registry {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fallback display name for a person without a registry entry.
pub fn default_name(person_id: PersonId) -> String {
    format!("Person {person_id}")
}

/// Identity registry bound to one file on disk.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    path: PathBuf,
    names: BTreeMap<PersonId, String>,
}

impl IdentityRegistry {
    /// Load the registry at `path`, degrading to an empty mapping on any
    /// read or parse failure.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let names = match std::fs::read_to_string(&path) {
            Ok(text) => parse_names(&path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "registry file not found; starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "registry unreadable; resetting to empty");
                BTreeMap::new()
            }
        };

        tracing::info!(path = %path.display(), entries = names.len(), "identity registry loaded");
        Self { path, names }
    }

    /// An empty registry that will persist to `path` on first mutation.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            names: BTreeMap::new(),
        }
    }

    /// Upsert a name and flush the whole mapping to disk.
    pub fn set(&mut self, person_id: PersonId, display_name: &str) -> Result<(), RegistryError> {
        let previous = self.names.insert(person_id, display_name.to_string());
        if let Some(old) = previous.as_deref().filter(|old| *old != display_name) {
            tracing::info!(person_id, old, new = display_name, "registry name overwritten");
        }
        self.save()
    }

    /// Replace the whole mapping and flush it to disk.
    pub fn replace_all(&mut self, names: BTreeMap<PersonId, String>) -> Result<(), RegistryError> {
        self.names = names;
        self.save()
    }

    /// Stored name for `person_id`, or `"Person <id>"`.
    pub fn resolve(&self, person_id: PersonId) -> String {
        self.names
            .get(&person_id)
            .cloned()
            .unwrap_or_else(|| default_name(person_id))
    }

    pub fn get(&self, person_id: PersonId) -> Option<&str> {
        self.names.get(&person_id).map(String::as_str)
    }

    pub fn contains(&self, person_id: PersonId) -> bool {
        self.names.contains_key(&person_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PersonId, &str)> {
        self.names.iter().map(|(id, name)| (*id, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), RegistryError> {
        let on_disk: BTreeMap<String, &str> = self
            .names
            .iter()
            .map(|(id, name)| (id.to_string(), name.as_str()))
            .collect();
        let json = serde_json::to_vec(&on_disk)?;
        write_atomic(&self.path, &json).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), entries = self.names.len(), "registry saved");
        Ok(())
    }
}

fn parse_names(path: &Path, text: &str) -> BTreeMap<PersonId, String> {
    if text.trim().is_empty() {
        return BTreeMap::new();
    }

    let raw: BTreeMap<String, String> = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "registry is not valid JSON; resetting to empty");
            return BTreeMap::new();
        }
    };

    raw.into_iter()
        .filter_map(|(key, name)| match key.trim().parse::<PersonId>() {
            Ok(id) => Some((id, name)),
            Err(_) => {
                tracing::warn!(path = %path.display(), key, "skipping registry entry with non-numeric id");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = IdentityRegistry::load(dir.path().join("absent.json"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, "{\"1\": \"Alice\",,").unwrap();
        let reg = IdentityRegistry::load(&path);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_load_blank_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, "  \n").unwrap();
        assert!(IdentityRegistry::load(&path).is_empty());
    }

    #[test]
    fn test_load_skips_non_numeric_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, r#"{"1": "Alice", "abc": "Nobody"}"#).unwrap();
        let reg = IdentityRegistry::load(&path);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(1), Some("Alice"));
    }

    #[test]
    fn test_set_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        let mut reg = IdentityRegistry::load(&path);
        reg.set(7, "Grace").unwrap();

        let reloaded = IdentityRegistry::load(&path);
        assert_eq!(reloaded.get(7), Some("Grace"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["7"], "Grace");
    }

    #[test]
    fn test_set_overwrites_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        let mut reg = IdentityRegistry::load(&path);
        reg.set(1, "Alice").unwrap();
        reg.set(1, "Alicia").unwrap();
        assert_eq!(IdentityRegistry::load(&path).get(1), Some("Alicia"));
    }

    #[test]
    fn test_corrupt_file_recovers_on_next_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, "not json").unwrap();
        let mut reg = IdentityRegistry::load(&path);
        reg.set(2, "Bob").unwrap();
        let reloaded = IdentityRegistry::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(2), Some("Bob"));
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = IdentityRegistry::load(dir.path().join("n.json"));
        reg.set(1, "Alice").unwrap();
        assert_eq!(reg.resolve(1), "Alice");
        assert_eq!(reg.resolve(42), "Person 42");
    }
}
