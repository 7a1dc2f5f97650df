//! The label map: the contract between training and recognition.
//!
//! Label indices are dense and assigned in ascending `person_id` order, so the
//! assignment is a pure function of the set of persons present. The derived
//! [`LabelNames`] lookup is what recognition reads; [`LabelMapArtifact`] keeps
//! the full `person_id <-> label_index` pairing next to the dataset so a
//! names file can be checked against the build that produced the model.

use crate::persist::write_atomic;
use crate::registry::IdentityRegistry;
use crate::types::{LabelIndex, PersonId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name shown for label indices the lookup does not know.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed label file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bidirectional `person_id <-> label_index` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelMap {
    /// `persons[label_index] == person_id`, ascending.
    persons: Vec<PersonId>,
}

impl LabelMap {
    /// Assign labels to the given persons: sort ascending, drop duplicates,
    /// number from zero. Input order does not matter.
    pub fn from_person_ids(ids: impl IntoIterator<Item = PersonId>) -> Self {
        let mut persons: Vec<PersonId> = ids.into_iter().collect();
        persons.sort_unstable();
        persons.dedup();
        Self { persons }
    }

    /// Rebuild from persisted pairs, rejecting gaps or duplicate labels.
    pub fn from_pairs(pairs: &[(PersonId, LabelIndex)]) -> Option<Self> {
        let mut persons = vec![None; pairs.len()];
        for &(person, label) in pairs {
            let slot = persons.get_mut(label)?;
            if slot.is_some() {
                return None;
            }
            *slot = Some(person);
        }
        let persons: Vec<PersonId> = persons.into_iter().collect::<Option<_>>()?;
        let map = Self::from_person_ids(persons.iter().copied());
        (map.persons == persons).then_some(map)
    }

    pub fn label_of(&self, person_id: PersonId) -> Option<LabelIndex> {
        self.persons.binary_search(&person_id).ok()
    }

    pub fn person_of(&self, label: LabelIndex) -> Option<PersonId> {
        self.persons.get(label).copied()
    }

    pub fn num_classes(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    /// `(person_id, label_index)` pairs in label order.
    pub fn pairs(&self) -> Vec<(PersonId, LabelIndex)> {
        self.persons
            .iter()
            .enumerate()
            .map(|(label, &person)| (person, label))
            .collect()
    }

    /// Resolve every label through the registry.
    pub fn names(&self, registry: &IdentityRegistry) -> LabelNames {
        LabelNames {
            names: self
                .persons
                .iter()
                .enumerate()
                .map(|(label, &person)| (label, registry.resolve(person)))
                .collect(),
        }
    }

    /// Hex SHA-256 over the label assignment. Equal maps hash equal.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (person, label) in self.pairs() {
            hasher.update((label as u64).to_le_bytes());
            hasher.update((person as u64).to_le_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Derived `label_index -> display_name` lookup consumed by recognition.
///
/// On disk this is a JSON object with string keys (`{"0": "Alice"}`), written
/// to the same path as the identity registry by default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelNames {
    names: BTreeMap<LabelIndex, String>,
}

impl LabelNames {
    pub fn from_map(names: BTreeMap<LabelIndex, String>) -> Self {
        Self { names }
    }

    /// Load a post-build name file. A missing file yields an empty lookup
    /// with a warning; malformed content is an error.
    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "label name file not found; every label resolves to Unknown");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(LabelError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let raw: BTreeMap<String, String> =
            serde_json::from_str(&text).map_err(|e| LabelError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut names = BTreeMap::new();
        for (key, name) in raw {
            let label: LabelIndex = key.trim().parse().map_err(|_| LabelError::Malformed {
                path: path.to_path_buf(),
                reason: format!("key {key:?} is not a label index"),
            })?;
            names.insert(label, name);
        }
        Ok(Self { names })
    }

    pub fn save(&self, path: &Path) -> Result<(), LabelError> {
        let on_disk: BTreeMap<String, &str> = self
            .names
            .iter()
            .map(|(label, name)| (label.to_string(), name.as_str()))
            .collect();
        let json = serde_json::to_vec(&on_disk)?;
        write_atomic(path, &json).map_err(|source| LabelError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, label: LabelIndex) -> Option<&str> {
        self.names.get(&label).map(String::as_str)
    }

    /// Display name for `label`, or [`UNKNOWN_NAME`].
    pub fn resolve(&self, label: LabelIndex) -> &str {
        self.get(label).unwrap_or(UNKNOWN_NAME)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LabelIndex, &str)> {
        self.names.iter().map(|(l, n)| (*l, n.as_str()))
    }

    /// String-keyed view, matching the on-disk schema.
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.names
            .iter()
            .map(|(l, n)| (l.to_string(), n.clone()))
            .collect()
    }
}

/// One row of the label-map sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub person_id: PersonId,
    pub label_index: LabelIndex,
    pub display_name: String,
}

/// Persisted label map with resolved names and fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapArtifact {
    pub fingerprint: String,
    pub built_at: chrono::DateTime<chrono::Utc>,
    pub entries: Vec<LabelEntry>,
}

impl LabelMapArtifact {
    pub fn new(map: &LabelMap, names: &LabelNames) -> Self {
        let entries = map
            .pairs()
            .into_iter()
            .map(|(person_id, label_index)| LabelEntry {
                person_id,
                label_index,
                display_name: names.resolve(label_index).to_string(),
            })
            .collect();
        Self {
            fingerprint: map.fingerprint(),
            built_at: chrono::Utc::now(),
            entries,
        }
    }

    /// Sidecar path for a dataset artifact: `face_dataset.bin` -> `face_dataset.labels.json`.
    pub fn path_for(dataset_path: &Path) -> PathBuf {
        dataset_path.with_extension("labels.json")
    }

    pub fn save(&self, path: &Path) -> Result<(), LabelError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json).map_err(|source| LabelError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, LabelError> {
        let text = std::fs::read_to_string(path).map_err(|source| LabelError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| LabelError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn label_map(&self) -> Option<LabelMap> {
        let pairs: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.person_id, e.label_index))
            .collect();
        LabelMap::from_pairs(&pairs)
    }

    pub fn names(&self) -> LabelNames {
        LabelNames::from_map(
            self.entries
                .iter()
                .map(|e| (e.label_index, e.display_name.clone()))
                .collect(),
        )
    }

    /// Describe how `names` disagrees with this build, if it does.
    pub fn mismatch(&self, names: &LabelNames) -> Option<String> {
        if names.len() != self.entries.len() {
            return Some(format!(
                "name file has {} labels, last build produced {}",
                names.len(),
                self.entries.len()
            ));
        }
        self.entries.iter().find_map(|e| {
            let found = names.resolve(e.label_index);
            (found != e.display_name).then(|| {
                format!(
                    "label {} is {:?} in the name file but {:?} (person {}) in the last build",
                    e.label_index, found, e.display_name, e.person_id
                )
            })
        })
    }
}
