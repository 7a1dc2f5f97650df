//! Dataset inspection and registry repair.
//!
//! Reports what a build would see (persons, readable sample counts, names
//! and the label each person would receive) by running the builder's own
//! loading step, and can rebuild the registry from the directories present.

use crate::dataset::{DatasetBuilder, DatasetError, DirectorySource};
use crate::registry::{default_name, IdentityRegistry, RegistryError};
use crate::types::{LabelIndex, PersonId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Something a build would silently paper over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    /// Directory exists but the registry has no name; the build falls back to "Person <id>".
    MissingName { person_id: PersonId },
    /// Registry entry without a sample directory.
    OrphanName { person_id: PersonId },
    /// Directory without a readable sample; the person gets no label.
    EmptyCollection { person_id: PersonId },
    /// Entry in the sample root that is not a `personN` directory.
    InvalidDirectory { name: String },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::MissingName { person_id } => {
                write!(f, "directory person{person_id} has no entry in the registry")
            }
            Issue::OrphanName { person_id } => {
                write!(f, "registry entry for id {person_id} has no directory")
            }
            Issue::EmptyCollection { person_id } => {
                write!(f, "directory person{person_id} contains no readable samples")
            }
            Issue::InvalidDirectory { name } => write!(f, "invalid directory name: {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonSummary {
    pub person_id: PersonId,
    pub display_name: String,
    /// Readable samples.
    pub samples: usize,
    pub unreadable: usize,
    /// Label the next build would assign, `None` for empty collections.
    pub label_index: Option<LabelIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetReport {
    pub persons: Vec<PersonSummary>,
    pub issues: Vec<Issue>,
}

impl DatasetReport {
    pub fn total_samples(&self) -> usize {
        self.persons.iter().map(|p| p.samples).sum()
    }

    pub fn num_classes(&self) -> usize {
        self.persons.iter().filter(|p| p.label_index.is_some()).count()
    }
}

/// Inspect a sample root against a registry.
pub fn inspect(source: &DirectorySource, registry: &IdentityRegistry) -> Result<DatasetReport, DatasetError> {
    let scan = source.scan()?;
    let mut issues: Vec<Issue> = scan
        .skipped
        .iter()
        .map(|name| Issue::InvalidDirectory { name: name.clone() })
        .collect();

    let loaded = DatasetBuilder::default().load(source)?;
    for person in &loaded.persons {
        if person.images.is_empty() {
            issues.push(Issue::EmptyCollection {
                person_id: person.person_id,
            });
        }
        if !registry.contains(person.person_id) {
            issues.push(Issue::MissingName {
                person_id: person.person_id,
            });
        }
    }

    for (person, _) in registry.iter() {
        if !loaded.persons.iter().any(|p| p.person_id == person) {
            issues.push(Issue::OrphanName { person_id: person });
        }
    }

    let persons = loaded
        .persons
        .iter()
        .map(|p| PersonSummary {
            person_id: p.person_id,
            display_name: registry.resolve(p.person_id),
            samples: p.images.len(),
            unreadable: p.unreadable,
            label_index: loaded.label_map.label_of(p.person_id),
        })
        .collect();

    Ok(DatasetReport { persons, issues })
}

/// Rewrite the registry from the directories present: known names are kept,
/// unknown persons get the default name, entries without a directory are dropped.
pub fn rebuild_registry(
    source: &DirectorySource,
    registry: &mut IdentityRegistry,
) -> Result<usize, RebuildError> {
    let scan = source.scan()?;
    let names: BTreeMap<PersonId, String> = scan
        .persons
        .iter()
        .map(|(id, _)| {
            let name = registry
                .get(*id)
                .map(str::to_string)
                .unwrap_or_else(|| default_name(*id));
            (*id, name)
        })
        .collect();
    let count = names.len();
    registry.replace_all(names)?;
    tracing::info!(path = %registry.path().display(), entries = count, "registry rebuilt from sample directories");
    Ok(count)
}

#[derive(thiserror::Error, Debug)]
pub enum RebuildError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
