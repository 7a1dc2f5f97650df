//! Dataset builds from per-person sample collections.
//!
//! A build enumerates persons, assigns labels through [`LabelMap`], loads and
//! normalizes every sample to one resolution, shuffles, and splits 80/20.
//! The same builder backs training jobs, the CLI and dataset inspection so
//! there is exactly one label assignment in the system.

use crate::labels::{LabelError, LabelMap, LabelMapArtifact, LabelNames};
use crate::persist::write_atomic;
use crate::registry::IdentityRegistry;
use crate::types::{LabelIndex, PersonId, Resolution};
use image::imageops::FilterType;
use image::GrayImage;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Percentage of shuffled samples placed in the train split.
pub const TRAIN_PERCENT: usize = 80;

/// Minimum distinct labels a classifier can be trained on.
pub const MIN_CLASSES: usize = 2;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("sample directory not found: {0}")]
    SourceMissing(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no samples found; collect face data first")]
    NoSamples,
    #[error("need at least 2 persons with samples to train, found {found}")]
    InsufficientClasses { found: usize },
    #[error("failed to encode dataset: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode dataset {path}: {source}")]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },
    #[error(transparent)]
    Labels(#[from] LabelError),
}

/// A single sample that could not be loaded. Builds skip and count these.
#[derive(Error, Debug)]
#[error("unreadable sample {path}: {reason}")]
pub struct SampleError {
    pub path: PathBuf,
    pub reason: String,
}

/// Anything that can enumerate persons and hand out their face samples.
pub trait SampleSource {
    /// Persons with a sample collection, in any order.
    fn persons(&self) -> Result<Vec<PersonId>, DatasetError>;

    /// Every sample for `person`. An `Err` element is one unreadable sample.
    fn samples(&self, person: PersonId) -> Result<Vec<Result<GrayImage, SampleError>>, DatasetError>;
}

fn person_dir_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^person(0|[1-9][0-9]*)$").expect("person dir pattern"))
}

fn sample_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^face([0-9]+)\.(?i:jpe?g|png)$").expect("sample file pattern")
    })
}

/// Parse a strict `personN` directory name.
pub fn parse_person_dir(name: &str) -> Option<PersonId> {
    let caps = person_dir_pattern().captures(name)?;
    caps[1].parse().ok()
}

/// Parse a `face<N>.jpg` sample file name into its sample index.
pub fn parse_sample_file(name: &str) -> Option<u32> {
    let caps = sample_file_pattern().captures(name)?;
    caps[1].parse().ok()
}

/// Directory name for a person's samples.
pub fn person_dir_name(person: PersonId) -> String {
    format!("person{person}")
}

/// Result of scanning a sample root.
#[derive(Debug, Clone, Default)]
pub struct DirectoryScan {
    /// `(person_id, directory)` sorted by person id.
    pub persons: Vec<(PersonId, PathBuf)>,
    /// Entry names that were not valid person directories.
    pub skipped: Vec<String>,
}

/// `root/person<N>/face<M>.jpg` layout on disk.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn person_dir(&self, person: PersonId) -> PathBuf {
        self.root.join(person_dir_name(person))
    }

    /// Enumerate person directories. Non-matching entries are skipped with a warning.
    pub fn scan(&self) -> Result<DirectoryScan, DatasetError> {
        if !self.root.is_dir() {
            return Err(DatasetError::SourceMissing(self.root.clone()));
        }
        let entries = std::fs::read_dir(&self.root).map_err(|source| DatasetError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut scan = DirectoryScan::default();
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() {
                continue;
            }
            match parse_person_dir(&name) {
                Some(id) => scan.persons.push((id, entry.path())),
                None => {
                    tracing::warn!(entry = %name, "skipping directory that does not match personN");
                    scan.skipped.push(name);
                }
            }
        }
        scan.persons.sort_by_key(|(id, _)| *id);
        scan.skipped.sort();
        Ok(scan)
    }

    /// Sample files of one person as `(sample_index, path)`, ascending.
    pub fn sample_files(&self, person: PersonId) -> Result<Vec<(u32, PathBuf)>, DatasetError> {
        let dir = self.person_dir(person);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(DatasetError::Io { path: dir, source }),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(parse_sample_file) {
                files.push((index, entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Index for the next sample written for `person`; existing samples are never overwritten.
    pub fn next_sample_index(&self, person: PersonId) -> Result<u32, DatasetError> {
        Ok(self
            .sample_files(person)?
            .last()
            .map(|(i, _)| i + 1)
            .unwrap_or(0))
    }

    /// Path for sample `index` of `person`.
    pub fn sample_path(&self, person: PersonId, index: u32) -> PathBuf {
        self.person_dir(person).join(format!("face{index}.jpg"))
    }
}

impl SampleSource for DirectorySource {
    fn persons(&self) -> Result<Vec<PersonId>, DatasetError> {
        Ok(self.scan()?.persons.into_iter().map(|(id, _)| id).collect())
    }

    fn samples(&self, person: PersonId) -> Result<Vec<Result<GrayImage, SampleError>>, DatasetError> {
        Ok(self
            .sample_files(person)?
            .into_iter()
            .map(|(_, path)| match image::open(&path) {
                Ok(img) => Ok(img.to_luma8()),
                Err(e) => Err(SampleError {
                    path,
                    reason: e.to_string(),
                }),
            })
            .collect())
    }
}

/// Train/test split of flattened grayscale samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub resolution: Resolution,
    pub train_images: Vec<Vec<u8>>,
    pub train_labels: Vec<LabelIndex>,
    pub test_images: Vec<Vec<u8>>,
    pub test_labels: Vec<LabelIndex>,
    /// `(person_id, label_index)` pairs used for this build.
    pub label_pairs: Vec<(PersonId, LabelIndex)>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.train_labels.len() + self.test_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> usize {
        self.label_pairs.len()
    }

    pub fn label_map(&self) -> Option<LabelMap> {
        LabelMap::from_pairs(&self.label_pairs)
    }

    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let bytes = bincode::serialize(self).map_err(DatasetError::Encode)?;
        write_atomic(path, &bytes).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let bytes = std::fs::read(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::deserialize(&bytes).map_err(|source| DatasetError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Counters from one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub persons: usize,
    pub samples: usize,
    pub unreadable: usize,
    pub resized: usize,
    /// Persons whose collection held no readable sample; they get no label.
    pub empty_persons: Vec<PersonId>,
}

/// Everything a build produces.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub dataset: Dataset,
    pub label_map: LabelMap,
    pub names: LabelNames,
    pub report: BuildReport,
}

impl BuildOutput {
    /// Write the dataset, the label-name file and the label-map sidecar.
    ///
    /// `names_path` is usually the registry path: after a build it holds the
    /// `label_index -> display_name` schema that recognition reads.
    pub fn persist(&self, dataset_path: &Path, names_path: &Path) -> Result<(), DatasetError> {
        self.dataset.save(dataset_path)?;
        self.names.save(names_path)?;
        let artifact = LabelMapArtifact::new(&self.label_map, &self.names);
        artifact.save(&LabelMapArtifact::path_for(dataset_path))?;

        tracing::info!(
            dataset = %dataset_path.display(),
            names = %names_path.display(),
            fingerprint = %artifact.fingerprint,
            "dataset artifacts written"
        );
        Ok(())
    }
}

/// Decoded samples of one person.
#[derive(Debug, Clone)]
pub struct PersonSamples {
    pub person_id: PersonId,
    /// Normalized, flattened images.
    pub images: Vec<Vec<u8>>,
    pub unreadable: usize,
}

/// Output of [`DatasetBuilder::load`]: every enumerated person in ascending
/// order, and the labels given to those with readable samples.
#[derive(Debug, Clone)]
pub struct LoadedSamples {
    pub persons: Vec<PersonSamples>,
    pub label_map: LabelMap,
    pub report: BuildReport,
}

/// Builds datasets at a fixed resolution.
#[derive(Debug, Clone, Default)]
pub struct DatasetBuilder {
    resolution: Resolution,
}

impl DatasetBuilder {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Enumerate persons, decode and normalize their samples, and assign
    /// labels to the persons left with at least one readable sample.
    ///
    /// Builds and dataset inspection both go through here.
    pub fn load<S: SampleSource + ?Sized>(&self, source: &S) -> Result<LoadedSamples, DatasetError> {
        let mut persons = source.persons()?;
        persons.sort_unstable();
        persons.dedup();

        let mut report = BuildReport {
            persons: persons.len(),
            ..Default::default()
        };

        let mut loaded = Vec::with_capacity(persons.len());
        for person_id in persons {
            let mut person = PersonSamples {
                person_id,
                images: Vec::new(),
                unreadable: 0,
            };
            for sample in source.samples(person_id)? {
                match sample {
                    Ok(img) => {
                        let (img, resized) = self.normalize(img);
                        report.resized += resized as usize;
                        person.images.push(img.into_raw());
                    }
                    Err(e) => {
                        tracing::warn!(person_id, error = %e, "skipping unreadable sample");
                        person.unreadable += 1;
                    }
                }
            }
            report.unreadable += person.unreadable;
            if person.images.is_empty() {
                tracing::warn!(person_id, "person has no readable samples; excluded from labels");
                report.empty_persons.push(person_id);
            }
            loaded.push(person);
        }

        let label_map = LabelMap::from_person_ids(
            loaded
                .iter()
                .filter(|p| !p.images.is_empty())
                .map(|p| p.person_id),
        );
        Ok(LoadedSamples {
            persons: loaded,
            label_map,
            report,
        })
    }

    /// Build with a thread-local random permutation.
    pub fn build<S: SampleSource + ?Sized>(
        &self,
        source: &S,
        registry: &IdentityRegistry,
    ) -> Result<BuildOutput, DatasetError> {
        self.build_with_rng(source, registry, &mut rand::thread_rng())
    }

    pub fn build_with_rng<S: SampleSource + ?Sized, R: Rng + ?Sized>(
        &self,
        source: &S,
        registry: &IdentityRegistry,
        rng: &mut R,
    ) -> Result<BuildOutput, DatasetError> {
        let LoadedSamples {
            persons: loaded,
            label_map,
            mut report,
        } = self.load(source)?;

        let mut images = Vec::new();
        let mut labels = Vec::new();
        for person in loaded {
            let Some(label) = label_map.label_of(person.person_id) else {
                continue;
            };
            labels.extend(std::iter::repeat(label).take(person.images.len()));
            images.extend(person.images);
        }
        report.samples = images.len();

        if images.is_empty() {
            return Err(DatasetError::NoSamples);
        }
        if label_map.num_classes() < MIN_CLASSES {
            return Err(DatasetError::InsufficientClasses {
                found: label_map.num_classes(),
            });
        }

        let (train, test) = split_indices(images.len(), rng);
        let pick = |idx: &[usize]| -> (Vec<Vec<u8>>, Vec<LabelIndex>) {
            idx.iter().map(|&i| (images[i].clone(), labels[i])).unzip()
        };
        let (train_images, train_labels) = pick(&train);
        let (test_images, test_labels) = pick(&test);

        let names = label_map.names(registry);

        tracing::info!(
            classes = label_map.num_classes(),
            samples = report.samples,
            train = train_labels.len(),
            test = test_labels.len(),
            unreadable = report.unreadable,
            resized = report.resized,
            "dataset built"
        );
        for (person, label) in label_map.pairs() {
            tracing::debug!(person_id = person, label, name = names.resolve(label), "label assigned");
        }

        let dataset = Dataset {
            resolution: self.resolution,
            train_images,
            train_labels,
            test_images,
            test_labels,
            label_pairs: label_map.pairs(),
        };

        Ok(BuildOutput {
            dataset,
            label_map,
            names,
            report,
        })
    }

    /// Build and write all artifacts in one step.
    pub fn build_and_persist<S: SampleSource + ?Sized>(
        &self,
        source: &S,
        registry: &IdentityRegistry,
        dataset_path: &Path,
        names_path: &Path,
    ) -> Result<BuildOutput, DatasetError> {
        let output = self.build(source, registry)?;
        output.persist(dataset_path, names_path)?;
        Ok(output)
    }

    fn normalize(&self, img: GrayImage) -> (GrayImage, bool) {
        let Resolution { width, height } = self.resolution;
        if img.dimensions() == (width, height) {
            (img, false)
        } else {
            (image::imageops::resize(&img, width, height, FilterType::Triangle), true)
        }
    }
}

/// Shuffle `0..n` and cut it at `floor(n * TRAIN_PERCENT / 100)`.
fn split_indices<R: Rng + ?Sized>(n: usize, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let train_len = n * TRAIN_PERCENT / 100;
    let test = indices.split_off(train_len);
    (indices, test)
}
