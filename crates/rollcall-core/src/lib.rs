//! rollcall-core: Identity, label and recognition-event management.
//!
//! Owns the identity registry, the label map shared by training and
//! recognition, dataset builds, and the pipeline that turns classifier
//! output into an append-only recognition log. Face detection and
//! classification run through ONNX Runtime behind small traits.

pub mod classifier;
pub mod dataset;
pub mod detector;
pub mod eventlog;
pub mod inspect;
pub mod labels;
pub mod persist;
pub mod pipeline;
pub mod registry;
pub mod types;

pub use classifier::{Classifier, ClassifierError, OnnxClassifier};
pub use dataset::{BuildOutput, Dataset, DatasetBuilder, DatasetError, DirectorySource, SampleSource};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use eventlog::{EventSink, RecognitionEvent, RecognitionLog};
pub use labels::{LabelMap, LabelMapArtifact, LabelNames};
pub use pipeline::{PipelineConfig, PipelineError, RecognitionEventPipeline};
pub use registry::{IdentityRegistry, RegistryError};
pub use types::{BoundingBox, LabelIndex, PersonId, Prediction, Resolution};
