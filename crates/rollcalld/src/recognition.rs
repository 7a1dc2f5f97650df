//! Live recognition: detect, classify, gate and log, one frame at a time.

use crate::jobs::{JobError, StopFlag};
use chrono::Local;
use rollcall_core::{
    Classifier, EventSink, FaceDetector, LabelMapArtifact, LabelNames, PipelineError,
    RecognitionEventPipeline,
};
use rollcall_hw::FrameSource;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub model_path: PathBuf,
    pub names_path: PathBuf,
    pub log_path: PathBuf,
    pub location: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecognitionSummary {
    pub frames: u64,
    /// Frames skipped because they were too dark to detect in.
    pub dark: u64,
    pub faces: u64,
    /// Faces whose prediction held no usable probability.
    pub skipped: u64,
    pub events: u64,
    pub stopped: bool,
    pub capture_error: Option<String>,
}

/// Load the label names for a session and compare them with the last build.
///
/// A disagreement is only a warning: the names file may have been edited on
/// purpose, but labels that no longer line up with the model are worth a
/// loud hint.
pub fn load_label_names(names_path: &Path, dataset_path: &Path) -> Result<LabelNames, JobError> {
    let names = LabelNames::load(names_path)?;
    if names.is_empty() {
        tracing::warn!(path = %names_path.display(), "no label names; every face resolves to Unknown");
    }

    let sidecar = LabelMapArtifact::path_for(dataset_path);
    match LabelMapArtifact::load(&sidecar) {
        Ok(artifact) => match artifact.mismatch(&names) {
            Some(reason) => tracing::warn!(
                names = %names_path.display(),
                build = %sidecar.display(),
                %reason,
                "label names disagree with the last dataset build"
            ),
            None => tracing::debug!(fingerprint = %artifact.fingerprint, "label names match last build"),
        },
        Err(e) => tracing::debug!(error = %e, "no label map from a previous build to compare against"),
    }
    Ok(names)
}

/// Run the sequential detect -> predict -> log loop until stopped.
///
/// A camera failure ends the session without error. Dark frames and faces
/// with an empty or all-NaN prediction are skipped. A classifier whose
/// output does not match the label names is a configuration error and
/// aborts the session.
pub fn run_recognition<F, D, C, S>(
    source: &mut F,
    detector: &mut D,
    classifier: &mut C,
    pipeline: &mut RecognitionEventPipeline<S>,
    location: &str,
    stop: &StopFlag,
) -> Result<RecognitionSummary, JobError>
where
    F: FrameSource + ?Sized,
    D: FaceDetector + ?Sized,
    C: Classifier + ?Sized,
    S: EventSink,
{
    let mut summary = RecognitionSummary::default();
    tracing::info!(
        location,
        threshold = pipeline.config().confidence_threshold,
        labels = pipeline.names().len(),
        "recognition started"
    );

    loop {
        if stop.is_raised() {
            summary.stopped = true;
            break;
        }
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "camera failed; ending recognition");
                summary.capture_error = Some(e.to_string());
                break;
            }
        };
        summary.frames += 1;
        let frame_sequence = frame.sequence;
        if frame.is_dark() {
            summary.dark += 1;
            continue;
        }
        let Some(image) = frame.into_image() else {
            continue;
        };

        for face in detector.detect(&image)? {
            let Some(crop) = rollcall_hw::crop(&image, face.x, face.y, face.width, face.height) else {
                continue;
            };
            summary.faces += 1;
            let probabilities = classifier.predict(&crop)?;
            let observation = match pipeline.observe_probabilities(&probabilities, location, Local::now()) {
                Ok(observation) => observation,
                Err(PipelineError::EmptyPrediction) => {
                    tracing::warn!(frame = frame_sequence, "classifier gave no usable probability; face skipped");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            tracing::debug!(
                label = observation.label_index,
                name = %observation.display_name,
                confidence = observation.confidence,
                logged = observation.event.is_some(),
                "face"
            );
            if observation.event.is_some() {
                summary.events += 1;
            }
        }
    }

    tracing::info!(
        frames = summary.frames,
        dark = summary.dark,
        faces = summary.faces,
        skipped = summary.skipped,
        events = summary.events,
        stopped = summary.stopped,
        "recognition finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeClassifier, FakeDetector, FakeFrames};
    use rollcall_core::{BoundingBox, PipelineConfig, RecognitionEvent};
    use std::collections::BTreeMap;

    fn face(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 5.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
        }
    }

    fn pipeline(labels: usize) -> RecognitionEventPipeline<Vec<RecognitionEvent>> {
        let names = (0..labels).map(|i| (i, format!("P{i}"))).collect::<BTreeMap<_, _>>();
        RecognitionEventPipeline::new(LabelNames::from_map(names), PipelineConfig::default(), Vec::new())
    }

    #[test]
    fn test_camera_failure_ends_gracefully() {
        let mut p = pipeline(2);
        let summary = run_recognition(
            &mut FakeFrames::new(3, 100, 80),
            &mut FakeDetector::always(face(0.0)),
            &mut FakeClassifier::fixed(vec![0.1, 0.9]),
            &mut p,
            "Lobby",
            &StopFlag::default(),
        )
        .unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.faces, 3);
        // Same label three times in quick succession: only the first is logged.
        assert_eq!(summary.events, 1);
        assert!(summary.capture_error.is_some());
        assert_eq!(p.sink()[0].display_name, "P1");
        assert_eq!(p.sink()[0].location, "Lobby");
    }

    #[test]
    fn test_faces_in_one_frame_observed_independently() {
        let mut p = pipeline(2);
        let mut classifier = FakeClassifier::sequence(vec![vec![0.8, 0.2], vec![0.3, 0.7]]);
        let summary = run_recognition(
            &mut FakeFrames::new(1, 100, 80),
            &mut FakeDetector::new(vec![vec![face(0.0), face(50.0)]]),
            &mut classifier,
            &mut p,
            "Gate",
            &StopFlag::default(),
        )
        .unwrap();
        assert_eq!(summary.events, 2);
        let ids: Vec<_> = p.sink().iter().map(|e| e.person_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1"]);
    }

    #[test]
    fn test_class_count_mismatch_aborts() {
        let mut p = pipeline(2);
        let err = run_recognition(
            &mut FakeFrames::new(2, 100, 80),
            &mut FakeDetector::always(face(0.0)),
            &mut FakeClassifier::fixed(vec![0.2, 0.3, 0.5]),
            &mut p,
            "Gate",
            &StopFlag::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            JobError::Pipeline(PipelineError::ClassCountMismatch { expected: 2, actual: 3 })
        ));
        assert!(p.sink().is_empty());
    }

    #[test]
    fn test_nan_prediction_skips_face_and_continues() {
        let mut p = pipeline(2);
        let summary = run_recognition(
            &mut FakeFrames::new(3, 100, 80),
            &mut FakeDetector::always(face(0.0)),
            &mut FakeClassifier::fixed(vec![f32::NAN, f32::NAN]),
            &mut p,
            "Gate",
            &StopFlag::default(),
        )
        .unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.faces, 3);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.events, 0);
        assert!(summary.capture_error.is_some());
        assert!(p.sink().is_empty());
    }

    #[test]
    fn test_dark_frames_are_skipped() {
        let mut p = pipeline(2);
        let summary = run_recognition(
            &mut FakeFrames::levels(vec![5, 128, 0], 100, 80),
            &mut FakeDetector::always(face(0.0)),
            &mut FakeClassifier::fixed(vec![0.1, 0.9]),
            &mut p,
            "Gate",
            &StopFlag::default(),
        )
        .unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.dark, 2);
        assert_eq!(summary.faces, 1);
        assert_eq!(summary.events, 1);
    }

    #[test]
    fn test_stop_checked_before_each_frame() {
        let stop = StopFlag::default();
        stop.raise();
        let summary = run_recognition(
            &mut FakeFrames::new(10, 100, 80),
            &mut FakeDetector::always(face(0.0)),
            &mut FakeClassifier::fixed(vec![0.1, 0.9]),
            &mut pipeline(2),
            "Gate",
            &stop,
        )
        .unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.frames, 0);
    }

    #[test]
    fn test_load_label_names_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let names = load_label_names(&dir.path().join("names.json"), &dir.path().join("ds.bin")).unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn test_load_label_names_reads_post_build_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        std::fs::write(&path, r#"{"0": "Alice", "1": "Bob"}"#).unwrap();
        let names = load_label_names(&path, &dir.path().join("ds.bin")).unwrap();
        assert_eq!(names.resolve(1), "Bob");
    }
}
