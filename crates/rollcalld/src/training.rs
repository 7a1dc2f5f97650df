//! Dataset build followed by an optional external trainer.

use crate::jobs::JobError;
use rollcall_core::dataset::BuildReport;
use rollcall_core::{DatasetBuilder, DirectorySource, IdentityRegistry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub data_dir: PathBuf,
    pub dataset_path: PathBuf,
    pub names_path: PathBuf,
    pub model_path: PathBuf,
    pub train_command: Option<String>,
    pub epochs: u32,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub report: BuildReport,
    pub num_classes: usize,
    pub train_samples: usize,
    pub test_samples: usize,
    pub fingerprint: String,
    /// False when no trainer is configured; the dataset is ready for one.
    pub trained: bool,
}

/// Build and persist the dataset from the current registry snapshot, then
/// hand it to the trainer.
pub fn run_training(plan: &TrainingPlan, registry: &IdentityRegistry) -> Result<TrainingOutcome, JobError> {
    let source = DirectorySource::new(&plan.data_dir);
    let output = DatasetBuilder::default().build_and_persist(
        &source,
        registry,
        &plan.dataset_path,
        &plan.names_path,
    )?;

    let mut outcome = TrainingOutcome {
        report: output.report.clone(),
        num_classes: output.label_map.num_classes(),
        train_samples: output.dataset.train_labels.len(),
        test_samples: output.dataset.test_labels.len(),
        fingerprint: output.label_map.fingerprint(),
        trained: false,
    };

    match plan.train_command.as_deref() {
        Some(command) => {
            run_trainer(command, plan)?;
            outcome.trained = true;
            tracing::info!(model = %plan.model_path.display(), "training finished");
        }
        None => tracing::info!(
            dataset = %plan.dataset_path.display(),
            "no train_command configured; dataset is ready for training"
        ),
    }
    Ok(outcome)
}

fn trainer_command(command: &str, plan: &TrainingPlan) -> Result<Command, JobError> {
    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| JobError::Trainer("train_command is empty".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(words)
        .arg(&plan.dataset_path)
        .arg(&plan.model_path)
        .arg(plan.epochs.to_string())
        .arg(plan.batch_size.to_string());
    Ok(cmd)
}

fn run_trainer(command: &str, plan: &TrainingPlan) -> Result<(), JobError> {
    let mut cmd = trainer_command(command, plan)?;
    let previous = modified(&plan.model_path);
    tracing::info!(?cmd, "starting trainer");

    let status = cmd
        .status()
        .map_err(|e| JobError::Trainer(format!("failed to start {command:?}: {e}")))?;
    if !status.success() {
        return Err(JobError::Trainer(format!("trainer exited with {status}")));
    }
    ensure_model(&plan.model_path, previous)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// The trainer must leave a model newer than the one present before it ran.
fn ensure_model(model_path: &Path, previous: Option<SystemTime>) -> Result<(), JobError> {
    match (modified(model_path), previous) {
        (None, _) => Err(JobError::Trainer(format!(
            "trainer succeeded but wrote no model at {}",
            model_path.display()
        ))),
        (Some(now), Some(before)) if now <= before => Err(JobError::Trainer(format!(
            "trainer succeeded but left the previous model at {} unchanged",
            model_path.display()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_person(root: &Path, person: u32, count: u32) {
        let source = DirectorySource::new(root);
        std::fs::create_dir_all(source.person_dir(person)).unwrap();
        for i in 0..count {
            GrayImage::from_pixel(92, 112, Luma([(person * 40 + i) as u8]))
                .save(source.sample_path(person, i).with_extension("png"))
                .unwrap();
        }
    }

    fn plan(root: &Path, train_command: Option<&str>) -> TrainingPlan {
        TrainingPlan {
            data_dir: root.join("face_data"),
            dataset_path: root.join("face_dataset.bin"),
            names_path: root.join("person_names.json"),
            model_path: root.join("model.onnx"),
            train_command: train_command.map(str::to_string),
            epochs: 2,
            batch_size: 4,
        }
    }

    #[test]
    fn test_build_without_trainer() {
        let dir = tempfile::tempdir().unwrap();
        write_person(&dir.path().join("face_data"), 1, 5);
        write_person(&dir.path().join("face_data"), 2, 5);
        let mut registry = IdentityRegistry::empty(dir.path().join("person_names.json"));
        registry.set(1, "Alice").unwrap();

        let plan = plan(dir.path(), None);
        let outcome = run_training(&plan, &registry).unwrap();
        assert!(!outcome.trained);
        assert_eq!(outcome.num_classes, 2);
        assert_eq!(outcome.train_samples, 8);
        assert_eq!(outcome.test_samples, 2);

        let names = rollcall_core::LabelNames::load(&plan.names_path).unwrap();
        assert_eq!(names.resolve(0), "Alice");
        assert_eq!(names.resolve(1), "Person 2");
        assert!(plan.dataset_path.exists());
    }

    #[test]
    fn test_single_person_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        write_person(&dir.path().join("face_data"), 1, 3);
        let registry = IdentityRegistry::empty(dir.path().join("person_names.json"));

        let plan = plan(dir.path(), None);
        let err = run_training(&plan, &registry).unwrap_err();
        assert!(matches!(
            err,
            JobError::Dataset(rollcall_core::DatasetError::InsufficientClasses { found: 1 })
        ));
        assert!(!plan.dataset_path.exists());
    }

    #[test]
    fn test_trainer_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), None);
        let cmd = trainer_command("python3 train.py --quiet", &plan).unwrap();
        assert_eq!(cmd.get_program(), "python3");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[..2], ["train.py", "--quiet"]);
        assert_eq!(args[4..], ["2", "4"]);
        assert!(args[2].ends_with("face_dataset.bin"));
    }

    #[test]
    fn test_failing_trainer_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_person(&dir.path().join("face_data"), 1, 2);
        write_person(&dir.path().join("face_data"), 2, 2);
        let registry = IdentityRegistry::empty(dir.path().join("person_names.json"));

        let err = run_training(&plan(dir.path(), Some("false")), &registry).unwrap_err();
        assert!(matches!(err, JobError::Trainer(_)));
    }

    fn write_model(path: &Path, mtime: SystemTime) {
        let file = std::fs::File::create(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_trainer_leaving_old_model_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_person(&dir.path().join("face_data"), 1, 2);
        write_person(&dir.path().join("face_data"), 2, 2);
        let registry = IdentityRegistry::empty(dir.path().join("person_names.json"));
        let plan = plan(dir.path(), Some("true"));
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        write_model(&plan.model_path, old);

        let err = run_training(&plan, &registry).unwrap_err();
        assert!(matches!(err, JobError::Trainer(ref msg) if msg.contains("unchanged")));
    }

    #[test]
    fn test_ensure_model_requires_newer_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);

        assert!(ensure_model(&model, None).is_err());
        write_model(&model, old);
        assert!(ensure_model(&model, None).is_ok());
        assert!(ensure_model(&model, Some(old)).is_err());

        write_model(&model, old + std::time::Duration::from_secs(60));
        assert!(ensure_model(&model, Some(old)).is_ok());
    }

    #[test]
    fn test_empty_train_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(trainer_command("   ", &plan(dir.path(), None)).is_err());
    }
}
