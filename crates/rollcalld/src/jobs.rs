//! Background jobs: collection, training and recognition.
//!
//! Every job runs on its own OS thread and is acknowledged with an id as
//! soon as it is launched. Collection and recognition need the camera and
//! are mutually exclusive; a second camera job is refused rather than
//! preempting the first. Outcomes are kept in a bounded history that the
//! status call reports.

use crate::collection::{self, CollectionRequest};
use crate::config::Config;
use crate::recognition::{self, RecognitionRequest};
use crate::training::{self, TrainingPlan};
use chrono::{DateTime, Utc};
use rollcall_core::{
    DirectorySource, IdentityRegistry, OnnxClassifier, RecognitionEventPipeline, RecognitionLog,
    Resolution, ScrfdDetector,
};
use rollcall_hw::{Camera, FrameSource};
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;

const HISTORY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("camera is in use by {kind} job {id}")]
    CameraBusy { id: String, kind: JobKind },
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] rollcall_core::DetectorError),
    #[error("classifier error: {0}")]
    Classifier(#[from] rollcall_core::ClassifierError),
    #[error(transparent)]
    Pipeline(#[from] rollcall_core::PipelineError),
    #[error(transparent)]
    Dataset(#[from] rollcall_core::DatasetError),
    #[error(transparent)]
    Registry(#[from] rollcall_core::RegistryError),
    #[error(transparent)]
    Labels(#[from] rollcall_core::labels::LabelError),
    #[error(transparent)]
    Log(#[from] rollcall_core::eventlog::EventLogError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("image encoding failed: {0}")]
    Image(String),
    #[error("job summary encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("trainer: {0}")]
    Trainer(String),
    #[error("failed to spawn job thread: {0}")]
    Spawn(std::io::Error),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("shared state poisoned by a panicked job")]
    Poisoned,
}

/// Cooperative stop request, checked by sessions once per frame.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Collection,
    Training,
    Recognition,
}

impl JobKind {
    fn needs_camera(self) -> bool {
        matches!(self, Self::Collection | Self::Recognition)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Collection => "collection",
            Self::Training => "training",
            Self::Recognition => "recognition",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    /// Job summary as JSON once finished, or the error message.
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraClaim {
    pub id: String,
    pub kind: JobKind,
    #[serde(skip)]
    stop: StopFlag,
}

#[derive(Default)]
struct Jobs {
    history: VecDeque<JobRecord>,
    camera: Option<CameraClaim>,
    threads: Vec<JoinHandle<()>>,
}

impl Jobs {
    fn record_mut(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.history.iter_mut().find(|r| r.id == id)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub camera: Option<CameraClaim>,
    pub jobs: Vec<JobRecord>,
}

/// Shared handle to the daemon's jobs. Clones refer to the same state.
#[derive(Clone)]
pub struct JobManager {
    config: Arc<Config>,
    registry: Arc<Mutex<IdentityRegistry>>,
    jobs: Arc<Mutex<Jobs>>,
}

impl JobManager {
    pub fn new(config: Config, registry: IdentityRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(registry)),
            jobs: Arc::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn start_collection(&self, request: CollectionRequest) -> Result<String, JobError> {
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        self.launch(JobKind::Collection, move |stop| {
            let camera = Camera::open(&config.camera_device, config.capture_width, config.capture_height)?;
            let mut stream = camera.stream()?;
            stream.warm_up(config.warmup_frames)?;
            let mut detector = ScrfdDetector::load(&config.detector_model_path)?;
            let samples = DirectorySource::new(&config.data_dir);

            let outcome = collection::run_collection(
                &mut stream,
                &mut detector,
                &samples,
                &registry,
                &request,
                config.capture_interval(),
                stop,
            )?;
            to_message(&outcome)
        })
    }

    /// Build the dataset from the registry as it stands now, then train.
    pub fn start_training(&self) -> Result<String, JobError> {
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        self.launch(JobKind::Training, move |_| {
            let snapshot = registry.lock().map_err(|_| JobError::Poisoned)?.clone();
            let plan = TrainingPlan {
                data_dir: config.data_dir.clone(),
                dataset_path: config.dataset_path.clone(),
                names_path: config.names_path().to_path_buf(),
                model_path: config.model_path.clone(),
                train_command: config.train_command.clone(),
                epochs: config.epochs,
                batch_size: config.batch_size,
            };
            to_message(&training::run_training(&plan, &snapshot)?)
        })
    }

    pub fn start_recognition(&self, request: RecognitionRequest) -> Result<String, JobError> {
        let config = Arc::clone(&self.config);
        self.launch(JobKind::Recognition, move |stop| {
            // Everything that can be misconfigured is checked before the camera opens.
            let names = recognition::load_label_names(&request.names_path, &config.dataset_path)?;
            let mut classifier = OnnxClassifier::load(&request.model_path, Resolution::CANONICAL)?;
            let mut detector = ScrfdDetector::load(&config.detector_model_path)?;
            let log = RecognitionLog::open(&request.log_path)?;
            let mut pipeline =
                RecognitionEventPipeline::new(names, config.pipeline_config(request.confidence_threshold), log);

            let camera = Camera::open(&config.camera_device, config.capture_width, config.capture_height)?;
            let mut stream = camera.stream()?;
            stream.warm_up(config.warmup_frames)?;

            let summary = recognition::run_recognition(
                &mut stream,
                &mut detector,
                &mut classifier,
                &mut pipeline,
                &request.location,
                stop,
            )?;
            to_message(&summary)
        })
    }

    /// Ask the running recognition job to stop. False if none is running.
    pub fn stop_recognition(&self) -> bool {
        let Ok(jobs) = self.lock_jobs() else {
            return false;
        };
        match &jobs.camera {
            Some(claim) if claim.kind == JobKind::Recognition => {
                tracing::info!(id = %claim.id, "stop requested");
                claim.stop.raise();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> StatusReport {
        let (camera, jobs) = match self.lock_jobs() {
            Ok(jobs) => (jobs.camera.clone(), jobs.history.iter().cloned().collect()),
            Err(_) => (None, Vec::new()),
        };
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            camera,
            jobs,
        }
    }

    pub fn job(&self, id: &str) -> Option<JobRecord> {
        self.lock_jobs().ok()?.history.iter().find(|r| r.id == id).cloned()
    }

    /// Stop the camera job, if any, and wait for every job thread to exit.
    pub fn shutdown(&self) {
        let threads = match self.lock_jobs() {
            Ok(mut jobs) => {
                if let Some(claim) = &jobs.camera {
                    claim.stop.raise();
                }
                std::mem::take(&mut jobs.threads)
            }
            Err(_) => return,
        };
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("job thread panicked");
            }
        }
    }

    fn lock_jobs(&self) -> Result<MutexGuard<'_, Jobs>, JobError> {
        self.jobs.lock().map_err(|_| JobError::Poisoned)
    }

    /// Register a job, claim the camera if it needs one, and run `work` on
    /// a dedicated thread.
    fn launch<W>(&self, kind: JobKind, work: W) -> Result<String, JobError>
    where
        W: FnOnce(&StopFlag) -> Result<String, JobError> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let stop = StopFlag::default();
        let mut jobs = self.lock_jobs()?;

        if kind.needs_camera() {
            if let Some(claim) = &jobs.camera {
                return Err(JobError::CameraBusy {
                    id: claim.id.clone(),
                    kind: claim.kind,
                });
            }
        }

        let shared = Arc::clone(&self.jobs);
        let job_id = id.clone();
        let job_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rollcall-{kind}"))
            .spawn(move || {
                tracing::info!(id = %job_id, %kind, "job started");
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| work(&job_stop)))
                    .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))));
                finish(&shared, &job_id, kind, result);
            })
            .map_err(JobError::Spawn)?;

        if kind.needs_camera() {
            jobs.camera = Some(CameraClaim {
                id: id.clone(),
                kind,
                stop,
            });
        }
        jobs.history.push_back(JobRecord {
            id: id.clone(),
            kind,
            state: JobState::Running,
            message: String::new(),
            started_at: Utc::now(),
            finished_at: None,
        });
        while jobs.history.len() > HISTORY_LEN {
            jobs.history.pop_front();
        }
        jobs.threads.retain(|t| !t.is_finished());
        jobs.threads.push(handle);
        Ok(id)
    }
}

/// Record a job's result and release its camera claim.
fn finish(shared: &Mutex<Jobs>, id: &str, kind: JobKind, result: Result<String, JobError>) {
    let (state, message) = match result {
        Ok(summary) => {
            tracing::info!(%id, %kind, "job completed");
            (JobState::Completed, summary)
        }
        Err(e) => {
            tracing::error!(%id, %kind, error = %e, "job failed");
            (JobState::Failed, e.to_string())
        }
    };

    let mut jobs = match shared.lock() {
        Ok(jobs) => jobs,
        Err(poisoned) => poisoned.into_inner(),
    };
    if jobs.camera.as_ref().is_some_and(|c| c.id == id) {
        jobs.camera = None;
    }
    if let Some(record) = jobs.record_mut(id) {
        record.state = state;
        record.message = message;
        record.finished_at = Some(Utc::now());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn to_message<T: Serialize>(summary: &T) -> Result<String, JobError> {
    Ok(serde_json::to_string(summary)?)
}
