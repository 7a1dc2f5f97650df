use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Longest accepted recognition cooldown (one day).
pub const MAX_COOLDOWN_SECS: i64 = 86_400;

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Root of the `person<id>/face<n>.jpg` sample tree.
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    /// Label-name file written by builds and read by recognition.
    /// Unset means the registry path.
    pub names_path: Option<PathBuf>,
    pub dataset_path: PathBuf,
    pub model_path: PathBuf,
    pub detector_model_path: PathBuf,
    pub log_path: PathBuf,
    pub location: String,
    pub confidence_threshold: f32,
    pub cooldown_secs: i64,
    /// Default image count for a collection session.
    pub num_images: u32,
    /// Pause between saved collection samples.
    pub capture_interval_ms: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// External trainer, invoked as `<cmd> <dataset> <model> <epochs> <batch_size>`.
    pub train_command: Option<String>,
    pub epochs: u32,
    pub batch_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            data_dir: PathBuf::from("face_data"),
            registry_path: PathBuf::from("person_names.json"),
            names_path: None,
            dataset_path: PathBuf::from("face_dataset.bin"),
            model_path: PathBuf::from("face_recognition_model.onnx"),
            detector_model_path: PathBuf::from("models/det_500m.onnx"),
            log_path: PathBuf::from("recognition_log.csv"),
            location: "Main Entrance".to_string(),
            confidence_threshold: rollcall_core::pipeline::DEFAULT_CONFIDENCE_THRESHOLD,
            cooldown_secs: rollcall_core::pipeline::DEFAULT_COOLDOWN_SECS,
            num_images: 100,
            capture_interval_ms: 200,
            warmup_frames: 4,
            train_command: None,
            epochs: 50,
            batch_size: 32,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the recognition pipeline cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(0..=MAX_COOLDOWN_SECS).contains(&self.cooldown_secs) {
            return Err(ConfigError::Invalid(format!(
                "cooldown_secs must be within [0, {MAX_COOLDOWN_SECS}], got {}",
                self.cooldown_secs
            )));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable numbers keep the current value.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let path = |key: &str| var(key).map(PathBuf::from);

        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = path("ROLLCALL_DATA_DIR") {
            self.data_dir = v;
        }
        if let Some(v) = path("ROLLCALL_REGISTRY_PATH") {
            self.registry_path = v;
        }
        if let Some(v) = path("ROLLCALL_NAMES_PATH") {
            self.names_path = Some(v);
        }
        if let Some(v) = path("ROLLCALL_DATASET_PATH") {
            self.dataset_path = v;
        }
        if let Some(v) = path("ROLLCALL_MODEL_PATH") {
            self.model_path = v;
        }
        if let Some(v) = path("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model_path = v;
        }
        if let Some(v) = path("ROLLCALL_LOG_PATH") {
            self.log_path = v;
        }
        if let Some(v) = var("ROLLCALL_LOCATION") {
            self.location = v;
        }
        if let Some(v) = var("ROLLCALL_TRAIN_COMMAND").filter(|v| !v.trim().is_empty()) {
            self.train_command = Some(v);
        }
        self.confidence_threshold = parsed(var("ROLLCALL_CONFIDENCE_THRESHOLD")).unwrap_or(self.confidence_threshold);
        self.cooldown_secs = parsed(var("ROLLCALL_COOLDOWN_SECS")).unwrap_or(self.cooldown_secs);
        self.num_images = parsed(var("ROLLCALL_NUM_IMAGES")).unwrap_or(self.num_images);
        self.capture_interval_ms = parsed(var("ROLLCALL_CAPTURE_INTERVAL_MS")).unwrap_or(self.capture_interval_ms);
        self.warmup_frames = parsed(var("ROLLCALL_WARMUP_FRAMES")).unwrap_or(self.warmup_frames);
        self.epochs = parsed(var("ROLLCALL_EPOCHS")).unwrap_or(self.epochs);
        self.batch_size = parsed(var("ROLLCALL_BATCH_SIZE")).unwrap_or(self.batch_size);
    }

    pub fn names_path(&self) -> &Path {
        self.names_path.as_deref().unwrap_or(&self.registry_path)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn pipeline_config(&self, confidence_threshold: f32) -> rollcall_core::PipelineConfig {
        rollcall_core::PipelineConfig {
            confidence_threshold,
            cooldown: chrono::Duration::seconds(self.cooldown_secs.clamp(0, MAX_COOLDOWN_SECS)),
        }
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}
