use crate::collection::CollectionRequest;
use crate::config::Config;
use crate::jobs::{JobError, JobManager};
use crate::recognition::RecognitionRequest;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus job-control interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Every `start_*` call returns a job id as soon as the job is launched;
/// progress and results are read back through `status`.
pub struct RollcallService {
    jobs: JobManager,
}

impl RollcallService {
    pub fn new(jobs: JobManager) -> Self {
        Self { jobs }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Capture face samples for `person_id`. A `num_images` of 0 selects the
    /// configured default; an empty `name` selects "Person <id>".
    async fn start_collection(&self, person_id: u32, name: &str, num_images: u32) -> zbus::fdo::Result<String> {
        tracing::info!(person_id, name, num_images, "start_collection requested");
        let request = collection_request(self.jobs.config(), person_id, name, num_images);
        self.jobs.start_collection(request).map_err(to_fdo)
    }

    /// Build the dataset and run the configured trainer.
    async fn start_training(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_training requested");
        self.jobs.start_training().map_err(to_fdo)
    }

    /// Start a recognition session. Empty strings and a negative confidence
    /// select the configured defaults.
    async fn start_recognition(
        &self,
        model_path: &str,
        names_path: &str,
        log_path: &str,
        location: &str,
        confidence: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(model_path, names_path, log_path, location, confidence, "start_recognition requested");
        let request = recognition_request(self.jobs.config(), model_path, names_path, log_path, location, confidence)
            .map_err(zbus::fdo::Error::InvalidArgs)?;
        self.jobs.start_recognition(request).map_err(to_fdo)
    }

    /// Signal the running recognition session to stop.
    async fn stop_recognition(&self) -> bool {
        self.jobs.stop_recognition()
    }

    /// Daemon status as JSON: version, camera owner and recent jobs.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.jobs.status()).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn to_fdo(err: JobError) -> zbus::fdo::Error {
    match err {
        JobError::CameraBusy { .. } => zbus::fdo::Error::LimitsExceeded(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn collection_request(config: &Config, person_id: u32, name: &str, num_images: u32) -> CollectionRequest {
    let name = name.trim();
    CollectionRequest {
        person_id,
        display_name: if name.is_empty() {
            rollcall_core::registry::default_name(person_id)
        } else {
            name.to_string()
        },
        num_images: if num_images == 0 { config.num_images } else { num_images },
    }
}

fn recognition_request(
    config: &Config,
    model_path: &str,
    names_path: &str,
    log_path: &str,
    location: &str,
    confidence: f64,
) -> Result<RecognitionRequest, String> {
    let path_or = |given: &str, default: &std::path::Path| {
        if given.is_empty() {
            default.to_path_buf()
        } else {
            PathBuf::from(given)
        }
    };
    let confidence_threshold = if confidence < 0.0 {
        config.confidence_threshold
    } else if confidence <= 1.0 {
        confidence as f32
    } else {
        return Err(format!("confidence must be within [0, 1], got {confidence}"));
    };

    Ok(RecognitionRequest {
        model_path: path_or(model_path, config.model_path.as_path()),
        names_path: path_or(names_path, config.names_path()),
        log_path: path_or(log_path, config.log_path.as_path()),
        location: if location.is_empty() {
            config.location.clone()
        } else {
            location.to_string()
        },
        confidence_threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_defaults() {
        let config = Config::default();
        let req = collection_request(&config, 4, "  ", 0);
        assert_eq!(req.display_name, "Person 4");
        assert_eq!(req.num_images, 100);

        let req = collection_request(&config, 4, "Dana", 10);
        assert_eq!(req.display_name, "Dana");
        assert_eq!(req.num_images, 10);

        // Person id 0 is an ordinary id, not a default marker.
        let req = collection_request(&config, 0, "Zed", 0);
        assert_eq!(req.person_id, 0);
        assert_eq!(req.display_name, "Zed");
        assert_eq!(req.num_images, 100);
    }

    #[test]
    fn test_recognition_defaults() {
        let config = Config::default();
        let req = recognition_request(&config, "", "", "", "", -1.0).unwrap();
        assert_eq!(req.model_path, config.model_path);
        assert_eq!(req.names_path, PathBuf::from("person_names.json"));
        assert_eq!(req.location, "Main Entrance");
        assert_eq!(req.confidence_threshold, 0.5);

        let req = recognition_request(&config, "m.onnx", "n.json", "l.csv", "Lobby", 0.75).unwrap();
        assert_eq!(req.model_path, PathBuf::from("m.onnx"));
        assert_eq!(req.location, "Lobby");
        assert_eq!(req.confidence_threshold, 0.75);
    }

    #[test]
    fn test_recognition_rejects_bad_confidence() {
        assert!(recognition_request(&Config::default(), "", "", "", "", 1.5).is_err());
        assert!(recognition_request(&Config::default(), "", "", "", "", f64::NAN).is_err());
    }
}
