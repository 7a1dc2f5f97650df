//! Face collection: capture, keep single-face frames, save canonical crops.

use crate::jobs::{JobError, StopFlag};
use image::imageops::FilterType;
use image::{GrayImage, ImageFormat};
use rollcall_core::dataset::person_dir_name;
use rollcall_core::persist::write_atomic;
use rollcall_core::{DirectorySource, FaceDetector, IdentityRegistry, PersonId, Resolution};
use rollcall_hw::FrameSource;
use serde::Serialize;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub person_id: PersonId,
    pub display_name: String,
    pub num_images: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionOutcome {
    pub saved: u32,
    pub frames: u32,
    /// Frames too dark to detect in.
    pub dark: u32,
    /// Frames with zero or several faces.
    pub rejected: u32,
    pub first_index: u32,
    pub stopped: bool,
    /// Set when the camera failed mid-session.
    pub capture_error: Option<String>,
}

/// Run one collection session against `source`.
///
/// Samples continue after the highest existing index, so earlier samples are
/// never overwritten. The registry name is written only once at least one
/// image was saved.
pub fn run_collection<F, D>(
    source: &mut F,
    detector: &mut D,
    samples: &DirectorySource,
    registry: &Mutex<IdentityRegistry>,
    request: &CollectionRequest,
    interval: Duration,
    stop: &StopFlag,
) -> Result<CollectionOutcome, JobError>
where
    F: FrameSource + ?Sized,
    D: FaceDetector + ?Sized,
{
    let resolution = Resolution::CANONICAL;
    let person = request.person_id;
    let first_index = samples.next_sample_index(person)?;
    let mut outcome = CollectionOutcome {
        first_index,
        ..Default::default()
    };

    tracing::info!(
        person_id = person,
        name = %request.display_name,
        target = request.num_images,
        dir = %person_dir_name(person),
        first_index,
        "collection started"
    );

    while outcome.saved < request.num_images {
        if stop.is_raised() {
            outcome.stopped = true;
            break;
        }
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, saved = outcome.saved, "camera failed; ending collection");
                outcome.capture_error = Some(e.to_string());
                break;
            }
        };
        outcome.frames += 1;
        if frame.is_dark() {
            outcome.dark += 1;
            continue;
        }
        let Some(image) = frame.into_image() else {
            outcome.rejected += 1;
            continue;
        };

        let faces = detector.detect(&image)?;
        let [face] = faces.as_slice() else {
            tracing::debug!(faces = faces.len(), "need exactly one face; frame skipped");
            outcome.rejected += 1;
            continue;
        };
        let Some(crop) = rollcall_hw::crop(&image, face.x, face.y, face.width, face.height) else {
            outcome.rejected += 1;
            continue;
        };
        let sample = image::imageops::resize(&crop, resolution.width, resolution.height, FilterType::Triangle);

        let index = first_index + outcome.saved;
        save_sample(&sample, &samples.sample_path(person, index))?;
        outcome.saved += 1;
        tracing::debug!(person_id = person, index, "sample saved");

        if !interval.is_zero() && outcome.saved < request.num_images {
            std::thread::sleep(interval);
        }
    }

    if outcome.saved > 0 {
        let mut registry = registry.lock().map_err(|_| JobError::Poisoned)?;
        registry.set(person, &request.display_name)?;
    } else {
        tracing::warn!(person_id = person, "no images saved; registry left unchanged");
    }

    tracing::info!(
        person_id = person,
        saved = outcome.saved,
        frames = outcome.frames,
        dark = outcome.dark,
        rejected = outcome.rejected,
        stopped = outcome.stopped,
        "collection finished"
    );
    Ok(outcome)
}

fn save_sample(sample: &GrayImage, path: &std::path::Path) -> Result<(), JobError> {
    let mut buf = Vec::new();
    sample
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .map_err(|e| JobError::Image(e.to_string()))?;
    write_atomic(path, &buf).map_err(|source| JobError::Io {
        path: path.to_path_buf(),
        source,
    })
}
