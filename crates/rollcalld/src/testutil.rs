//! In-memory camera, detector and classifier for session tests.

use image::GrayImage;
use rollcall_core::{BoundingBox, Classifier, ClassifierError, DetectorError, FaceDetector};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::collections::VecDeque;

/// Yields uniform frames, one per scripted level, then fails like an
/// unplugged camera.
pub struct FakeFrames {
    levels: VecDeque<u8>,
    width: u32,
    height: u32,
    sequence: u32,
}

impl FakeFrames {
    /// `count` mid-grey frames.
    pub fn new(count: u32, width: u32, height: u32) -> Self {
        Self::levels(vec![128; count as usize], width, height)
    }

    pub fn levels(levels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            levels: levels.into(),
            width,
            height,
            sequence: 0,
        }
    }
}

impl FrameSource for FakeFrames {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let Some(level) = self.levels.pop_front() else {
            return Err(CameraError::CaptureFailed("fake camera exhausted".into()));
        };
        self.sequence += 1;
        Ok(Frame {
            data: vec![level; (self.width * self.height) as usize],
            width: self.width,
            height: self.height,
            captured_at: std::time::Instant::now(),
            sequence: self.sequence,
        })
    }
}

/// Returns scripted detections per frame, then `fallback` forever.
pub struct FakeDetector {
    script: VecDeque<Vec<BoundingBox>>,
    fallback: Vec<BoundingBox>,
}

impl FakeDetector {
    pub fn new(script: Vec<Vec<BoundingBox>>) -> Self {
        Self {
            script: script.into(),
            fallback: Vec::new(),
        }
    }

    pub fn always(face: BoundingBox) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: vec![face],
        }
    }
}

impl FaceDetector for FakeDetector {
    fn detect(&mut self, _frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.script.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Returns scripted probability vectors, repeating the last one.
pub struct FakeClassifier {
    outputs: VecDeque<Vec<f32>>,
}

impl FakeClassifier {
    pub fn fixed(probabilities: Vec<f32>) -> Self {
        Self::sequence(vec![probabilities])
    }

    pub fn sequence(outputs: Vec<Vec<f32>>) -> Self {
        Self {
            outputs: outputs.into(),
        }
    }
}

impl Classifier for FakeClassifier {
    fn predict(&mut self, _face: &GrayImage) -> Result<Vec<f32>, ClassifierError> {
        match self.outputs.len() {
            0 => Err(ClassifierError::InferenceFailed("no scripted output".into())),
            1 => Ok(self.outputs[0].clone()),
            _ => Ok(self.outputs.pop_front().unwrap_or_default()),
        }
    }
}
