//! Face classifier boundary and its ONNX Runtime implementation.
//!
//! The classifier takes one grayscale face at the canonical resolution,
//! scaled to [0, 1], and returns a probability per label index. It is
//! trained outside this crate; here it is only loaded and queried.

use crate::types::Resolution;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} (train a model first)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face crop to a probability distribution over label indices.
///
/// The vector length must match the label map the model was trained with;
/// callers check it against the label names in use.
pub trait Classifier {
    fn predict(&mut self, face: &GrayImage) -> Result<Vec<f32>, ClassifierError>;
}

/// Classifier exported to ONNX with an NHWC `[1, H, W, 1]` float input.
pub struct OnnxClassifier {
    session: Session,
    resolution: Resolution,
}

impl OnnxClassifier {
    pub fn load(model_path: &Path, resolution: Resolution) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded classifier model"
        );

        Ok(Self { session, resolution })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&mut self, face: &GrayImage) -> Result<Vec<f32>, ClassifierError> {
        let input = preprocess(face, self.resolution);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, probs) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("probability extraction: {e}")))?;

        if probs.is_empty() {
            return Err(ClassifierError::InferenceFailed("empty output tensor".into()));
        }
        Ok(probs.to_vec())
    }
}

/// Resize to `resolution` if needed and scale pixels to [0, 1] in NHWC order.
pub fn preprocess(face: &GrayImage, resolution: Resolution) -> Array4<f32> {
    let Resolution { width, height } = resolution;
    let resized;
    let face = if face.dimensions() == (width, height) {
        face
    } else {
        resized = image::imageops::resize(face, width, height, FilterType::Triangle);
        &resized
    };

    let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 1));
    for (x, y, pixel) in face.enumerate_pixels() {
        tensor[[0, y as usize, x as usize, 0]] = pixel.0[0] as f32 / 255.0;
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_is_nhwc() {
        let face = GrayImage::new(92, 112);
        let tensor = preprocess(&face, Resolution::CANONICAL);
        assert_eq!(tensor.shape(), &[1, 112, 92, 1]);
    }

    #[test]
    fn test_preprocess_scales_to_unit_range() {
        let mut face = GrayImage::new(92, 112);
        face.put_pixel(3, 5, image::Luma([255]));
        let tensor = preprocess(&face, Resolution::CANONICAL);
        assert_eq!(tensor[[0, 5, 3, 0]], 1.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_preprocess_resizes_other_sizes() {
        let face = GrayImage::from_pixel(200, 240, image::Luma([51]));
        let tensor = preprocess(&face, Resolution::CANONICAL);
        assert_eq!(tensor.shape(), &[1, 112, 92, 1]);
        assert!(tensor.iter().all(|v| (v - 0.2).abs() < 1e-3));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxClassifier::load(Path::new("/nonexistent/model.onnx"), Resolution::CANONICAL);
        assert!(matches!(err, Err(ClassifierError::ModelNotFound(_))));
    }
}
