use serde::{Deserialize, Serialize};

/// Externally assigned, stable person identifier.
pub type PersonId = u32;

/// Dense classifier label index in `[0, num_classes)`.
pub type LabelIndex = usize;

/// Canonical sample resolution (width × height) shared by collection,
/// dataset builds and classifier input.
pub const CANONICAL_WIDTH: u32 = 92;
pub const CANONICAL_HEIGHT: u32 = 112;

/// Fixed raster size for face samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const CANONICAL: Resolution = Resolution {
        width: CANONICAL_WIDTH,
        height: CANONICAL_HEIGHT,
    };

    /// Number of pixels in one single-channel sample.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::CANONICAL
    }
}

/// Bounding box for a detected face in frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Top-1 classifier output for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label_index: LabelIndex,
    pub confidence: f32,
}

impl Prediction {
    /// Pick the most probable label from a probability vector.
    ///
    /// Returns `None` for an empty vector. NaN entries never win.
    pub fn from_probabilities(probabilities: &[f32]) -> Option<Self> {
        probabilities
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, p)| !p.is_nan())
            .fold(None, |best: Option<Prediction>, (i, p)| match best {
                Some(b) if b.confidence >= p => Some(b),
                _ => Some(Prediction {
                    label_index: i,
                    confidence: p,
                }),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0 }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_argmax() {
        let p = Prediction::from_probabilities(&[0.1, 0.7, 0.2]).unwrap();
        assert_eq!(p.label_index, 1);
        assert!((p.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_first_wins_on_tie() {
        let p = Prediction::from_probabilities(&[0.5, 0.5]).unwrap();
        assert_eq!(p.label_index, 0);
    }

    #[test]
    fn test_prediction_empty() {
        assert!(Prediction::from_probabilities(&[]).is_none());
    }

    #[test]
    fn test_prediction_skips_nan() {
        let p = Prediction::from_probabilities(&[f32::NAN, 0.3]).unwrap();
        assert_eq!(p.label_index, 1);
    }

    #[test]
    fn test_canonical_resolution() {
        assert_eq!(Resolution::default().pixels(), 92 * 112);
    }
}
