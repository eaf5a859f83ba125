use anyhow::{ensure, Result};
use image::RgbImage;
use sha2::{Digest, Sha256};

use crate::detect::backend::{DetectorKind, Detector};
use crate::detect::result::{BoundingBox, Detection};

/// Score of the fixed centre detection.
pub const CENTRE_SCORE: f32 = 0.95;
/// Extra detections derived from the frame hash.
const HASHED_DETECTIONS: usize = 2;

/// Deterministic detector for tests and demos.
///
/// Always reports one centre detection scoring [`CENTRE_SCORE`] plus a few boxes
/// whose position and score are derived from a SHA-256 of the pixels, so
/// identical frames yield identical detections.
pub struct SyntheticDetector {
    kind: DetectorKind,
}

impl SyntheticDetector {
    pub fn new(kind: DetectorKind) -> Self {
        Self { kind }
    }

    fn label(&self) -> &'static str {
        match self.kind {
            DetectorKind::Standard => "object",
            DetectorKind::OpenVocabulary => "region",
        }
    }
}

impl Detector for SyntheticDetector {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn detect(&mut self, frame: &RgbImage, threshold: f32) -> Result<Vec<Detection>> {
        let (width, height) = frame.dimensions();
        ensure!(width > 0 && height > 0, "empty frame");
        let w = width as f32;
        let h = height as f32;

        let mut detections = vec![Detection {
            bbox: BoundingBox {
                x: w * 0.25,
                y: h * 0.25,
                width: w * 0.5,
                height: h * 0.5,
            },
            class_id: 0,
            label: self.label().to_string(),
            score: CENTRE_SCORE,
        }];

        let digest: [u8; 32] = Sha256::digest(frame.as_raw()).into();
        for (i, bytes) in digest.chunks_exact(8).take(HASHED_DETECTIONS).enumerate() {
            let unit = |b: u8| f32::from(b) / 255.0;
            let bbox = BoundingBox {
                x: unit(bytes[0]) * w * 0.7,
                y: unit(bytes[1]) * h * 0.7,
                width: (0.1 + unit(bytes[2]) * 0.2) * w,
                height: (0.1 + unit(bytes[3]) * 0.2) * h,
            };
            detections.push(Detection {
                bbox: bbox.clamp_to(width, height),
                class_id: i + 1,
                label: format!("{}{}", self.label(), i + 1),
                score: 0.3 + unit(bytes[4]) * 0.69,
            });
        }

        detections.retain(|d| d.score >= threshold);
        Ok(detections)
    }
}
