use anyhow::Result;
use image::RgbImage;
use serde::Serialize;

use crate::detect::result::Detection;

/// Capability family of a detector implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Closed-set detector with a fixed class list.
    Standard,
    /// Prompt-free open-vocabulary segmentation detector. Masks are ignored; only
    /// boxes and labels are produced.
    OpenVocabulary,
}

/// Detector capability shared by every model implementation.
///
/// `detect` receives the frame read-only and returns the detections scoring at
/// or above `threshold`, in frame pixel coordinates. Implementations keep no
/// reference to the frame past the call.
pub trait Detector: Send {
    /// Implementation identifier.
    fn name(&self) -> &'static str;

    fn kind(&self) -> DetectorKind;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &RgbImage, threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once after instantiation.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
