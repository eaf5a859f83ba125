//! Model selection, provisioning and loading.
//!
//! - `ModelVariant`: the four selectable detection models and their artifacts.
//! - `ModelProvisioner`: resolves a variant to a local artifact, downloading it
//!   from the model repository when it is remotely hosted and absent.
//! - `ModelLoader`: provisions and instantiates a `LoadedModel` for a variant.

mod loader;
mod provision;

pub use loader::{LoadedModel, ModelLoader};
pub use provision::{DownloadProgress, ModelProvisioner};

use serde::Serialize;
use std::fmt;

use crate::detect::DetectorKind;
use crate::error::{FeedError, FeedResult};

/// Default confidence used when a caller does not supply one.
pub const DEFAULT_CONFIDENCE_PERCENT: u8 = 50;

/// Selectable detection models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// General-purpose COCO detector.
    Simple,
    /// Detector trained on oil spills.
    OilSpecialized,
    /// Detector trained on oil residue.
    ResidueSpecialized,
    /// Prompt-free open-vocabulary segmentation detector.
    OpenSegmentation,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 4] = [
        ModelVariant::Simple,
        ModelVariant::OilSpecialized,
        ModelVariant::ResidueSpecialized,
        ModelVariant::OpenSegmentation,
    ];

    /// Accepts the legacy numeric identifiers (`"1"`..`"4"`) or the variant name.
    pub fn parse(value: &str) -> FeedResult<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "1" | "simple" => Ok(Self::Simple),
            "2" | "oil" | "oil_specialized" | "oilspecialized" => Ok(Self::OilSpecialized),
            "3" | "residue" | "residue_specialized" | "residuespecialized" => {
                Ok(Self::ResidueSpecialized)
            }
            "4" | "open_segmentation" | "opensegmentation" | "open_vocabulary" => {
                Ok(Self::OpenSegmentation)
            }
            _ => Err(FeedError::rejected(format!(
                "unknown model variant '{}'",
                value.trim()
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::OilSpecialized => "oil_specialized",
            Self::ResidueSpecialized => "residue_specialized",
            Self::OpenSegmentation => "open_segmentation",
        }
    }

    /// Artifact file name inside the model directory.
    pub fn artifact(self) -> &'static str {
        match self {
            Self::Simple => "yolov8n.onnx",
            Self::OilSpecialized => "Vo5.onnx",
            Self::ResidueSpecialized => "To9.onnx",
            Self::OpenSegmentation => "yoloe-11s-seg-pf.onnx",
        }
    }

    /// Whether the artifact is fetched from the model repository when absent.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::OilSpecialized | Self::ResidueSpecialized)
    }

    pub fn detector_kind(self) -> DetectorKind {
        match self {
            Self::OpenSegmentation => DetectorKind::OpenVocabulary,
            _ => DetectorKind::Standard,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable selection recorded for a loaded model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    /// Normalized cutoff in (0, 1].
    pub confidence_threshold: f32,
}

impl ModelConfig {
    pub fn new(variant: ModelVariant, confidence_percent: u8) -> FeedResult<Self> {
        Ok(Self {
            variant,
            confidence_threshold: confidence_from_percent(confidence_percent)?,
        })
    }
}

/// Convert a 1–99 percentage into a normalized threshold.
pub fn confidence_from_percent(percent: u8) -> FeedResult<f32> {
    if !(1..=99).contains(&percent) {
        return Err(FeedError::rejected(format!(
            "confidence must be between 1 and 99 percent, got {}",
            percent
        )));
    }
    Ok(f32::from(percent) / 100.0)
}
