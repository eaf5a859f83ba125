use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::fmt;
use std::path::{Path, PathBuf};

use super::{DownloadProgress, ModelConfig, ModelProvisioner, ModelVariant};
use crate::config::{BackendKind, ModelSettings};
use crate::detect::{Detection, Detector, DetectorKind, SyntheticDetector};
use crate::error::{FeedError, FeedResult};

/// A model ready for inference, together with the selection that produced it.
pub struct LoadedModel {
    config: ModelConfig,
    artifact: PathBuf,
    detector: Box<dyn Detector>,
}

impl LoadedModel {
    pub(crate) fn new(config: ModelConfig, artifact: PathBuf, detector: Box<dyn Detector>) -> Self {
        Self {
            config,
            artifact,
            detector,
        }
    }

    pub fn config(&self) -> ModelConfig {
        self.config
    }

    pub fn variant(&self) -> ModelVariant {
        self.config.variant
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn kind(&self) -> DetectorKind {
        self.detector.kind()
    }

    /// Detect at the configured confidence threshold.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let threshold = self.config.confidence_threshold;
        self.detector.detect(frame, threshold)
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("config", &self.config)
            .field("artifact", &self.artifact)
            .field("detector", &self.detector.name())
            .finish()
    }
}

/// Provisions artifacts and instantiates detectors on the configured backend.
pub struct ModelLoader {
    provisioner: ModelProvisioner,
    backend: BackendKind,
    #[cfg_attr(not(feature = "backend-tract"), allow(dead_code))]
    settings: ModelSettings,
}

impl ModelLoader {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            provisioner: ModelProvisioner::new(settings),
            backend: settings.backend,
            settings: settings.clone(),
        }
    }

    pub fn provisioner(&self) -> &ModelProvisioner {
        &self.provisioner
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Provision (if needed) and instantiate `variant` at `confidence_percent`.
    pub fn load(&self, variant: ModelVariant, confidence_percent: u8) -> FeedResult<LoadedModel> {
        self.load_with_progress(variant, confidence_percent, |_| {})
    }

    pub fn load_with_progress(
        &self,
        variant: ModelVariant,
        confidence_percent: u8,
        on_progress: impl FnMut(DownloadProgress),
    ) -> FeedResult<LoadedModel> {
        let config = ModelConfig::new(variant, confidence_percent)?;
        let artifact = self.provisioner.ensure_with_progress(variant, on_progress)?;

        let detector = self
            .instantiate(variant, &artifact)
            .map_err(|err| FeedError::Load {
                variant: variant.to_string(),
                reason: format!("{:#}", err),
            })?;
        log::info!(
            "loaded model {} on {} (confidence {:.2})",
            variant,
            detector.name(),
            config.confidence_threshold
        );
        Ok(LoadedModel::new(config, artifact, detector))
    }

    fn instantiate(&self, variant: ModelVariant, artifact: &Path) -> Result<Box<dyn Detector>> {
        let meta = std::fs::metadata(artifact)
            .with_context(|| format!("model artifact {} not found", artifact.display()))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(anyhow!(
                "model artifact {} is empty or not a file",
                artifact.display()
            ));
        }

        let mut detector: Box<dyn Detector> = match self.backend {
            BackendKind::Synthetic => Box::new(SyntheticDetector::new(variant.detector_kind())),
            BackendKind::Tract => self.instantiate_tract(variant, artifact)?,
        };
        detector.warm_up().context("model warm-up failed")?;
        Ok(detector)
    }

    #[cfg(feature = "backend-tract")]
    fn instantiate_tract(&self, variant: ModelVariant, artifact: &Path) -> Result<Box<dyn Detector>> {
        use crate::detect::backends::{OpenVocabDetector, TractOptions, YoloDetector};

        let options = TractOptions {
            input_size: self.settings.input_size,
            nms_threshold: self.settings.nms_threshold,
            max_detections: self.settings.max_detections,
        };
        Ok(match variant.detector_kind() {
            DetectorKind::Standard => Box::new(YoloDetector::load(artifact, options)?),
            DetectorKind::OpenVocabulary => Box::new(OpenVocabDetector::load(artifact, options)?),
        })
    }

    #[cfg(not(feature = "backend-tract"))]
    fn instantiate_tract(&self, _variant: ModelVariant, _artifact: &Path) -> Result<Box<dyn Detector>> {
        Err(anyhow!(
            "tract backend not compiled in; rebuild with --features backend-tract"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ModelLoader {
        ModelLoader::new(&ModelSettings {
            dir: dir.to_path_buf(),
            base_url: "http://127.0.0.1:9/models".to_string(),
            backend: BackendKind::Synthetic,
            ..ModelSettings::default()
        })
    }

    #[test]
    fn loads_local_artifact_with_threshold() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yolov8n.onnx"), b"model").unwrap();

        let model = loader(dir.path()).load(ModelVariant::Simple, 35).unwrap();
        assert_eq!(model.variant(), ModelVariant::Simple);
        assert!((model.config().confidence_threshold - 0.35).abs() < f32::EPSILON);
        assert_eq!(model.kind(), DetectorKind::Standard);
        assert_eq!(model.detector_name(), "synthetic");
    }

    #[test]
    fn missing_local_artifact_is_a_load_error() {
        let dir = tempdir().unwrap();
        let err = loader(dir.path())
            .load(ModelVariant::OpenSegmentation, 50)
            .unwrap_err();
        assert!(matches!(err, FeedError::Load { .. }), "{:?}", err);
    }

    #[test]
    fn empty_local_artifact_is_a_load_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yolov8n.onnx"), b"").unwrap();
        let err = loader(dir.path()).load(ModelVariant::Simple, 50).unwrap_err();
        assert!(matches!(err, FeedError::Load { .. }));
    }

    #[test]
    fn invalid_confidence_is_rejected_before_provisioning() {
        let dir = tempdir().unwrap();
        let err = loader(dir.path())
            .load(ModelVariant::OilSpecialized, 0)
            .unwrap_err();
        assert!(matches!(err, FeedError::Rejected(_)));
        assert!(!dir.path().join("Vo5.onnx.part").exists());
    }

    #[test]
    fn open_segmentation_loads_open_vocabulary_detector() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("yoloe-11s-seg-pf.onnx"), b"model").unwrap();
        let mut model = loader(dir.path())
            .load(ModelVariant::OpenSegmentation, 10)
            .unwrap();
        assert_eq!(model.kind(), DetectorKind::OpenVocabulary);
        let dets = model.detect(&RgbImage::new(32, 32)).unwrap();
        assert!(dets.iter().all(|d| d.score >= 0.10));
        assert!(!dets.is_empty());
    }
}
