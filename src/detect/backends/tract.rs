#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{Detector, DetectorKind};
use crate::detect::decode::{decode_predictions, ClassLabels, DecodeParams, Predictions};
use crate::detect::result::Detection;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Mask coefficients emitted by YOLO segmentation heads when the prototype
/// output does not say otherwise.
const DEFAULT_MASK_CHANNELS: usize = 32;
const BOX_CHANNELS: usize = 4;

/// Decoding knobs shared by the tract detectors.
#[derive(Clone, Copy, Debug)]
pub struct TractOptions {
    /// Square network input edge in pixels.
    pub input_size: u32,
    pub nms_threshold: f32,
    pub max_detections: usize,
}

/// A loaded, optimized ONNX graph plus its class names.
struct OnnxSession {
    model: RunnableModel,
    labels: ClassLabels,
    options: TractOptions,
}

impl OnnxSession {
    fn load(path: &Path, options: TractOptions) -> Result<Self> {
        ensure!(options.input_size > 0, "model input size must be positive");
        let onnx = tract_onnx::onnx();
        let proto = onnx
            .proto_model_for_path(path)
            .map_err(|e| anyhow!("failed to parse ONNX graph from {}: {e}", path.display()))?;
        let labels = proto
            .metadata_props
            .iter()
            .find(|entry| entry.key == "names")
            .and_then(|entry| ClassLabels::from_metadata(&entry.value))
            .unwrap_or_default();

        let size = options.input_size as usize;
        let model = onnx
            .model_for_proto_model(&proto)
            .map_err(|e| anyhow!("failed to build ONNX model: {e}"))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .map_err(|e| anyhow!("failed to set input fact: {e}"))?
            .into_optimized()
            .map_err(|e| anyhow!("failed to optimize ONNX model: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow!("failed to build runnable ONNX model: {e}"))?;

        log::debug!(
            "ONNX model {} ready ({}x{}, {} named classes)",
            path.display(),
            size,
            size,
            labels.len()
        );
        Ok(Self {
            model,
            labels,
            options,
        })
    }

    fn build_input(&self, frame: &RgbImage) -> Tensor {
        let size = self.options.input_size;
        let resized = imageops::resize(frame, size, size, FilterType::Triangle);
        let size = size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn run(&self, frame: &RgbImage) -> Result<Vec<Tensor>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec![input.into()])
            .map_err(|e| anyhow!("ONNX inference failed: {e}"))?;
        let tensors: Vec<Tensor> = outputs.into_iter().map(|v| v.into_tensor()).collect();
        ensure!(!tensors.is_empty(), "model produced no outputs");
        Ok(tensors)
    }

    /// Decode output 0, leaving `trailing` non-class channels after the scores.
    fn decode(
        &self,
        frame: &RgbImage,
        output: &Tensor,
        trailing: usize,
        threshold: f32,
    ) -> Result<Vec<Detection>> {
        let shape = output.shape();
        ensure!(
            shape.len() == 3 && shape[0] == 1,
            "unexpected prediction shape {:?}",
            shape
        );
        let data = output
            .as_slice::<f32>()
            .map_err(|e| anyhow!("prediction tensor was not f32: {e}"))?;
        // Exports are usually [1, channels, anchors]; some are transposed.
        let predictions = if shape[1] > shape[2] {
            Predictions::anchor_major(data, shape[1], shape[2])?
        } else {
            Predictions::channel_major(data, shape[1], shape[2])?
        };
        let channels = shape[1].min(shape[2]);
        let class_count = channels
            .checked_sub(BOX_CHANNELS + trailing)
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                anyhow!(
                    "prediction has {} channels, too few for {} trailing channels",
                    channels,
                    trailing
                )
            })?;

        let (width, height) = frame.dimensions();
        let input = self.options.input_size as f32;
        let params = DecodeParams {
            threshold,
            nms_threshold: self.options.nms_threshold,
            max_detections: self.options.max_detections,
            scale_x: width as f32 / input,
            scale_y: height as f32 / input,
            frame_width: width,
            frame_height: height,
        };
        decode_predictions(&predictions, class_count, &self.labels, &params)
    }
}

/// Closed-set YOLO detector (`[1, 4 + classes, anchors]` output).
pub struct YoloDetector {
    session: OnnxSession,
}

impl YoloDetector {
    pub fn load<P: AsRef<Path>>(path: P, options: TractOptions) -> Result<Self> {
        let path = path.as_ref();
        let session = OnnxSession::load(path, options)
            .with_context(|| format!("load detector {}", path.display()))?;
        Ok(Self { session })
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &'static str {
        "tract-yolo"
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Standard
    }

    fn detect(&mut self, frame: &RgbImage, threshold: f32) -> Result<Vec<Detection>> {
        let outputs = self.session.run(frame)?;
        self.session.decode(frame, &outputs[0], 0, threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.session.options.input_size;
        self.session.run(&RgbImage::new(size, size)).map(|_| ())
    }
}

/// Prompt-free open-vocabulary segmentation detector.
///
/// Output 0 carries `4 + classes + mask` channels; output 1 holds the mask
/// prototypes whose channel count gives `mask`. Masks are not rendered.
pub struct OpenVocabDetector {
    session: OnnxSession,
}

impl OpenVocabDetector {
    pub fn load<P: AsRef<Path>>(path: P, options: TractOptions) -> Result<Self> {
        let path = path.as_ref();
        let session = OnnxSession::load(path, options)
            .with_context(|| format!("load open-vocabulary detector {}", path.display()))?;
        Ok(Self { session })
    }
}

impl Detector for OpenVocabDetector {
    fn name(&self) -> &'static str {
        "tract-open-vocab"
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::OpenVocabulary
    }

    fn detect(&mut self, frame: &RgbImage, threshold: f32) -> Result<Vec<Detection>> {
        let outputs = self.session.run(frame)?;
        let mask_channels = outputs
            .get(1)
            .and_then(|proto| proto.shape().get(1).copied())
            .unwrap_or(DEFAULT_MASK_CHANNELS);
        self.session
            .decode(frame, &outputs[0], mask_channels, threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.session.options.input_size;
        self.session.run(&RgbImage::new(size, size)).map(|_| ())
    }
}
