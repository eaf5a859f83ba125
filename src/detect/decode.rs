//! YOLO-family output decoding shared by the detector implementations.
//!
//! Both the closed-set and the open-vocabulary exports produce a prediction
//! matrix of `channels × anchors` where each anchor column holds
//! `cx, cy, w, h, score_0 .. score_{C-1}` followed, for segmentation exports,
//! by mask coefficients that are ignored here.

use anyhow::{anyhow, ensure, Result};
use std::cmp::Ordering;

use crate::detect::result::{BoundingBox, Detection};

const BOX_CHANNELS: usize = 4;
const MAX_CLASS_ID: usize = 65_535;

/// Borrowed prediction matrix.
#[derive(Clone, Copy, Debug)]
pub struct Predictions<'a> {
    data: &'a [f32],
    channels: usize,
    anchors: usize,
    /// `true` for `[channels, anchors]` storage, `false` for `[anchors, channels]`.
    channel_major: bool,
}

impl<'a> Predictions<'a> {
    pub fn channel_major(data: &'a [f32], channels: usize, anchors: usize) -> Result<Self> {
        Self::new(data, channels, anchors, true)
    }

    pub fn anchor_major(data: &'a [f32], anchors: usize, channels: usize) -> Result<Self> {
        Self::new(data, channels, anchors, false)
    }

    fn new(data: &'a [f32], channels: usize, anchors: usize, channel_major: bool) -> Result<Self> {
        let expected = channels
            .checked_mul(anchors)
            .ok_or_else(|| anyhow!("prediction dimensions overflow"))?;
        ensure!(
            data.len() == expected,
            "prediction tensor holds {} values, expected {}x{}",
            data.len(),
            channels,
            anchors
        );
        Ok(Self {
            data,
            channels,
            anchors,
            channel_major,
        })
    }

    fn at(&self, channel: usize, anchor: usize) -> f32 {
        if self.channel_major {
            self.data[channel * self.anchors + anchor]
        } else {
            self.data[anchor * self.channels + channel]
        }
    }
}

/// Parameters mapping network output back onto the source frame.
#[derive(Clone, Copy, Debug)]
pub struct DecodeParams {
    pub threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
    /// Frame width / network input width.
    pub scale_x: f32,
    /// Frame height / network input height.
    pub scale_y: f32,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Class id to label mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl ClassLabels {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Parse the `names` metadata written by YOLO exporters, e.g.
    /// `{0: 'oil', 1: 'sheen'}`. Returns `None` when nothing parses.
    pub fn from_metadata(raw: &str) -> Option<Self> {
        let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
        let mut entries: Vec<(usize, String)> = Vec::new();
        let mut chars = body.chars().peekable();
        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }
            let mut key = String::new();
            while let Some(c) = chars.peek().copied() {
                if c == ':' {
                    break;
                }
                key.push(c);
                chars.next();
            }
            chars.next()?; // ':'
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            let quote = chars.next()?;
            if quote != '\'' && quote != '"' {
                return None;
            }
            let mut value = String::new();
            loop {
                match chars.next()? {
                    c if c == quote => break,
                    '\\' => value.push(chars.next()?),
                    c => value.push(c),
                }
            }
            let key = key.trim().trim_matches(|c| c == '\'' || c == '"');
            let id: usize = key.parse().ok()?;
            if id > MAX_CLASS_ID {
                return None;
            }
            entries.push((id, value));
        }
        if entries.is_empty() {
            return None;
        }
        let len = entries.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
        let mut names: Vec<String> = (0..len).map(fallback_label).collect();
        for (id, name) in entries {
            names[id] = name;
        }
        Some(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn label(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| fallback_label(class_id))
    }
}

fn fallback_label(class_id: usize) -> String {
    format!("class{}", class_id)
}

/// Decode predictions into thresholded, suppressed detections.
///
/// `class_count` selects how many score channels follow the box; any remaining
/// channels are skipped.
pub fn decode_predictions(
    predictions: &Predictions<'_>,
    class_count: usize,
    labels: &ClassLabels,
    params: &DecodeParams,
) -> Result<Vec<Detection>> {
    ensure!(class_count > 0, "model reports no classes");
    ensure!(
        predictions.channels >= BOX_CHANNELS + class_count,
        "prediction has {} channels, needs at least {}",
        predictions.channels,
        BOX_CHANNELS + class_count
    );

    let mut candidates = Vec::new();
    for anchor in 0..predictions.anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class_id in 0..class_count {
            let score = predictions.at(BOX_CHANNELS + class_id, anchor);
            if score > best_score {
                best_score = score;
                best_class = class_id;
            }
        }
        if !best_score.is_finite() || best_score < params.threshold {
            continue;
        }

        let bbox = BoundingBox::from_center(
            predictions.at(0, anchor) * params.scale_x,
            predictions.at(1, anchor) * params.scale_y,
            predictions.at(2, anchor) * params.scale_x,
            predictions.at(3, anchor) * params.scale_y,
        )
        .clamp_to(params.frame_width, params.frame_height);
        if bbox.width <= 0.0 || bbox.height <= 0.0 {
            continue;
        }

        candidates.push(Detection {
            bbox,
            class_id: best_class,
            label: labels.label(best_class),
            score: best_score,
        });
    }

    Ok(non_max_suppression(
        candidates,
        params.nms_threshold,
        params.max_detections,
    ))
}

/// Class-aware greedy NMS. Output is sorted by descending score.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len().min(max_detections));
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id
                && existing.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(threshold: f32) -> DecodeParams {
        DecodeParams {
            threshold,
            nms_threshold: 0.45,
            max_detections: 100,
            scale_x: 2.0,
            scale_y: 1.0,
            frame_width: 200,
            frame_height: 100,
        }
    }

    /// Channel-major matrix with 3 anchors, 2 classes and 1 trailing mask channel.
    fn sample() -> Vec<f32> {
        vec![
            // cx
            20.0, 21.0, 80.0, //
            // cy
            20.0, 20.0, 50.0, //
            // w
            10.0, 10.0, 10.0, //
            // h
            10.0, 10.0, 10.0, //
            // class 0
            0.9, 0.8, 0.1, //
            // class 1
            0.1, 0.2, 0.6, //
            // mask coefficient
            5.0, 5.0, 5.0,
        ]
    }

    #[test]
    fn decodes_scales_and_suppresses() {
        let data = sample();
        let preds = Predictions::channel_major(&data, 7, 3).unwrap();
        let labels = ClassLabels::new(vec!["oil".into(), "sheen".into()]);
        let dets = decode_predictions(&preds, 2, &labels, &params(0.5)).unwrap();

        // Anchors 0 and 1 overlap heavily with the same class; only the best survives.
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].label, "oil");
        assert!((dets[0].score - 0.9).abs() < 1e-6);
        assert_eq!(dets[0].bbox, BoundingBox { x: 30.0, y: 15.0, width: 20.0, height: 10.0 });
        assert_eq!(dets[1].label, "sheen");
        assert_eq!(dets[1].class_id, 1);
    }

    #[test]
    fn threshold_filters_low_scores() {
        let data = sample();
        let preds = Predictions::channel_major(&data, 7, 3).unwrap();
        let dets = decode_predictions(&preds, 2, &ClassLabels::default(), &params(0.85)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "class0");
    }

    #[test]
    fn anchor_major_layout_matches_channel_major() {
        let data = sample();
        let mut transposed = vec![0.0; data.len()];
        for c in 0..7 {
            for a in 0..3 {
                transposed[a * 7 + c] = data[c * 3 + a];
            }
        }
        let labels = ClassLabels::default();
        let a = decode_predictions(
            &Predictions::channel_major(&data, 7, 3).unwrap(),
            2,
            &labels,
            &params(0.5),
        )
        .unwrap();
        let b = decode_predictions(
            &Predictions::anchor_major(&transposed, 3, 7).unwrap(),
            2,
            &labels,
            &params(0.5),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_mismatched_tensor_size() {
        assert!(Predictions::channel_major(&[0.0; 5], 2, 3).is_err());
    }

    #[test]
    fn nms_keeps_overlapping_boxes_of_different_classes() {
        let bbox = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let dets = vec![
            Detection { bbox, class_id: 0, label: "a".into(), score: 0.9 },
            Detection { bbox, class_id: 1, label: "b".into(), score: 0.8 },
            Detection { bbox, class_id: 0, label: "a".into(), score: 0.7 },
        ];
        let kept = non_max_suppression(dets, 0.5, 10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].label, "b");
    }

    #[test]
    fn nms_caps_detection_count() {
        let dets = (0..5)
            .map(|i| Detection {
                bbox: BoundingBox { x: i as f32 * 20.0, y: 0.0, width: 10.0, height: 10.0 },
                class_id: 0,
                label: "a".into(),
                score: 0.5 + i as f32 * 0.1,
            })
            .collect();
        let kept = non_max_suppression(dets, 0.5, 3);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].score > kept[2].score);
    }

    #[test]
    fn parses_exporter_names_metadata() {
        let labels = ClassLabels::from_metadata("{0: 'person', 1: \"oil slick\", 3: 'it\\'s'}")
            .unwrap();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels.label(0), "person");
        assert_eq!(labels.label(1), "oil slick");
        assert_eq!(labels.label(2), "class2");
        assert_eq!(labels.label(3), "it's");
        assert_eq!(labels.label(9), "class9");
    }

    #[test]
    fn malformed_names_metadata_is_ignored() {
        assert!(ClassLabels::from_metadata("['a', 'b']").is_none());
        assert!(ClassLabels::from_metadata("{}").is_none());
        assert!(ClassLabels::from_metadata("{x: 'a'}").is_none());
    }
}
