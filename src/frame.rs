//! Frame types and the single-slot latest-frame cache.
//!
//! - `Frame`: one captured RGB image with its capture time and sequence number.
//! - `AnnotatedFrame`: a frame after detections were drawn on it. JPEG encoding
//!   happens at most once, on first read.
//! - `FrameCache`: holds the most recently published `AnnotatedFrame`. The worker
//!   publishes, any caller reads.
//!
//! Publication swaps an `Arc` under a write lock, so a reader sees either the
//! previous or the newest complete frame, never a partially written one.

use anyhow::{anyhow, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::{Arc, OnceLock, RwLock};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured frame. Owned by the worker until annotated and published.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    /// Monotonic per capture handle, starting at 0.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

// ----------------------------------------------------------------------------
// AnnotatedFrame / EncodedFrame
// ----------------------------------------------------------------------------

/// A frame with detections drawn on it, plus its lazily encoded JPEG.
#[derive(Debug)]
pub struct AnnotatedFrame {
    image: RgbImage,
    captured_at: DateTime<Utc>,
    sequence: u64,
    detections: usize,
    jpeg: OnceLock<std::result::Result<Arc<[u8]>, String>>,
}

impl AnnotatedFrame {
    pub fn new(frame: Frame, detections: usize) -> Self {
        Self {
            image: frame.image,
            captured_at: frame.captured_at,
            sequence: frame.sequence,
            detections,
            jpeg: OnceLock::new(),
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn detections(&self) -> usize {
        self.detections
    }

    /// JPEG bytes, encoded on first call and shared afterwards.
    pub fn jpeg(&self, quality: u8) -> Result<Arc<[u8]>> {
        self.jpeg
            .get_or_init(|| encode_jpeg(&self.image, quality).map_err(|err| format!("{:#}", err)))
            .clone()
            .map_err(|err| anyhow!(err))
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Arc<[u8]>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer.into())
}

/// Transport-ready view of the latest frame.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Arc<[u8]>,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
    pub detections: usize,
}

impl EncodedFrame {
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.jpeg)
    }

    /// RFC 3339 capture time with microsecond precision.
    pub fn timestamp(&self) -> String {
        self.captured_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

// ----------------------------------------------------------------------------
// FrameCache
// ----------------------------------------------------------------------------

/// Single-slot, overwrite-on-publish store for the latest annotated frame.
#[derive(Debug)]
pub struct FrameCache {
    latest: RwLock<Option<Arc<AnnotatedFrame>>>,
    jpeg_quality: u8,
}

impl FrameCache {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            latest: RwLock::new(None),
            jpeg_quality,
        }
    }

    /// Replace the cached frame. Only the detection worker publishes.
    pub(crate) fn publish(&self, frame: AnnotatedFrame) -> Result<()> {
        let frame = Arc::new(frame);
        let mut slot = self
            .latest
            .write()
            .map_err(|_| anyhow!("frame cache lock poisoned"))?;
        *slot = Some(frame);
        Ok(())
    }

    /// Encode and return the latest frame, or `None` before the first publish
    /// and after a reset.
    pub fn read_latest(&self) -> Option<EncodedFrame> {
        let frame = match self.latest.read() {
            Ok(slot) => slot.clone()?,
            Err(_) => {
                log::error!("frame cache lock poisoned");
                return None;
            }
        };
        // The lock is released before encoding; the Arc keeps the frame alive.
        match frame.jpeg(self.jpeg_quality) {
            Ok(jpeg) => Some(EncodedFrame {
                jpeg,
                captured_at: frame.captured_at,
                sequence: frame.sequence,
                detections: frame.detections,
            }),
            Err(err) => {
                log::warn!("failed to encode frame {}: {:#}", frame.sequence, err);
                None
            }
        }
    }

    /// Capture time of the latest frame without encoding it.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.latest
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|frame| frame.captured_at))
    }

    /// Drop the cached frame.
    pub fn reset(&self) {
        match self.latest.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}
