//! Capture sources.
//!
//! A `CaptureConfigurator` turns a `CaptureConfig` (local device index or network
//! stream address, plus a target frame rate) into an open `CaptureHandle`:
//! - `stub://` locations open a synthetic camera (tests, demos)
//! - local devices open through V4L2 (feature: ingest-v4l2)
//! - network streams open through GStreamer (feature: rtsp-gstreamer)
//!
//! Every handle is validated with one synchronous read before it is returned.
//! Dropping a handle releases the underlying device.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
mod stream;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

pub use synthetic::{SyntheticCamera, SyntheticDevices};

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::{CaptureSettings, DEVICE_INDEX_PLACEHOLDER};
use crate::error::{FeedError, FeedResult};
use crate::frame::Frame;

pub const MIN_TARGET_FPS: u32 = 1;
pub const MAX_TARGET_FPS: u32 = 60;
pub const DEFAULT_TARGET_FPS: u32 = 30;

const SYNTHETIC_SCHEME: &str = "stub://";

// ----------------------------------------------------------------------------
// CaptureConfig
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalIndex,
    NetworkStream,
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureSource {
    /// Local camera by device index.
    LocalIndex(u32),
    /// Network stream address (host[:port][/path] or a full URL).
    NetworkStream(String),
}

impl CaptureSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::LocalIndex(_) => SourceKind::LocalIndex,
            Self::NetworkStream(_) => SourceKind::NetworkStream,
        }
    }

    /// Interpret the wire form `(source kind, address)`.
    ///
    /// Named kinds are `local`/`local_index` and `network`/`network_stream`/`ip`.
    /// A numeric kind is itself the device index, except that `"2"` with an
    /// address selects a network stream.
    pub fn from_wire(kind: &str, address: Option<&str>) -> FeedResult<Self> {
        let kind = kind.trim().to_ascii_lowercase().replace('-', "_");
        let address = address.map(str::trim).filter(|a| !a.is_empty());
        match kind.as_str() {
            "local" | "local_index" | "webcam" => {
                let index = match address {
                    Some(address) => parse_index(address)?,
                    None => 0,
                };
                Ok(Self::LocalIndex(index))
            }
            "network" | "network_stream" | "ip" | "rtsp" => address
                .map(|a| Self::NetworkStream(a.to_string()))
                .ok_or_else(|| FeedError::rejected("network stream requires an address")),
            numeric => match address {
                Some(address) if numeric == "2" => Ok(Self::NetworkStream(address.to_string())),
                _ => parse_index(numeric).map(Self::LocalIndex),
            },
        }
    }
}

fn parse_index(value: &str) -> FeedResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| FeedError::rejected(format!("invalid local device index '{}'", value)))
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalIndex(index) => write!(f, "local device {}", index),
            Self::NetworkStream(address) => write!(f, "network stream {}", redact(address)),
        }
    }
}

/// Validated capture selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    pub target_fps: u32,
}

impl CaptureConfig {
    pub fn new(source: CaptureSource, target_fps: u32) -> FeedResult<Self> {
        if !(MIN_TARGET_FPS..=MAX_TARGET_FPS).contains(&target_fps) {
            return Err(FeedError::rejected(format!(
                "fps must be between {} and {}, got {}",
                MIN_TARGET_FPS, MAX_TARGET_FPS, target_fps
            )));
        }
        if let CaptureSource::NetworkStream(address) = &source {
            if address.trim().is_empty() {
                return Err(FeedError::rejected("network stream requires an address"));
            }
        }
        Ok(Self { source, target_fps })
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// Pacing delay between loop iterations: `1 / target_fps`.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps))
    }
}

// ----------------------------------------------------------------------------
// CaptureHandle
// ----------------------------------------------------------------------------

enum CaptureBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    Device(v4l2::V4l2Camera),
    #[cfg(feature = "rtsp-gstreamer")]
    Stream(stream::GstreamerStream),
}

/// An open, validated capture resource. Released on drop.
pub struct CaptureHandle {
    config: CaptureConfig,
    description: String,
    backend: CaptureBackend,
    frames_read: u64,
}

impl CaptureHandle {
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Location with credentials redacted.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn frame_interval(&self) -> Duration {
        self.config.frame_interval()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Blocking read of the next frame.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let image = match &mut self.backend {
            CaptureBackend::Synthetic(camera) => camera.read_image()?,
            #[cfg(feature = "ingest-v4l2")]
            CaptureBackend::Device(camera) => camera.read_image()?,
            #[cfg(feature = "rtsp-gstreamer")]
            CaptureBackend::Stream(stream) => stream.read_image()?,
        };
        let frame = Frame::new(image, self.frames_read);
        self.frames_read += 1;
        Ok(frame)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        log::info!(
            "capture released: {} after {} frames",
            self.description,
            self.frames_read
        );
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("config", &self.config)
            .field("description", &self.description)
            .field("frames_read", &self.frames_read)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// CaptureConfigurator
// ----------------------------------------------------------------------------

/// Opens capture handles according to the capture settings.
#[derive(Clone, Debug)]
pub struct CaptureConfigurator {
    settings: CaptureSettings,
    devices: SyntheticDevices,
}

impl CaptureConfigurator {
    pub fn new(settings: CaptureSettings) -> Self {
        Self::with_devices(settings, SyntheticDevices::default())
    }

    /// Share a synthetic device registry, e.g. to observe opens and releases.
    pub fn with_devices(settings: CaptureSettings, devices: SyntheticDevices) -> Self {
        Self { settings, devices }
    }

    pub fn devices(&self) -> &SyntheticDevices {
        &self.devices
    }

    /// Location string the source resolves to (device path or stream URL).
    pub fn resolve(&self, source: &CaptureSource) -> String {
        match source {
            CaptureSource::LocalIndex(index) => self
                .settings
                .device_template
                .replace(DEVICE_INDEX_PLACEHOLDER, &index.to_string()),
            CaptureSource::NetworkStream(address) => {
                let address = address.trim();
                if address.contains("://") {
                    return address.to_string();
                }
                let user = self.settings.stream_username.as_str();
                let password = self.settings.stream_password.as_str();
                match (user.is_empty(), password.is_empty()) {
                    (true, true) => format!("rtsp://{}", address),
                    (false, true) => format!("rtsp://{}@{}", user, address),
                    _ => format!("rtsp://{}:{}@{}", user, password, address),
                }
            }
        }
    }

    /// Open and validate a capture source.
    ///
    /// The caller must have released any previous handle for the same device.
    pub fn open(&self, config: &CaptureConfig) -> FeedResult<CaptureHandle> {
        let location = self.resolve(&config.source);
        let description = redact(&location);
        log::info!(
            "opening {} at {} ({} fps requested)",
            config.source,
            description,
            config.target_fps
        );

        let backend = self
            .open_backend(config, &location)
            .map_err(FeedError::capture)?;
        let mut handle = CaptureHandle {
            config: config.clone(),
            description,
            backend,
            frames_read: 0,
        };

        if let Err(err) = handle.read_frame() {
            log::warn!("validation read failed on {}: {:#}", handle.description, err);
            return Err(FeedError::Capture(format!(
                "Failed to read from camera: {:#}",
                err
            )));
        }
        Ok(handle)
    }

    fn open_backend(&self, config: &CaptureConfig, location: &str) -> Result<CaptureBackend> {
        if location.starts_with(SYNTHETIC_SCHEME) {
            let camera = SyntheticCamera::open(
                location,
                self.settings.width,
                self.settings.height,
                &self.devices,
            )?;
            return Ok(CaptureBackend::Synthetic(camera));
        }
        match config.kind() {
            SourceKind::LocalIndex => self.open_device(config, location),
            SourceKind::NetworkStream => self.open_stream(config, location),
        }
    }

    #[cfg(feature = "ingest-v4l2")]
    fn open_device(&self, config: &CaptureConfig, location: &str) -> Result<CaptureBackend> {
        let camera = v4l2::V4l2Camera::open(
            location,
            self.settings.width,
            self.settings.height,
            config.target_fps,
        )?;
        Ok(CaptureBackend::Device(camera))
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    fn open_device(&self, _config: &CaptureConfig, location: &str) -> Result<CaptureBackend> {
        Err(anyhow::anyhow!(
            "cannot open {}: local capture requires the ingest-v4l2 feature",
            location
        ))
    }

    #[cfg(feature = "rtsp-gstreamer")]
    fn open_stream(&self, config: &CaptureConfig, location: &str) -> Result<CaptureBackend> {
        let stream = stream::GstreamerStream::open(location, config.target_fps)?;
        Ok(CaptureBackend::Stream(stream))
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    fn open_stream(&self, _config: &CaptureConfig, location: &str) -> Result<CaptureBackend> {
        Err(anyhow::anyhow!(
            "cannot open {}: network streams require the rtsp-gstreamer feature",
            redact(location)
        ))
    }
}

/// Replace any password in a URL-like location with `***`.
pub fn redact(location: &str) -> String {
    match url::Url::parse(location) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                location.to_string()
            }
        }
        _ => location.to_string(),
    }
}
