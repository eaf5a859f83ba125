//! The feed service and its control surface.
//!
//! `FeedService` owns the one active model, the one active capture source, the
//! frame cache and the detection worker. Callers share it through an `Arc`.
//! `ControlSurface` is the five-operation contract the HTTP layer drives; it
//! never fails, every error becomes `success: false` plus a message.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::capture::{CaptureConfig, CaptureConfigurator, CaptureSource, DEFAULT_TARGET_FPS};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::frame::{EncodedFrame, FrameCache};
use crate::model::{
    DownloadProgress, LoadedModel, ModelLoader, ModelVariant, DEFAULT_CONFIDENCE_PERCENT,
};
use crate::worker::{
    self, lock, ActiveModel, CaptureStatus, FeedShared, ModelStatus, WorkerState,
};

/// Outcome of a control operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    fn from_result(op: &str, result: FeedResult<String>) -> Self {
        match result {
            Ok(message) => Self {
                success: true,
                message,
            },
            Err(err) => {
                log::warn!("{} failed: {}", op, err);
                Self {
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Latest frame as base64 JPEG, or `None` when nothing was published yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameResponse {
    pub frame: Option<String>,
    /// Capture time of the frame, or the current time when there is none.
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: WorkerState,
    pub model: Option<ModelStatus>,
    pub capture: Option<CaptureStatus>,
    pub frames_published: u64,
    pub frames_skipped: u64,
    pub last_error: Option<String>,
    pub last_frame_at: Option<String>,
}

/// The operations external callers use to drive the feed.
pub trait ControlSurface {
    /// Select a model by wire identifier at a 1–99 confidence percentage.
    fn load_model(&self, variant: &str, confidence_percent: Option<i64>) -> ControlResponse;

    /// Select and validate a capture source.
    fn configure_capture(
        &self,
        source_kind: &str,
        address: Option<&str>,
        target_fps: Option<i64>,
    ) -> ControlResponse;

    fn start(&self) -> ControlResponse;

    fn stop(&self) -> ControlResponse;

    fn current_frame(&self) -> FrameResponse;
}

pub struct FeedService {
    shared: Arc<FeedShared>,
    loader: ModelLoader,
    configurator: CaptureConfigurator,
    /// Serializes configuration and start.
    config_lock: Mutex<()>,
}

/// Holds `Configuring` for the duration of a configuration operation.
struct ConfigureGuard<'a> {
    shared: &'a FeedShared,
    previous: WorkerState,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for ConfigureGuard<'_> {
    fn drop(&mut self) {
        match self.shared.lifecycle.lock() {
            Ok(mut lc) => lc.state = self.previous,
            Err(poisoned) => poisoned.into_inner().state = self.previous,
        }
    }
}

impl FeedService {
    pub fn new(config: &FeedConfig) -> Self {
        Self::with_configurator(config, CaptureConfigurator::new(config.capture.clone()))
    }

    /// Build with an explicit capture configurator, e.g. one sharing a synthetic
    /// device registry with the caller.
    pub fn with_configurator(config: &FeedConfig, configurator: CaptureConfigurator) -> Self {
        Self {
            shared: Arc::new(FeedShared::new(FrameCache::new(config.frames.jpeg_quality))),
            loader: ModelLoader::new(&config.models),
            configurator,
            config_lock: Mutex::new(()),
        }
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    pub fn configurator(&self) -> &CaptureConfigurator {
        &self.configurator
    }

    pub fn cache(&self) -> &FrameCache {
        &self.shared.cache
    }

    pub fn state(&self) -> WorkerState {
        match self.shared.lifecycle.lock() {
            Ok(lc) => lc.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    fn begin_configure(&self) -> FeedResult<ConfigureGuard<'_>> {
        let serial = lock(&self.config_lock, "configuration")?;
        let mut lc = self.shared.lifecycle()?;
        if lc.state == WorkerState::Running {
            return Err(FeedError::rejected(
                "Detection is running; stop it before reconfiguring",
            ));
        }
        let previous = lc.state;
        lc.state = WorkerState::Configuring;
        Ok(ConfigureGuard {
            shared: &self.shared,
            previous,
            _serial: serial,
        })
    }

    /// Load a model, replacing the active one only on success.
    pub fn load_model(&self, variant: ModelVariant, confidence_percent: u8) -> FeedResult<String> {
        self.load_model_with_progress(variant, confidence_percent, |_| {})
    }

    pub fn load_model_with_progress(
        &self,
        variant: ModelVariant,
        confidence_percent: u8,
        on_progress: impl FnMut(DownloadProgress),
    ) -> FeedResult<String> {
        let _guard = self.begin_configure()?;
        let loaded = self
            .loader
            .load_with_progress(variant, confidence_percent, on_progress)?;
        self.install_model(loaded)?;
        Ok(format!("Model {} loaded successfully", variant.artifact()))
    }

    /// Make `loaded` the active model, replacing any previous one.
    pub(crate) fn install_model(&self, loaded: LoadedModel) -> FeedResult<()> {
        let active = Arc::new(ActiveModel::new(loaded));
        let mut slot = self
            .shared
            .model
            .write()
            .map_err(|_| FeedError::RuntimeLoop("model lock poisoned".to_string()))?;
        *slot = Some(active);
        Ok(())
    }

    /// Release the current capture source, then open and validate `config`.
    ///
    /// On failure no capture source is active.
    pub fn configure_capture(&self, config: CaptureConfig) -> FeedResult<String> {
        let _guard = self.begin_configure()?;
        let previous = {
            let mut lc = self.shared.lifecycle()?;
            self.shared.take_capture(&mut lc)
        };
        drop(previous);

        let handle = self.configurator.open(&config)?;
        let status = CaptureStatus::of(&handle);
        {
            let mut lc = self.shared.lifecycle()?;
            *lock(&self.shared.capture, "capture")? = Some(handle);
            lc.capture = Some(status);
        }
        self.shared.cache.reset();
        Ok(format!(
            "Camera setup successful (FPS: {})",
            config.target_fps
        ))
    }

    /// Spawn the worker. A no-op when already running.
    pub fn start(&self) -> FeedResult<String> {
        let _serial = lock(&self.config_lock, "configuration")?;
        let previous = {
            let mut lc = self.shared.lifecycle()?;
            if lc.state == WorkerState::Running {
                return Ok("Detection already running".to_string());
            }
            lc.join.take()
        };
        if let Some(join) = previous {
            if join.join().is_err() {
                log::warn!("previous detection worker panicked");
            }
        }

        if lock(&self.shared.capture, "capture")?.is_none() {
            return Err(FeedError::rejected(
                "Camera not configured; set up a camera before starting detection",
            ));
        }
        if self.shared.active_model()?.is_none() {
            log::warn!("starting detection without a model; frames will be skipped");
        }

        let mut lc = self.shared.lifecycle()?;
        let (stop_tx, stop_rx) = mpsc::channel();
        lc.run_id += 1;
        let run_id = lc.run_id;
        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name(format!("oilwatch-worker-{}", run_id))
            .spawn(move || worker::run(shared, run_id, stop_rx))
            .map_err(|err| {
                FeedError::runtime(anyhow::Error::new(err).context("spawn detection worker"))
            })?;

        lc.state = WorkerState::Running;
        lc.last_error = None;
        lc.frames_published = 0;
        lc.frames_skipped = 0;
        lc.stop_tx = Some(stop_tx);
        lc.join = Some(join);
        Ok("Detection started".to_string())
    }

    /// Signal the worker and release the capture source. The last published
    /// frame stays readable.
    pub fn stop(&self) -> FeedResult<String> {
        let released = {
            let mut lc = self.shared.lifecycle()?;
            match lc.state {
                WorkerState::Running => {
                    lc.state = WorkerState::Stopped;
                    if let Some(tx) = lc.stop_tx.take() {
                        let _ = tx.send(());
                    }
                    self.shared.take_capture(&mut lc)
                }
                WorkerState::Configuring => None,
                WorkerState::Idle | WorkerState::Stopped => {
                    let released = self.shared.take_capture(&mut lc);
                    if released.is_some() {
                        lc.state = WorkerState::Stopped;
                    }
                    released
                }
            }
        };
        drop(released);
        Ok("Detection stopped".to_string())
    }

    /// Latest encoded frame, if any was published since the last capture change.
    pub fn read_latest(&self) -> Option<EncodedFrame> {
        self.shared.cache.read_latest()
    }

    pub fn status(&self) -> StatusReport {
        let model = self
            .shared
            .active_model()
            .ok()
            .flatten()
            .map(|active| active.status.clone());
        let last_frame_at = self
            .shared
            .cache
            .latest_timestamp()
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true));
        let lc = match self.shared.lifecycle.lock() {
            Ok(lc) => lc,
            Err(poisoned) => poisoned.into_inner(),
        };
        StatusReport {
            state: lc.state,
            model,
            capture: lc.capture.clone(),
            frames_published: lc.frames_published,
            frames_skipped: lc.frames_skipped,
            last_error: lc.last_error.clone(),
            last_frame_at,
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&self) {
        if let Err(err) = self.stop() {
            log::warn!("stop during shutdown failed: {}", err);
        }
        let join = match self.shared.lifecycle.lock() {
            Ok(mut lc) => lc.join.take(),
            Err(poisoned) => poisoned.into_inner().join.take(),
        };
        if let Some(join) = join {
            if join.join().is_err() {
                log::warn!("detection worker panicked");
            }
        }
    }
}

impl Drop for FeedService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn percent_from_wire(value: Option<i64>) -> FeedResult<u8> {
    let value = value.unwrap_or(i64::from(DEFAULT_CONFIDENCE_PERCENT));
    u8::try_from(value).map_err(|_| {
        FeedError::rejected(format!(
            "confidence must be between 1 and 99 percent, got {}",
            value
        ))
    })
}

fn fps_from_wire(value: Option<i64>) -> FeedResult<u32> {
    let value = value.unwrap_or(i64::from(DEFAULT_TARGET_FPS));
    u32::try_from(value)
        .map_err(|_| FeedError::rejected(format!("fps must be between 1 and 60, got {}", value)))
}

impl ControlSurface for FeedService {
    fn load_model(&self, variant: &str, confidence_percent: Option<i64>) -> ControlResponse {
        let result = ModelVariant::parse(variant).and_then(|variant| {
            let percent = percent_from_wire(confidence_percent)?;
            FeedService::load_model(self, variant, percent)
        });
        ControlResponse::from_result("load model", result)
    }

    fn configure_capture(
        &self,
        source_kind: &str,
        address: Option<&str>,
        target_fps: Option<i64>,
    ) -> ControlResponse {
        let result = CaptureSource::from_wire(source_kind, address)
            .and_then(|source| CaptureConfig::new(source, fps_from_wire(target_fps)?))
            .and_then(|config| FeedService::configure_capture(self, config));
        ControlResponse::from_result("configure capture", result)
    }

    fn start(&self) -> ControlResponse {
        ControlResponse::from_result("start", FeedService::start(self))
    }

    fn stop(&self) -> ControlResponse {
        ControlResponse::from_result("stop", FeedService::stop(self))
    }

    fn current_frame(&self) -> FrameResponse {
        match self.read_latest() {
            Some(frame) => FrameResponse {
                frame: Some(frame.to_base64()),
                timestamp: frame.timestamp(),
            },
            None => FrameResponse {
                frame: None,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::detect::{Detection, Detector, DetectorKind};
    use crate::model::ModelConfig;
    use image::RgbImage;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> FeedService {
        let mut config = FeedConfig::default();
        config.models.dir = dir.path().to_path_buf();
        config.models.backend = BackendKind::Synthetic;
        config.capture.device_template = "stub://unit{index}".to_string();
        config.capture.width = 32;
        config.capture.height = 24;
        std::fs::write(dir.path().join("yolov8n.onnx"), b"model").unwrap();
        FeedService::new(&config)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_without_capture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let response = ControlSurface::start(&svc);
        assert!(!response.success);
        assert!(response.message.contains("Camera not configured"));
        assert_eq!(svc.state(), WorkerState::Idle);
    }

    #[test]
    fn frame_before_publish_is_null_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let frame = svc.current_frame();
        assert!(frame.frame.is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(&frame.timestamp).is_ok());
    }

    #[test]
    fn wire_values_out_of_range_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(!ControlSurface::load_model(&svc, "1", Some(300)).success);
        assert!(!ControlSurface::load_model(&svc, "1", Some(0)).success);
        assert!(!ControlSurface::load_model(&svc, "9", Some(50)).success);
        assert!(!svc.configure_capture_wire("0", None, Some(-1)).success);
        assert!(!svc.configure_capture_wire("0", None, Some(61)).success);
        assert_eq!(svc.state(), WorkerState::Idle);
    }

    #[test]
    fn runs_without_model_and_counts_skipped_frames() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(svc.configure_capture_wire("0", None, Some(60)).success);
        assert!(ControlSurface::start(&svc).success);
        assert!(wait_for(|| svc.status().frames_skipped >= 2));
        assert!(svc.read_latest().is_none());
        assert!(ControlSurface::stop(&svc).success);
    }

    #[test]
    fn configuration_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(svc.configure_capture_wire("0", None, Some(30)).success);
        assert!(ControlSurface::start(&svc).success);

        let response = ControlSurface::load_model(&svc, "simple", Some(40));
        assert!(!response.success);
        assert!(response.message.contains("stop it before reconfiguring"));
        assert!(!svc.configure_capture_wire("1", None, Some(30)).success);
        assert_eq!(svc.state(), WorkerState::Running);
        svc.shutdown();
    }

    #[test]
    fn end_of_stream_stops_worker_and_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(ControlSurface::load_model(&svc, "1", Some(50)).success);
        let response = svc.configure_capture_wire("network", Some("stub://short?frames=3"), Some(60));
        assert!(response.success, "{}", response.message);
        assert!(ControlSurface::start(&svc).success);

        assert!(wait_for(|| svc.state() == WorkerState::Stopped));
        let status = svc.status();
        assert_eq!(status.frames_published, 2);
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Failed to read from camera")));
        assert!(status.capture.is_none());
        assert!(svc.read_latest().is_some());
    }

    struct SlowDetector;

    impl Detector for SlowDetector {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn kind(&self) -> DetectorKind {
            DetectorKind::Standard
        }

        fn detect(&mut self, _frame: &RgbImage, _threshold: f32) -> anyhow::Result<Vec<Detection>> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(Vec::new())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn kind(&self) -> DetectorKind {
            DetectorKind::Standard
        }

        fn detect(&mut self, _frame: &RgbImage, _threshold: f32) -> anyhow::Result<Vec<Detection>> {
            Err(anyhow::anyhow!("tensor shape mismatch"))
        }
    }

    #[derive(Default)]
    struct PanicsOnceDetector {
        calls: u32,
    }

    impl Detector for PanicsOnceDetector {
        fn name(&self) -> &'static str {
            "panics_once"
        }

        fn kind(&self) -> DetectorKind {
            DetectorKind::Standard
        }

        fn detect(&mut self, _frame: &RgbImage, _threshold: f32) -> anyhow::Result<Vec<Detection>> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("backend blew up once");
            }
            Ok(Vec::new())
        }
    }

    fn install(svc: &FeedService, detector: impl Detector + 'static) {
        let config = ModelConfig::new(ModelVariant::Simple, 50).unwrap();
        let model = LoadedModel::new(config, PathBuf::from("test.onnx"), Box::new(detector));
        svc.install_model(model).unwrap();
    }

    #[test]
    fn stopped_worker_never_publishes_into_new_source() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        assert!(svc.configure_capture_wire("0", None, Some(30)).success);
        install(&svc, SlowDetector);
        assert!(ControlSurface::start(&svc).success);

        // Stop while the first frame is still in inference.
        std::thread::sleep(Duration::from_millis(100));
        assert!(ControlSurface::stop(&svc).success);
        assert!(svc.configure_capture_wire("1", None, Some(30)).success);
        std::thread::sleep(Duration::from_millis(700));

        assert!(svc.read_latest().is_none());
        let status = svc.status();
        assert_eq!(status.frames_published, 0);
        assert!(status
            .capture
            .is_some_and(|c| c.description == "stub://unit1"));
        assert!(svc.configurator().devices().is_open("stub://unit1"));
    }

    #[test]
    fn inference_error_ends_run_and_releases_capture() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        install(&svc, FailingDetector);
        assert!(svc.configure_capture_wire("0", None, Some(60)).success);
        assert!(ControlSurface::start(&svc).success);

        assert!(wait_for(|| svc.state() == WorkerState::Stopped));
        let status = svc.status();
        let error = status.last_error.expect("loop error recorded");
        assert!(error.starts_with("detection loop failed: inference failed"), "{}", error);
        assert!(error.contains("tensor shape mismatch"), "{}", error);
        assert_eq!(error.matches("detection loop failed").count(), 1);
        assert!(status.capture.is_none());
        assert!(!svc.configurator().devices().is_open("stub://unit0"));
        assert_eq!(status.frames_published, 0);
    }

    #[test]
    fn backend_panic_ends_one_run_and_model_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        install(&svc, PanicsOnceDetector::default());
        assert!(svc.configure_capture_wire("0", None, Some(60)).success);
        assert!(ControlSurface::start(&svc).success);

        assert!(wait_for(|| svc.state() == WorkerState::Stopped));
        let status = svc.status();
        let error = status.last_error.expect("panic recorded");
        assert!(error.contains("backend blew up once"), "{}", error);
        assert!(status.capture.is_none());
        assert!(!svc.configurator().devices().is_open("stub://unit0"));

        assert!(svc.configure_capture_wire("0", None, Some(60)).success);
        let response = ControlSurface::start(&svc);
        assert!(response.success, "{}", response.message);
        assert!(wait_for(|| svc.status().frames_published >= 2));
        let status = svc.status();
        assert_eq!(status.state, WorkerState::Running);
        assert!(status.last_error.is_none());
        assert_eq!(status.model.map(|m| m.detector), Some("panics_once"));
        assert!(ControlSurface::stop(&svc).success);
    }

    impl FeedService {
        fn configure_capture_wire(
            &self,
            kind: &str,
            address: Option<&str>,
            fps: Option<i64>,
        ) -> ControlResponse {
            ControlSurface::configure_capture(self, kind, address, fps)
        }
    }
}
