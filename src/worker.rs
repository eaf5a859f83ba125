//! The detection worker: background loop plus the state it shares with the
//! control operations.
//!
//! Lock order is `lifecycle` before `capture`. The worker never holds the capture
//! lock during inference, so `stop()` waits at most for one frame read.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::annotate::annotate;
use crate::capture::{CaptureHandle, SourceKind};
use crate::detect::DetectorKind;
use crate::error::{FeedError, FeedResult};
use crate::frame::{AnnotatedFrame, FrameCache};
use crate::model::{LoadedModel, ModelVariant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// A model or capture configuration is in progress.
    Configuring,
    Running,
    /// Stopped by request, by end of stream or by a loop error.
    Stopped,
}

/// Loaded model summary, readable without waiting on inference.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelStatus {
    pub variant: ModelVariant,
    pub artifact: String,
    pub threshold: f32,
    pub kind: DetectorKind,
    pub detector: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaptureStatus {
    pub source_kind: SourceKind,
    pub description: String,
    pub target_fps: u32,
    pub frame_interval_ms: f64,
}

impl CaptureStatus {
    pub(crate) fn of(handle: &CaptureHandle) -> Self {
        Self {
            source_kind: handle.config().kind(),
            description: handle.description().to_string(),
            target_fps: handle.config().target_fps,
            frame_interval_ms: handle.frame_interval().as_secs_f64() * 1000.0,
        }
    }
}

pub(crate) struct ActiveModel {
    pub(crate) status: ModelStatus,
    pub(crate) model: Mutex<LoadedModel>,
}

impl ActiveModel {
    pub(crate) fn new(model: LoadedModel) -> Self {
        let status = ModelStatus {
            variant: model.variant(),
            artifact: model.artifact().display().to_string(),
            threshold: model.config().confidence_threshold,
            kind: model.kind(),
            detector: model.detector_name(),
        };
        Self {
            status,
            model: Mutex::new(model),
        }
    }
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    pub(crate) state: WorkerState,
    /// Incremented per start; a worker only reports back for its own run.
    pub(crate) run_id: u64,
    pub(crate) last_error: Option<String>,
    pub(crate) frames_published: u64,
    pub(crate) frames_skipped: u64,
    pub(crate) capture: Option<CaptureStatus>,
    pub(crate) stop_tx: Option<Sender<()>>,
    pub(crate) join: Option<JoinHandle<()>>,
}

/// State shared between the control operations and the worker thread.
pub(crate) struct FeedShared {
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) model: RwLock<Option<Arc<ActiveModel>>>,
    pub(crate) capture: Mutex<Option<CaptureHandle>>,
    pub(crate) cache: FrameCache,
}

impl FeedShared {
    pub(crate) fn new(cache: FrameCache) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::default()),
            model: RwLock::new(None),
            capture: Mutex::new(None),
            cache,
        }
    }

    pub(crate) fn lifecycle(&self) -> FeedResult<MutexGuard<'_, Lifecycle>> {
        lock(&self.lifecycle, "lifecycle")
    }

    pub(crate) fn active_model(&self) -> FeedResult<Option<Arc<ActiveModel>>> {
        self.model
            .read()
            .map(|slot| slot.clone())
            .map_err(|_| FeedError::RuntimeLoop("model lock poisoned".to_string()))
    }

    /// Take the capture handle out of its slot. Drop the result after releasing
    /// `lifecycle`.
    pub(crate) fn take_capture(&self, lifecycle: &mut Lifecycle) -> Option<CaptureHandle> {
        lifecycle.capture = None;
        match self.capture.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> FeedResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| FeedError::RuntimeLoop(format!("{} lock poisoned", what)))
}

// ----------------------------------------------------------------------------
// Loop
// ----------------------------------------------------------------------------

enum Exit {
    Requested,
    Failed(anyhow::Error),
}

/// Worker thread body for run `run_id`.
pub(crate) fn run(shared: Arc<FeedShared>, run_id: u64, stop: Receiver<()>) {
    log::info!("detection worker {} started", run_id);
    let exit = loop {
        match stop.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break Exit::Requested,
            Err(TryRecvError::Empty) => {}
        }

        let interval = match panic::catch_unwind(AssertUnwindSafe(|| step(&shared, run_id))) {
            Ok(Ok(interval)) => interval,
            Ok(Err(err)) => break Exit::Failed(err),
            Err(payload) => {
                break Exit::Failed(anyhow!(
                    "detection worker panicked: {}",
                    panic_message(payload.as_ref())
                ))
            }
        };

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break Exit::Requested,
        }
    };
    finish(&shared, run_id, exit);
}

/// One iteration: read, detect, annotate, publish. Returns the pacing delay.
///
/// Frames are read and published only while `run_id` is the current run, so a
/// worker outliving its stop never touches a newer source or the cache.
fn step(shared: &FeedShared, run_id: u64) -> Result<Duration> {
    let (mut frame, interval) = {
        let lifecycle = loop_lock(&shared.lifecycle, "lifecycle")?;
        if !is_current(&lifecycle, run_id) {
            bail!("run {} is no longer current", run_id);
        }
        let mut slot = loop_lock(&shared.capture, "capture")?;
        drop(lifecycle);
        let capture = slot
            .as_mut()
            .ok_or_else(|| anyhow!("capture source was released"))?;
        let frame = capture
            .read_frame()
            .context("Failed to read from camera")?;
        (frame, capture.frame_interval())
    };

    let active = shared
        .model
        .read()
        .map_err(|_| anyhow!("model lock poisoned"))?
        .clone();
    let Some(active) = active else {
        let mut lifecycle = loop_lock(&shared.lifecycle, "lifecycle")?;
        if is_current(&lifecycle, run_id) {
            lifecycle.frames_skipped += 1;
        }
        return Ok(interval);
    };

    let detections = {
        // A backend panic poisons this mutex; the model itself stays usable.
        let mut model = active
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        model.detect(&frame.image).context("inference failed")?
    };
    annotate(&mut frame.image, &detections);

    let sequence = frame.sequence;
    let count = detections.len();
    let mut lifecycle = loop_lock(&shared.lifecycle, "lifecycle")?;
    if !is_current(&lifecycle, run_id) {
        log::debug!("dropping frame {} from stopped run {}", sequence, run_id);
        return Ok(interval);
    }
    shared.cache.publish(AnnotatedFrame::new(frame, count))?;
    lifecycle.frames_published += 1;
    drop(lifecycle);
    log::debug!("published frame {} with {} detections", sequence, count);
    Ok(interval)
}

fn is_current(lifecycle: &Lifecycle, run_id: u64) -> bool {
    lifecycle.run_id == run_id && lifecycle.state == WorkerState::Running
}

fn loop_lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("{} lock poisoned", what))
}

fn finish(shared: &FeedShared, run_id: u64, exit: Exit) {
    let mut lifecycle = match shared.lifecycle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let current = is_current(&lifecycle, run_id);

    match exit {
        Exit::Requested => {
            log::info!("detection worker {} stopped", run_id);
        }
        Exit::Failed(err) if current => {
            let message = FeedError::runtime(err).to_string();
            log::error!("detection worker {} ended: {}", run_id, message);
            lifecycle.state = WorkerState::Stopped;
            lifecycle.last_error = Some(message);
            lifecycle.stop_tx = None;
            let released = shared.take_capture(&mut lifecycle);
            drop(lifecycle);
            drop(released);
        }
        Exit::Failed(err) => {
            log::debug!(
                "detection worker {} ended after stop: {:#}",
                run_id,
                err
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
