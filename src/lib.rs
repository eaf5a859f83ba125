//! oilwatch: live object-detection feed service.
//!
//! A single `FeedService` owns one detection model, one capture source and a
//! background worker that reads, detects, annotates and publishes frames into a
//! single-slot cache. Callers drive it through the five-operation
//! [`ControlSurface`]; `api` exposes that surface over loopback HTTP.
//!
//! # Module Structure
//!
//! - `model`: variant catalogue, artifact provisioning, loading
//! - `detect`: the `Detector` trait, decoding and backends (synthetic, tract)
//! - `capture`: source selection, validation and the capture backends
//! - `annotate`: box and caption drawing
//! - `frame`: frames and the latest-frame cache
//! - `worker`: the detection loop and its shared state
//! - `service`: `FeedService` and the control surface

pub mod annotate;
pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod model;
pub mod service;
pub mod worker;

pub use capture::{CaptureConfig, CaptureConfigurator, CaptureSource, SourceKind};
pub use config::FeedConfig;
pub use detect::{BoundingBox, Detection, Detector, DetectorKind};
pub use error::{FeedError, FeedResult};
pub use frame::{EncodedFrame, FrameCache};
pub use model::{ModelConfig, ModelLoader, ModelProvisioner, ModelVariant};
pub use service::{ControlResponse, ControlSurface, FeedService, FrameResponse, StatusReport};
pub use worker::{CaptureStatus, ModelStatus, WorkerState};
