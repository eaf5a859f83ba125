use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use oilwatch::capture::SyntheticDevices;
use oilwatch::config::BackendKind;
use oilwatch::{
    CaptureConfigurator, ControlSurface, FeedConfig, FeedService, ModelVariant, SourceKind,
    WorkerState,
};

struct Fixture {
    dir: TempDir,
    devices: SyntheticDevices,
    service: FeedService,
}

impl Fixture {
    fn new() -> Self {
        Self::with_base_url(closed_port_url())
    }

    fn with_base_url(base_url: String) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = FeedConfig::default();
        config.models.dir = dir.path().to_path_buf();
        config.models.base_url = base_url;
        config.models.backend = BackendKind::Synthetic;
        config.capture.device_template = "stub://cam{index}".to_string();
        config.capture.width = 64;
        config.capture.height = 48;
        std::fs::write(dir.path().join("yolov8n.onnx"), b"simple-model").expect("seed model");
        std::fs::write(dir.path().join("Vo5.onnx"), b"oil-model").expect("seed model");

        let devices = SyntheticDevices::default();
        let configurator = CaptureConfigurator::with_devices(config.capture.clone(), devices.clone());
        let service = FeedService::with_configurator(&config, configurator);
        Self {
            dir,
            devices,
            service,
        }
    }

    fn models(&self) -> &Path {
        self.dir.path()
    }
}

fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/models", addr)
}

/// Answers every request with `200 OK` and an empty body.
fn empty_repository() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        }
    });
    format!("http://{}/models", addr)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("rfc3339 timestamp")
        .with_timezone(&Utc)
}

#[test]
fn oil_model_local_camera_full_cycle() {
    let fx = Fixture::new();
    let svc = &fx.service;

    let response = ControlSurface::load_model(svc, "oil_specialized", Some(70));
    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "Model Vo5.onnx loaded successfully");
    let model = svc.status().model.expect("model loaded");
    assert_eq!(model.variant, ModelVariant::OilSpecialized);
    assert!((model.threshold - 0.70).abs() < 1e-6);

    let response = ControlSurface::configure_capture(svc, "local", Some("0"), Some(15));
    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "Camera setup successful (FPS: 15)");
    let capture = svc.status().capture.expect("capture configured");
    assert_eq!(capture.source_kind, SourceKind::LocalIndex);
    assert!((capture.frame_interval_ms - 1000.0 / 15.0).abs() < 0.01);
    assert!(fx.devices.is_open("stub://cam0"));

    let response = ControlSurface::start(svc);
    assert!(response.success, "{}", response.message);
    assert_eq!(response.message, "Detection started");

    let mut timestamps = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        let frame = svc.current_frame();
        if frame.frame.is_some() && timestamps.last() != Some(&frame.timestamp) {
            timestamps.push(frame.timestamp);
        }
        timestamps.len() >= 3
    }));
    for pair in timestamps.windows(2) {
        assert!(parse_timestamp(&pair[0]) < parse_timestamp(&pair[1]));
    }

    let response = ControlSurface::stop(svc);
    assert!(response.success);
    assert_eq!(response.message, "Detection stopped");
    assert!(svc.current_frame().frame.is_some());
    assert!(!fx.devices.is_open("stub://cam0"));
    assert_eq!(svc.state(), WorkerState::Stopped);

    let response = ControlSurface::configure_capture(svc, "local", Some("0"), Some(15));
    assert!(response.success, "{}", response.message);
    assert_eq!(fx.devices.open_count("stub://cam0"), 2);
}

#[test]
fn latest_frame_is_none_before_first_publish() {
    let fx = Fixture::new();
    assert!(fx.service.read_latest().is_none());
    let frame = fx.service.current_frame();
    assert!(frame.frame.is_none());
    parse_timestamp(&frame.timestamp);
}

#[test]
fn start_twice_keeps_a_single_worker() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::load_model(svc, "1", None).success);
    assert!(ControlSurface::configure_capture(svc, "0", None, Some(30)).success);

    assert!(ControlSurface::start(svc).success);
    let second = ControlSurface::start(svc);
    assert!(second.success);
    assert_eq!(second.message, "Detection already running");
    assert_eq!(svc.state(), WorkerState::Running);
    assert_eq!(fx.devices.open_count("stub://cam0"), 1);

    assert!(ControlSurface::stop(svc).success);
}

#[test]
fn reconfiguring_releases_previous_source_once() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::configure_capture(svc, "local", Some("0"), None).success);
    assert!(ControlSurface::configure_capture(svc, "local", Some("1"), None).success);

    assert_eq!(fx.devices.release_count("stub://cam0"), 1);
    assert!(!fx.devices.is_open("stub://cam0"));
    assert!(fx.devices.is_open("stub://cam1"));

    assert!(ControlSurface::configure_capture(svc, "local", Some("1"), None).success);
    assert_eq!(fx.devices.open_count("stub://cam1"), 2);
    assert_eq!(fx.devices.release_count("stub://cam1"), 1);
    assert_eq!(fx.devices.release_count("stub://cam0"), 1);
}

#[test]
fn failed_fetch_keeps_previous_model_and_leaves_no_artifact() {
    let fx = Fixture::with_base_url(empty_repository());
    let svc = &fx.service;
    assert!(ControlSurface::load_model(svc, "simple", Some(40)).success);

    let response = ControlSurface::load_model(svc, "residue", Some(70));
    assert!(!response.success);
    assert!(response.message.contains("To9.onnx"), "{}", response.message);

    let model = svc.status().model.expect("previous model stays");
    assert_eq!(model.variant, ModelVariant::Simple);
    assert!((model.threshold - 0.40).abs() < 1e-6);
    assert!(!fx.models().join("To9.onnx").exists());
    assert!(!fx.models().join("To9.onnx.part").exists());
    assert_eq!(svc.state(), WorkerState::Idle);
}

#[test]
fn unreachable_repository_fails_load() {
    let fx = Fixture::new();
    let response = ControlSurface::load_model(&fx.service, "3", Some(50));
    assert!(!response.success);
    assert!(fx.service.status().model.is_none());
    assert!(!fx.models().join("To9.onnx").exists());
}

#[test]
fn publishes_are_spaced_by_frame_interval() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::load_model(svc, "1", None).success);
    assert!(ControlSurface::configure_capture(svc, "0", None, Some(20)).success);
    assert!(ControlSurface::start(svc).success);

    let mut seen: Vec<(u64, DateTime<Utc>)> = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        if let Some(frame) = svc.read_latest() {
            if seen.last().map(|(seq, _)| *seq) != Some(frame.sequence) {
                seen.push((frame.sequence, frame.captured_at));
            }
        }
        seen.len() >= 4
    }));
    assert!(ControlSurface::stop(svc).success);

    for pair in seen.windows(2) {
        assert!(pair[0].0 < pair[1].0, "sequences out of order");
        let gap = pair[1].1 - pair[0].1;
        assert!(
            gap >= chrono::Duration::milliseconds(49),
            "frames {} and {} only {:?} apart",
            pair[0].0,
            pair[1].0,
            gap
        );
    }
}

#[test]
fn configuration_while_running_is_rejected() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::configure_capture(svc, "0", None, Some(30)).success);
    assert!(ControlSurface::start(svc).success);

    assert!(!ControlSurface::configure_capture(svc, "1", None, Some(30)).success);
    assert!(!ControlSurface::load_model(svc, "1", Some(50)).success);
    assert!(fx.devices.is_open("stub://cam0"));
    assert!(!fx.devices.is_open("stub://cam1"));
    assert_eq!(svc.state(), WorkerState::Running);

    assert!(ControlSurface::stop(svc).success);
    assert!(ControlSurface::load_model(svc, "1", Some(50)).success);
}

#[test]
fn failed_validation_read_leaves_no_capture() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::configure_capture(svc, "0", None, None).success);

    let response = ControlSurface::configure_capture(svc, "network", Some("stub://dead?frames=0"), None);
    assert!(!response.success);
    assert!(response.message.contains("Failed to read from camera"), "{}", response.message);
    assert!(svc.status().capture.is_none());
    assert!(!fx.devices.is_open("stub://dead"));
    assert!(!fx.devices.is_open("stub://cam0"));

    let response = ControlSurface::start(svc);
    assert!(!response.success);
}

#[test]
fn end_of_stream_stops_detection_with_error() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::load_model(svc, "1", None).success);
    assert!(ControlSurface::configure_capture(svc, "2", Some("stub://clip?frames=4"), Some(60)).success);
    assert_eq!(
        svc.status().capture.map(|c| c.source_kind),
        Some(SourceKind::NetworkStream)
    );
    assert!(ControlSurface::start(svc).success);

    assert!(wait_until(Duration::from_secs(5), || svc.state() == WorkerState::Stopped));
    let status = svc.status();
    assert_eq!(status.frames_published, 3);
    let error = status.last_error.expect("loop error recorded");
    assert!(error.contains("detection loop failed"), "{}", error);
    assert!(!fx.devices.is_open("stub://clip"));
    assert!(svc.read_latest().is_some());

    let response = ControlSurface::start(svc);
    assert!(!response.success);
}

#[test]
fn stop_is_always_successful() {
    let fx = Fixture::new();
    let svc = &fx.service;
    assert!(ControlSurface::stop(svc).success);
    assert_eq!(svc.state(), WorkerState::Idle);

    assert!(ControlSurface::configure_capture(svc, "0", None, None).success);
    assert!(ControlSurface::stop(svc).success);
    assert!(!fx.devices.is_open("stub://cam0"));
    assert!(ControlSurface::stop(svc).success);
}

#[cfg(not(feature = "ingest-v4l2"))]
#[test]
fn local_devices_need_the_v4l2_feature() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = FeedConfig::default();
    config.models.dir = dir.path().to_path_buf();
    let service = FeedService::new(&config);
    let response = ControlSurface::configure_capture(&service, "0", None, None);
    assert!(!response.success);
    assert!(response.message.contains("ingest-v4l2"), "{}", response.message);
}
