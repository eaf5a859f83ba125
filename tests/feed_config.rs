use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use oilwatch::config::{BackendKind, FeedConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "OILWATCH_CONFIG",
        "OILWATCH_API_ADDR",
        "OILWATCH_MODEL_DIR",
        "OILWATCH_MODEL_BASE_URL",
        "OILWATCH_MODEL_BACKEND",
        "OILWATCH_DEVICE_TEMPLATE",
        "OILWATCH_STREAM_USERNAME",
        "OILWATCH_STREAM_PASSWORD",
        "OILWATCH_JPEG_QUALITY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "127.0.0.1:6100" },
        "models": {
            "dir": "/var/lib/oilwatch/models",
            "base_url": "http://models.local/repo/",
            "backend": "synthetic",
            "input_size": 320
        },
        "capture": {
            "device_template": "stub://cam{index}",
            "width": 640,
            "height": 480,
            "stream_username": "viewer"
        },
        "frames": { "jpeg_quality": 90 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("OILWATCH_CONFIG", file.path());
    std::env::set_var("OILWATCH_API_ADDR", "127.0.0.1:6200");
    std::env::set_var("OILWATCH_STREAM_PASSWORD", "hunter2");
    std::env::set_var("OILWATCH_JPEG_QUALITY", "70");

    let cfg = FeedConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:6200");
    assert_eq!(cfg.models.dir.to_str(), Some("/var/lib/oilwatch/models"));
    assert_eq!(cfg.models.base_url, "http://models.local/repo");
    assert_eq!(cfg.models.backend, BackendKind::Synthetic);
    assert_eq!(cfg.models.input_size, 320);
    assert_eq!(cfg.models.max_detections, 100);
    assert_eq!(cfg.capture.device_template, "stub://cam{index}");
    assert_eq!((cfg.capture.width, cfg.capture.height), (640, 480));
    assert_eq!(cfg.capture.stream_username, "viewer");
    assert_eq!(cfg.capture.stream_password, "hunter2");
    assert_eq!(cfg.frames.jpeg_quality, 70);

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[api]
addr = "127.0.0.1:7000"

[models]
backend = "stub"
nms_threshold = 0.5
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = FeedConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:7000");
    assert_eq!(cfg.models.backend, BackendKind::Synthetic);
    assert!((cfg.models.nms_threshold - 0.5).abs() < f32::EPSILON);
    assert_eq!(cfg.capture.device_template, "/dev/video{index}");
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = FeedConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.models.dir.to_str(), Some("models"));
    assert_eq!(
        cfg.models.base_url,
        "https://github.com/gabrielluizone/Vangard-OilWatch/raw/main/models"
    );
    assert_eq!(cfg.capture.stream_username, "admin");
    assert!(cfg.capture.stream_password.is_empty());
    assert_eq!(cfg.frames.jpeg_quality, 80);
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("OILWATCH_JPEG_QUALITY", "0");
    assert!(FeedConfig::load().is_err());
    std::env::set_var("OILWATCH_JPEG_QUALITY", "high");
    assert!(FeedConfig::load().is_err());
    clear_env();

    std::env::set_var("OILWATCH_DEVICE_TEMPLATE", "/dev/video0");
    let err = FeedConfig::load().expect_err("template without placeholder");
    assert!(err.to_string().contains("{index}"));
    clear_env();

    std::env::set_var("OILWATCH_MODEL_BACKEND", "torch");
    assert!(FeedConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "models": { "input_size": 16 } }"#)
        .expect("write config");
    assert!(FeedConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("absent.json");
    let err = FeedConfig::load_from(Some(&missing)).expect_err("missing file");
    assert!(err.to_string().contains("failed to read config file"));
}
