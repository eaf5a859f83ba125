use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MODEL_DIR: &str = "models";
const DEFAULT_MODEL_BASE_URL: &str =
    "https://github.com/gabrielluizone/Vangard-OilWatch/raw/main/models";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 100;
const DEFAULT_DEVICE_TEMPLATE: &str = "/dev/video{index}";
const DEFAULT_CAPTURE_WIDTH: u32 = 1280;
const DEFAULT_CAPTURE_HEIGHT: u32 = 720;
const DEFAULT_STREAM_USERNAME: &str = "admin";
const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Placeholder substituted with the local device index.
pub const DEVICE_INDEX_PLACEHOLDER: &str = "{index}";

#[derive(Debug, Deserialize, Default)]
struct FeedConfigFile {
    api: Option<ApiConfigFile>,
    models: Option<ModelConfigFile>,
    capture: Option<CaptureConfigFile>,
    frames: Option<FramesConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    dir: Option<PathBuf>,
    base_url: Option<String>,
    backend: Option<String>,
    input_size: Option<u32>,
    nms_threshold: Option<f32>,
    max_detections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device_template: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    stream_username: Option<String>,
    stream_password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FramesConfigFile {
    jpeg_quality: Option<u8>,
}

/// Inference backend used to instantiate loaded models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Deterministic detector; needs no model runtime.
    Synthetic,
    /// ONNX inference through tract.
    Tract,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(Self::Synthetic),
            "tract" | "onnx" => Ok(Self::Tract),
            other => Err(anyhow!(
                "unknown model backend '{}'; expected 'tract' or 'synthetic'",
                other
            )),
        }
    }

    fn default_for_build() -> Self {
        if cfg!(feature = "backend-tract") {
            Self::Tract
        } else {
            Self::Synthetic
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub api_addr: String,
    pub models: ModelSettings,
    pub capture: CaptureSettings,
    pub frames: FrameSettings,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Directory holding model artifacts (downloads land here too).
    pub dir: PathBuf,
    /// Remote repository prefix; artifacts are fetched from `{base_url}/{file}`.
    pub base_url: String,
    pub backend: BackendKind,
    /// Square network input edge in pixels.
    pub input_size: u32,
    pub nms_threshold: f32,
    pub max_detections: usize,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device_template: String,
    pub width: u32,
    pub height: u32,
    pub stream_username: String,
    pub stream_password: String,
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub jpeg_quality: u8,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            models: ModelSettings::default(),
            capture: CaptureSettings::default(),
            frames: FrameSettings::default(),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_MODEL_DIR),
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            backend: BackendKind::default_for_build(),
            input_size: DEFAULT_INPUT_SIZE,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device_template: DEFAULT_DEVICE_TEMPLATE.to_string(),
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            stream_username: DEFAULT_STREAM_USERNAME.to_string(),
            stream_password: String::new(),
        }
    }
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FeedConfig {
    /// Load from `OILWATCH_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OILWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Same as [`FeedConfig::load`] with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FeedConfigFile) -> Result<Self> {
        let defaults = FeedConfig::default();
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or(defaults.api_addr);

        let models_file = file.models.unwrap_or_default();
        let backend = match models_file.backend.as_deref() {
            Some(name) => BackendKind::parse(name)?,
            None => defaults.models.backend,
        };
        let models = ModelSettings {
            dir: models_file.dir.unwrap_or(defaults.models.dir),
            base_url: models_file.base_url.unwrap_or(defaults.models.base_url),
            backend,
            input_size: models_file
                .input_size
                .unwrap_or(defaults.models.input_size),
            nms_threshold: models_file
                .nms_threshold
                .unwrap_or(defaults.models.nms_threshold),
            max_detections: models_file
                .max_detections
                .unwrap_or(defaults.models.max_detections),
        };

        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            device_template: capture_file
                .device_template
                .unwrap_or(defaults.capture.device_template),
            width: capture_file.width.unwrap_or(defaults.capture.width),
            height: capture_file.height.unwrap_or(defaults.capture.height),
            stream_username: capture_file
                .stream_username
                .unwrap_or(defaults.capture.stream_username),
            stream_password: capture_file
                .stream_password
                .unwrap_or(defaults.capture.stream_password),
        };

        let frames = FrameSettings {
            jpeg_quality: file
                .frames
                .and_then(|frames| frames.jpeg_quality)
                .unwrap_or(defaults.frames.jpeg_quality),
        };

        Ok(Self {
            api_addr,
            models,
            capture,
            frames,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("OILWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = non_empty_env("OILWATCH_MODEL_DIR") {
            self.models.dir = PathBuf::from(dir);
        }
        if let Some(url) = non_empty_env("OILWATCH_MODEL_BASE_URL") {
            self.models.base_url = url;
        }
        if let Some(backend) = non_empty_env("OILWATCH_MODEL_BACKEND") {
            self.models.backend = BackendKind::parse(&backend)?;
        }
        if let Some(template) = non_empty_env("OILWATCH_DEVICE_TEMPLATE") {
            self.capture.device_template = template;
        }
        if let Some(user) = non_empty_env("OILWATCH_STREAM_USERNAME") {
            self.capture.stream_username = user;
        }
        // An empty password is meaningful, so only unset leaves it alone.
        if let Ok(password) = std::env::var("OILWATCH_STREAM_PASSWORD") {
            self.capture.stream_password = password;
        }
        if let Some(quality) = non_empty_env("OILWATCH_JPEG_QUALITY") {
            self.frames.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("OILWATCH_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.models.dir.as_os_str().is_empty() {
            return Err(anyhow!("models.dir must not be empty"));
        }
        self.models.base_url = self.models.base_url.trim_end_matches('/').to_string();
        if self.models.base_url.is_empty() {
            return Err(anyhow!("models.base_url must not be empty"));
        }
        if self.models.input_size < 32 {
            return Err(anyhow!("models.input_size must be at least 32"));
        }
        if !(self.models.nms_threshold > 0.0 && self.models.nms_threshold <= 1.0) {
            return Err(anyhow!("models.nms_threshold must be in (0, 1]"));
        }
        if self.models.max_detections == 0 {
            return Err(anyhow!("models.max_detections must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if !self
            .capture
            .device_template
            .contains(DEVICE_INDEX_PLACEHOLDER)
        {
            return Err(anyhow!(
                "capture.device_template must contain '{}'",
                DEVICE_INDEX_PLACEHOLDER
            ));
        }
        if !(1..=100).contains(&self.frames.jpeg_quality) {
            return Err(anyhow!("frames.jpeg_quality must be in 1..=100"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FeedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
