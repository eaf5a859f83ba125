//! demo - end-to-end synthetic run of the detection feed
//!
//! Uses the synthetic camera and the synthetic detector, so it needs no hardware,
//! network or model files. Writes the last annotated frame and a status snapshot
//! to the output directory.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use oilwatch::config::BackendKind;
use oilwatch::{
    CaptureConfig, CaptureSource, ControlSurface, FeedConfig, FeedService, ModelVariant,
};

#[path = "../ui.rs"]
mod ui;

const DEMO_CONFIDENCE_PERCENT: u8 = 50;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// How long detection runs, in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Target frames per second (1-60).
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Output directory for the last frame and status snapshot.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// Plain output even on a terminal.
    #[arg(long)]
    plain: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(args.plain);

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)?;

    let mut config = FeedConfig::default();
    config.models.backend = BackendKind::Synthetic;
    config.models.dir = out_dir.join("models");
    config.capture.device_template = "stub://demo{index}".to_string();
    config.capture.width = 640;
    config.capture.height = 480;

    // The synthetic detector ignores artifact contents but the loader still
    // requires a non-empty file.
    let variant = ModelVariant::Simple;
    fs::create_dir_all(&config.models.dir)?;
    let artifact = config.models.dir.join(variant.artifact());
    if !artifact.is_file() {
        fs::write(&artifact, b"synthetic")
            .with_context(|| format!("write {}", artifact.display()))?;
    }

    let service = FeedService::new(&config);
    {
        let _stage = ui.stage("Load model");
        let message = service.load_model(variant, DEMO_CONFIDENCE_PERCENT)?;
        eprintln!("demo: {}", message);
    }
    {
        let _stage = ui.stage("Set up camera");
        let capture = CaptureConfig::new(CaptureSource::LocalIndex(0), args.fps)?;
        let message = service.configure_capture(capture)?;
        eprintln!("demo: {}", message);
    }
    {
        let _stage = ui.stage(&format!("Detect for {}s", args.seconds));
        service.start()?;
        std::thread::sleep(Duration::from_secs(args.seconds));
        service.stop()?;
    }

    let status = service.status();
    let frame = service
        .current_frame()
        .frame
        .ok_or_else(|| anyhow!("no frame was published; last error: {:?}", status.last_error))?;
    let latest = service
        .read_latest()
        .ok_or_else(|| anyhow!("latest frame disappeared"))?;

    let frame_path = out_dir.join("last_frame.jpg");
    fs::write(&frame_path, &latest.jpeg)?;
    let status_path = out_dir.join("status.json");
    fs::write(&status_path, serde_json::to_vec_pretty(&status)?)?;

    println!("demo complete");
    println!("  frames published: {}", status.frames_published);
    println!("  last frame: {} ({} base64 chars)", frame_path.display(), frame.len());
    println!("  status: {}", status_path.display());
    Ok(())
}
