//! fetch_model - download a model artifact ahead of time.
//!
//! Only the specialized variants are hosted remotely; local-only variants are
//! reported as present or missing.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use oilwatch::config::ModelSettings;
use oilwatch::{ModelProvisioner, ModelVariant};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "fetch_model", about = "Download an oilwatch model artifact")]
struct Args {
    /// Variant name or legacy number (1-4).
    variant: String,

    /// Directory holding model artifacts.
    #[arg(long, env = "OILWATCH_MODEL_DIR")]
    dir: Option<PathBuf>,

    /// Remote repository prefix.
    #[arg(long, env = "OILWATCH_MODEL_BASE_URL")]
    base_url: Option<String>,

    /// Plain output even on a terminal.
    #[arg(long)]
    plain: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(args.plain);

    let variant = ModelVariant::parse(&args.variant)?;
    let mut settings = ModelSettings::default();
    if let Some(dir) = args.dir {
        settings.dir = dir;
    }
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    let provisioner = ModelProvisioner::new(&settings);
    let target = provisioner.artifact_path(variant);

    if !variant.is_remote() {
        if target.is_file() {
            println!("{} is present at {}", variant.artifact(), target.display());
            return Ok(());
        }
        return Err(anyhow!(
            "{} is not hosted remotely; place it at {}",
            variant.artifact(),
            target.display()
        ));
    }

    let path = {
        let _stage = ui.stage(&format!("Fetch {}", variant.artifact()));
        let bar = ui.download(variant.artifact());
        let result = provisioner.ensure_with_progress(variant, |progress| bar.update(progress));
        bar.finish();
        result?
    };
    println!("{} ready at {}", variant, path.display());
    Ok(())
}
