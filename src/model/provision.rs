use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ModelVariant;
use crate::config::ModelSettings;
use crate::error::{FeedError, FeedResult};

const CHUNK_BYTES: usize = 8192;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress reported while an artifact streams to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// Advertised `Content-Length`, when the server sent one.
    pub total: Option<u64>,
}

/// Resolves model variants to local artifacts.
///
/// Remotely hosted artifacts are streamed into `<artifact>.part` and renamed into
/// place only once complete, so the artifact path never holds a partial file.
pub struct ModelProvisioner {
    dir: PathBuf,
    base_url: String,
    agent: ureq::Agent,
}

impl ModelProvisioner {
    pub fn new(settings: &ModelSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            dir: settings.dir.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, variant: ModelVariant) -> PathBuf {
        self.dir.join(variant.artifact())
    }

    pub fn artifact_url(&self, variant: ModelVariant) -> String {
        format!("{}/{}", self.base_url, variant.artifact())
    }

    /// Return the local artifact path, downloading it first if required.
    pub fn ensure(&self, variant: ModelVariant) -> FeedResult<PathBuf> {
        self.ensure_with_progress(variant, |_| {})
    }

    pub fn ensure_with_progress(
        &self,
        variant: ModelVariant,
        mut on_progress: impl FnMut(DownloadProgress),
    ) -> FeedResult<PathBuf> {
        let path = self.artifact_path(variant);
        if !variant.is_remote() || artifact_present(&path) {
            return Ok(path);
        }

        let url = self.artifact_url(variant);
        log::info!("downloading model {} from {}", variant.artifact(), url);
        let part = part_path(&path);
        let result = self
            .download(&url, &part, &mut on_progress)
            .and_then(|bytes| {
                std::fs::rename(&part, &path)
                    .with_context(|| format!("move {} into place", part.display()))?;
                Ok(bytes)
            });

        match result {
            Ok(bytes) => {
                log::info!("model {} downloaded ({} bytes)", variant.artifact(), bytes);
                Ok(path)
            }
            Err(err) => {
                remove_if_exists(&part);
                if path.exists() && !artifact_present(&path) {
                    remove_if_exists(&path);
                }
                log::error!("model download failed for {}: {:#}", variant.artifact(), err);
                Err(FeedError::Provisioning {
                    artifact: variant.artifact().to_string(),
                    reason: format!("{:#}", err),
                })
            }
        }
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<u64> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create model directory {}", self.dir.display()))?;

        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => anyhow!("model repository returned HTTP {}", code),
                ureq::Error::Transport(transport) => {
                    anyhow!("model repository unreachable: {}", transport)
                }
            })?;
        let total = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());

        let mut reader = response.into_reader();
        let mut file =
            File::create(dest).with_context(|| format!("create {}", dest.display()))?;
        let mut chunk = vec![0u8; CHUNK_BYTES];
        let mut downloaded = 0u64;
        loop {
            let read = reader.read(&mut chunk).context("read model body")?;
            if read == 0 {
                break;
            }
            file.write_all(&chunk[..read])
                .with_context(|| format!("write {}", dest.display()))?;
            downloaded += read as u64;
            on_progress(DownloadProgress { downloaded, total });
        }
        file.sync_all().context("flush model artifact")?;

        if downloaded == 0 {
            return Err(anyhow!("model repository returned an empty artifact"));
        }
        if let Some(total) = total {
            if downloaded != total {
                return Err(anyhow!(
                    "transfer ended after {} of {} bytes",
                    downloaded,
                    total
                ));
            }
        }
        Ok(downloaded)
    }
}

fn artifact_present(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed partial artifact {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
    }
}
