//! Muxing and metadata embedding after the engine has fetched the media.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{DownloadError, Phase};
use crate::process::{self, RunEvent, RunOptions, RunResult};

pub const MUX_STEP: &str = "mux";
pub const EMBED_STEP: &str = "embed";

/// Thumbnail extensions the embedder accepts, in lookup order.
const ARTWORK_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessing {
    pub mux: bool,
    pub embed_metadata: bool,
}

impl PostProcessing {
    pub fn is_enabled(&self) -> bool {
        self.mux || self.embed_metadata
    }
}

impl Default for PostProcessing {
    fn default() -> Self {
        Self {
            mux: true,
            embed_metadata: true,
        }
    }
}

/// Result of the post-processing chain. The media file exists in every case;
/// `warning` carries the step that failed, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub output: PathBuf,
    pub warning: Option<DownloadError>,
}

/// Runs the muxer, then the metadata embedder, over a downloaded file.
#[derive(Debug, Clone, Default)]
pub struct PostProcessor {
    muxer: Option<PathBuf>,
    embedder: Option<PathBuf>,
    grace: Duration,
}

impl PostProcessor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            ..Default::default()
        }
    }

    pub fn with_muxer(mut self, path: PathBuf) -> Self {
        self.muxer = Some(path);
        self
    }

    pub fn with_embedder(mut self, path: PathBuf) -> Self {
        self.embedder = Some(path);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.muxer.is_none() && self.embedder.is_none()
    }

    /// Process `media`. A failed mux skips embedding. Only cancellation is
    /// returned as an error; step failures become the outcome's warning.
    pub async fn run<F>(
        &self,
        media: &Path,
        cancel: &CancellationToken,
        mut on_phase: F,
    ) -> Result<Processed, DownloadError>
    where
        F: FnMut(Phase, &str),
    {
        let mut output = media.to_path_buf();

        if let Some(muxer) = &self.muxer {
            on_phase(Phase::Muxing, "Remuxing into mp4");
            match self.mux(muxer, &output, cancel).await {
                Ok(path) => output = path,
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(warning) => {
                    warn!(media = %output.display(), "{}", warning);
                    return Ok(Processed {
                        output,
                        warning: Some(warning),
                    });
                }
            }
        }

        if let Some(embedder) = &self.embedder {
            on_phase(Phase::Embedding, "Embedding metadata");
            match self.embed(embedder, &output, cancel).await {
                Ok(()) => {}
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(warning) => {
                    warn!(media = %output.display(), "{}", warning);
                    return Ok(Processed {
                        output,
                        warning: Some(warning),
                    });
                }
            }
        }

        info!(output = %output.display(), "post-processing finished");
        Ok(Processed {
            output,
            warning: None,
        })
    }

    async fn mux(
        &self,
        muxer: &Path,
        media: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let target = media.with_extension("mp4");
        let staging = sibling_with_suffix(media, ".remux.mp4");

        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            media.to_string_lossy().into_owned(),
            "-map".to_string(),
            "0:v?".to_string(),
            "-map".to_string(),
            "0:a?".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            staging.to_string_lossy().into_owned(),
        ];

        if let Err(e) = self.run_step(MUX_STEP, muxer, &args, cancel).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        if !staging.is_file() {
            return Err(step_error(MUX_STEP, "muxer produced no output file"));
        }

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| step_error(MUX_STEP, format!("failed to move remuxed file: {e}")))?;
        if target != media {
            let _ = tokio::fs::remove_file(media).await;
        }

        debug!(output = %target.display(), "remux complete");
        Ok(target)
    }

    async fn embed(
        &self,
        embedder: &Path,
        media: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let title = media
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let artwork = find_artwork(media);

        let mut args = vec![
            media.to_string_lossy().into_owned(),
            "--title".to_string(),
            title,
        ];
        if let Some(artwork) = &artwork {
            args.push("--artwork".to_string());
            args.push(artwork.to_string_lossy().into_owned());
        }
        args.push("--overWrite".to_string());

        self.run_step(EMBED_STEP, embedder, &args, cancel).await?;

        if let Some(artwork) = artwork {
            let _ = tokio::fs::remove_file(artwork).await;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &'static str,
        program: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let options = RunOptions {
            grace: self.grace,
            ..Default::default()
        };

        debug!(step, program = %program.display(), "running post-processing step");
        let result = process::run_streaming(program, args, &options, cancel, |event| {
            if let RunEvent::Line(line) = event {
                debug!(step, "{}", line.text());
            }
        })
        .await
        .map_err(|e| step_error(step, format!("failed to start {}: {e}", program.display())))?;

        match result {
            RunResult::Exited { status, .. } if status.success() => Ok(()),
            RunResult::Exited { status, tail } => {
                let detail = tail
                    .iter()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .map(|l| format!(": {}", l.trim()))
                    .unwrap_or_default();
                Err(step_error(step, format!("exited with {status}{detail}")))
            }
            RunResult::Cancelled => Err(DownloadError::Cancelled),
            RunResult::TimedOut { idle } => {
                Err(step_error(step, format!("no output for {}s", idle.as_secs())))
            }
        }
    }
}

fn step_error(step: &str, message: impl Into<String>) -> DownloadError {
    DownloadError::PostProcess {
        step: step.to_string(),
        message: message.into(),
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Thumbnail written by the engine next to the media file.
fn find_artwork(media: &Path) -> Option<PathBuf> {
    ARTWORK_EXTENSIONS
        .iter()
        .map(|ext| media.with_extension(ext))
        .find(|p| p.is_file())
}
