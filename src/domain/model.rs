use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DownloadError;

/// Heights offered to the user, highest first.
pub const SUPPORTED_HEIGHTS: [u32; 8] = [2160, 1440, 1080, 720, 480, 360, 240, 144];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first group is enough to tell jobs apart in logs
        let full = self.0.to_string();
        f.write_str(&full[..8])
    }
}

/// Requested video quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Quality {
    Height(u32),
    Best,
}

impl Quality {
    /// Accepts `"1080"`, `"1080p"`, `"1080p (Full HD)"` or `"best"`.
    /// Heights outside [`SUPPORTED_HEIGHTS`] fall back to `Best`.
    pub fn parse(input: &str) -> Self {
        let token = input.split_whitespace().next().unwrap_or_default();
        let digits = token.trim_end_matches(['p', 'P']);

        match digits.parse::<u32>() {
            Ok(height) if SUPPORTED_HEIGHTS.contains(&height) => Self::Height(height),
            _ => Self::Best,
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::Height(1080)
    }
}

impl From<String> for Quality {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Quality> for String {
    fn from(value: Quality) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Height(h) => write!(f, "{h}p"),
            Self::Best => f.write_str("best"),
        }
    }
}

/// Which credential source the engine should use for one job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "browser", rename_all = "snake_case")]
pub enum CookieMode {
    #[default]
    None,
    /// The persisted `cookies.txt` pasted by the user.
    Manual,
    /// Live extraction from the named browser profile.
    Browser(String),
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Quality,
    pub destination: PathBuf,
    pub cookie_mode: CookieMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Final result of a job.
///
/// `reason` is the failure for `Failed`, `DownloadError::Cancelled` for
/// `Cancelled`, and the post-processing warning for a partial success.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub state: JobState,
    pub output: Option<PathBuf>,
    pub reason: Option<DownloadError>,
}

impl JobOutcome {
    pub fn succeeded(output: Option<PathBuf>) -> Self {
        Self {
            state: JobState::Succeeded,
            output,
            reason: None,
        }
    }

    pub fn succeeded_with_warning(output: Option<PathBuf>, warning: DownloadError) -> Self {
        Self {
            state: JobState::Succeeded,
            output,
            reason: Some(warning),
        }
    }

    pub fn failed(reason: DownloadError) -> Self {
        Self {
            state: JobState::Failed,
            output: None,
            reason: Some(reason),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: JobState::Cancelled,
            output: None,
            reason: Some(DownloadError::Cancelled),
        }
    }

    /// Primary artifact exists but a post-processing step failed.
    pub fn has_warning(&self) -> bool {
        self.state == JobState::Succeeded && self.reason.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Preparing,
    Downloading,
    Muxing,
    Embedding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Muxing => "muxing",
            Self::Embedding => "embedding",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub phase: Phase,
    /// 0.0 to 100.0
    pub percent: Option<f32>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub message: String,
}

/// Everything a subscriber can observe about a running job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    State(JobState),
    Progress(ProgressEvent),
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        reason: DownloadError,
    },
    /// No output from the engine for `idle`.
    Stalled { idle: Duration },
    Finished(JobOutcome),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Metadata returned by a probe run of the engine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub uploader: Option<String>,
}
