use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The external executables a job may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// yt-dlp
    Engine,
    /// ffmpeg
    Muxer,
    /// AtomicParsley
    MetadataEmbedder,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [Self::Engine, Self::Muxer, Self::MetadataEmbedder];

    pub fn name(self) -> &'static str {
        match self {
            Self::Engine => "yt-dlp",
            Self::Muxer => "ffmpeg",
            Self::MetadataEmbedder => "AtomicParsley",
        }
    }

    /// File name of the executable on this platform.
    pub fn file_name(self) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.exe", self.name())
        } else {
            self.name().to_string()
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a downloaded artifact is checked before first use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    /// Hex SHA-256 of the downloaded artifact.
    Sha256(String),
    /// A `SHA2-256SUMS` style manifest listing `<hex>  <asset>` lines.
    Manifest { url: String, asset: String },
    /// Only require a non-empty artifact, plus the per-entry CRC when it is a
    /// zip. Reserved for releases that publish no digest (AtomicParsley);
    /// such tools are refetched on every update.
    None,
}

/// Where a tool comes from when it is not installed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSource {
    pub url: String,
    pub checksum: Checksum,
    /// Path suffix of the executable inside a zip artifact. `None` means the
    /// artifact is the executable itself.
    #[serde(default)]
    pub archive_member: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub kind: ToolKind,
    /// Expected version label. A recorded install with a different label is stale.
    pub version: String,
    pub source: Option<ToolSource>,
    pub install_path: PathBuf,
}

/// Result of a tool-status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    /// Managed install present and verified.
    Ready { path: PathBuf, version: String },
    /// User supplied path from configuration.
    Overridden { path: PathBuf },
    /// Found on the system `PATH`.
    System { path: PathBuf },
    /// Managed install present but its stamp does not match.
    Stale { path: PathBuf, reason: String },
    Missing,
}

impl ToolStatus {
    pub fn usable_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready { path, .. } | Self::Overridden { path } | Self::System { path } => {
                Some(path)
            }
            Self::Stale { .. } | Self::Missing => None,
        }
    }
}
