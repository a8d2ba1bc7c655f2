pub mod error;
pub mod model;
pub mod tool;

pub use error::DownloadError;
pub use model::{
    CookieMode, DownloadRequest, JobEvent, JobId, JobOutcome, JobState, Phase, ProgressEvent,
    Quality, VideoInfo, SUPPORTED_HEIGHTS,
};
pub use tool::{Checksum, ToolKind, ToolSource, ToolSpec, ToolStatus};
