use thiserror::Error;

/// Caller-visible failure kinds.
///
/// Payloads are plain strings so the error can be cloned into job snapshots
/// and fanned out to every progress subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to provision {tool}: {message}")]
    Provision { tool: String, message: String },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication required: {0}")]
    Authentication(String),

    #[error("Requested format is unavailable: {0}")]
    FormatUnavailable(String),

    #[error("Download engine failed (exit code {code:?}): {message}")]
    Engine { code: Option<i32>, message: String },

    #[error("Post-processing step '{step}' failed: {message}")]
    PostProcess { step: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Default retry predicate: transient transport failures and engine
    /// failures that could not be classified are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Engine { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Provision { .. } => "provision",
            Self::Credential(_) => "credential",
            Self::Network(_) => "network",
            Self::Authentication(_) => "authentication",
            Self::FormatUnavailable(_) => "format_unavailable",
            Self::Engine { .. } => "engine",
            Self::PostProcess { .. } => "post_process",
            Self::Io(_) => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(DownloadError::Network("reset".into()).is_retryable());
        assert!(DownloadError::Engine {
            code: Some(1),
            message: "boom".into()
        }
        .is_retryable());

        assert!(!DownloadError::InvalidInput("bad url".into()).is_retryable());
        assert!(!DownloadError::FormatUnavailable("none".into()).is_retryable());
        assert!(!DownloadError::Authentication("login".into()).is_retryable());
        assert!(!DownloadError::Cancelled.is_retryable());
    }

    #[test]
    fn test_display_carries_message() {
        let err = DownloadError::PostProcess {
            step: "mux".into(),
            message: "ffmpeg exited with 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Post-processing step 'mux' failed: ffmpeg exited with 1"
        );
        assert_eq!(err.kind(), "post_process");
    }
}
