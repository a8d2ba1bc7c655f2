pub mod classify;
pub mod cookie_store;
pub mod download_manager;
pub mod format;
pub mod post_process;
pub mod progress;
pub mod retry_handler;
pub mod tool_provisioner;

pub use classify::classify_failure;
pub use cookie_store::{CookieStore, CredentialError, SUPPORTED_BROWSERS};
pub use download_manager::{
    engine_args, DownloadManager, EngineInvocation, JobHandle, ManagerConfig,
};
pub use format::{format_expression, FALLBACK_FORMAT};
pub use post_process::{PostProcessing, PostProcessor, Processed};
pub use progress::{ProgressTracker, ProgressUpdate, PROGRESS_TEMPLATE};
pub use retry_handler::{Backoff, RetryHandler, RetryNotice, RetryPolicy};
pub use tool_provisioner::{ProvisionError, ProvisionerConfig, ToolProvisioner, ToolUpdate};
