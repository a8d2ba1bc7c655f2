pub mod client;
pub mod models;

pub use client::{ReleaseClient, ReleaseError, Result};
pub use models::{ChecksumManifest, ReleaseConfig};
