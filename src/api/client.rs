use futures::Stream;
use futures::TryStreamExt;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use super::models::{ChecksumManifest, ReleaseConfig};

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Release source returned an error: {0}")]
    SourceError(String),

    #[error("Checksum for '{0}' not found in manifest")]
    ChecksumNotListed(String),
}

pub type Result<T> = std::result::Result<T, ReleaseError>;

/// HTTPS client for fetching tool releases and their checksum lists.
#[derive(Clone)]
pub struct ReleaseClient {
    http: Client,
}

impl ReleaseClient {
    pub fn new(config: ReleaseConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { http })
    }

    /// Fetch a small text resource such as a checksum manifest.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        debug!(url, "fetching text resource");
        let response = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ReleaseError::SourceError(format!("Request for {url} failed: {e}")))?;

        Ok(response.text().await?)
    }

    /// Fetch a manifest and look up the digest for `asset`.
    pub async fn fetch_checksum(&self, manifest_url: &str, asset: &str) -> Result<String> {
        let text = self.fetch_text(manifest_url).await?;
        ChecksumManifest::parse(&text)
            .digest_for(asset)
            .map(str::to_string)
            .ok_or_else(|| ReleaseError::ChecksumNotListed(asset.to_string()))
    }

    /// Download a file with a chunk stream.
    /// Returns (total_size, stream)
    pub async fn download_file_stream(
        &self,
        download_url: &str,
    ) -> Result<(Option<u64>, impl Stream<Item = Result<bytes::Bytes>>)> {
        debug!(url = download_url, "starting artifact download");
        let response = self
            .http
            .get(download_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ReleaseError::SourceError(format!("Download request failed: {e}")))?;

        let total_size = response.content_length();
        let stream = response.bytes_stream().map_err(ReleaseError::RequestError);

        Ok((total_size, stream))
    }
}
