use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::domain::DownloadError;

/// Validate a user-supplied video URL.
pub fn validate_source_url(input: &str) -> Result<Url, DownloadError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::InvalidInput("URL is empty".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| DownloadError::InvalidInput(format!("'{trimmed}' is not a valid URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DownloadError::InvalidInput(format!(
                "unsupported URL scheme '{other}'"
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(DownloadError::InvalidInput(format!("'{trimmed}' has no host")));
    }

    if is_playlist_only_url(&url) {
        return Err(DownloadError::InvalidInput(
            "playlist URLs are not supported, pass a single video URL".to_string(),
        ));
    }

    Ok(url)
}

/// A playlist page without a specific video selected.
pub fn is_playlist_only_url(url: &Url) -> bool {
    let has_video =
        url.query_pairs().any(|(k, _)| k == "v") || url.host_str() == Some("youtu.be");
    !has_video && is_playlist_url(url.as_str())
}

pub fn is_playlist_url(url: &str) -> bool {
    playlist_regex().is_some_and(|re| re.is_match(url))
}

fn playlist_regex() -> Option<&'static Regex> {
    // `[?&]list=`, `playlist?` and `/playlist/` forms
    static PLAYLIST: OnceLock<Option<Regex>> = OnceLock::new();
    PLAYLIST
        .get_or_init(|| Regex::new(r"(?i)[?&]list=|playlist\?|/playlist/").ok())
        .as_ref()
}

/// Engine output template placing `<title>.<ext>` into `destination`.
pub fn output_template(destination: &Path) -> String {
    destination
        .join("%(title)s.%(ext)s")
        .to_string_lossy()
        .into_owned()
}
