use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{CookieMode, DownloadError};

/// Browsers the engine can extract cookies from.
pub const SUPPORTED_BROWSERS: &[&str] = &[
    "brave", "chrome", "chromium", "edge", "firefox", "opera", "safari", "vivaldi", "whale",
];

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to write cookie file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Browser '{0}' is not supported for cookie extraction")]
    UnsupportedBrowser(String),

    #[error("No manual cookie file at {}", .0.display())]
    MissingManualFile(PathBuf),
}

impl From<CredentialError> for DownloadError {
    fn from(err: CredentialError) -> Self {
        DownloadError::Credential(err.to_string())
    }
}

/// Persisted manual cookies plus the browser-extraction alternative.
#[derive(Debug, Clone)]
pub struct CookieStore {
    cookie_file: PathBuf,
}

impl CookieStore {
    pub fn new(cookie_file: impl Into<PathBuf>) -> Self {
        Self {
            cookie_file: cookie_file.into(),
        }
    }

    pub fn manual_path(&self) -> &Path {
        &self.cookie_file
    }

    /// Persist pasted cookie text, replacing previous content. The file is
    /// owner read/write only.
    pub fn write_manual(&self, content: &str) -> Result<PathBuf, CredentialError> {
        let path = self.cookie_file.clone();
        let wrap = |source| CredentialError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(wrap)?;
        }

        let mut file = open_private(&path).map_err(wrap)?;
        file.write_all(content.as_bytes()).map_err(wrap)?;
        file.sync_all().map_err(wrap)?;

        info!(path = %path.display(), bytes = content.len(), "saved manual cookies");
        Ok(path)
    }

    pub fn read_manual(&self) -> Option<String> {
        std::fs::read_to_string(&self.cookie_file).ok()
    }

    /// A manual cookie file exists and is not empty.
    pub fn has_manual(&self) -> bool {
        std::fs::metadata(&self.cookie_file)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Engine arguments for live extraction from `browser`. Nothing is
    /// written to disk.
    pub fn browser_args(&self, browser: &str) -> Result<Vec<String>, CredentialError> {
        // `firefox:profile-name` selects a profile
        let (name, profile) = match browser.trim().split_once(':') {
            Some((name, profile)) => (name.to_ascii_lowercase(), Some(profile)),
            None => (browser.trim().to_ascii_lowercase(), None),
        };
        if !SUPPORTED_BROWSERS.contains(&name.as_str()) {
            return Err(CredentialError::UnsupportedBrowser(browser.to_string()));
        }

        let value = match profile {
            Some(profile) => format!("{name}:{profile}"),
            None => name,
        };
        Ok(vec!["--cookies-from-browser".to_string(), value])
    }

    pub fn manual_args(&self) -> Result<Vec<String>, CredentialError> {
        if !self.has_manual() {
            return Err(CredentialError::MissingManualFile(self.cookie_file.clone()));
        }

        Ok(vec![
            "--cookies".to_string(),
            self.cookie_file.to_string_lossy().into_owned(),
        ])
    }

    /// Cookie argument fragment for one job. Modes are mutually exclusive.
    pub fn args_for(&self, mode: &CookieMode) -> Result<Vec<String>, CredentialError> {
        let args = match mode {
            CookieMode::None => Vec::new(),
            CookieMode::Manual => self.manual_args()?,
            CookieMode::Browser(browser) => self.browser_args(browser)?,
        };
        debug!(?mode, "resolved cookie arguments");
        Ok(args)
    }
}

/// Open `path` for writing with owner-only access, tightened before any
/// content is written.
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // an existing file keeps its old mode on open
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

// Per-user AppData already limits access on Windows.
#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
