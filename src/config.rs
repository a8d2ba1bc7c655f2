//! Persisted user settings and the per-user directory layout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::ReleaseConfig;
use crate::application::tool_provisioner::{default_specs, ProvisionerConfig};
use crate::application::{ManagerConfig, PostProcessing, RetryPolicy};
use crate::domain::{CookieMode, Quality, ToolKind};

pub const CONFIG_FILE: &str = "config.json";
pub const COOKIE_FILE: &str = "cookies.txt";
pub const TOOLS_DIR: &str = "tools";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine the user data directory")]
    NoHomeDir,

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where tools, cookies and settings live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("", "", "yt-fetch").ok_or(ConfigError::NoHomeDir)?;
        Ok(Self {
            data_dir: dirs.data_local_dir().to_path_buf(),
            config_dir: dirs.config_dir().to_path_buf(),
        })
    }

    /// Everything under one directory.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.clone(),
            config_dir: root,
        }
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.data_dir.join(TOOLS_DIR)
    }

    pub fn cookie_file(&self) -> PathBuf {
        self.data_dir.join(COOKIE_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_quality: Quality,
    pub cookie_mode: CookieMode,
    pub retry: RetryPolicy,
    pub cancel_grace_secs: u64,
    /// `0` disables stall reporting.
    pub stall_after_secs: u64,
    pub hard_timeout_secs: Option<u64>,
    pub post_processing: PostProcessing,
    pub tool_overrides: BTreeMap<ToolKind, PathBuf>,
    pub allow_system_tools: bool,
    /// Check a managed download engine for a newer release before each download.
    pub update_engine_on_download: bool,
    pub release: ReleaseConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_quality: Quality::default(),
            cookie_mode: CookieMode::None,
            retry: RetryPolicy::default(),
            cancel_grace_secs: 5,
            stall_after_secs: 60,
            hard_timeout_secs: None,
            post_processing: PostProcessing::default(),
            tool_overrides: BTreeMap::new(),
            allow_system_tools: true,
            update_engine_on_download: true,
            release: ReleaseConfig::default(),
        }
    }
}

impl AppConfig {
    /// Missing file means defaults; an unreadable or malformed one is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| write_err(e.into()))?;
        std::fs::write(path, json).map_err(write_err)?;

        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            retry: self.retry.clone(),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            stall_after: (self.stall_after_secs > 0)
                .then(|| Duration::from_secs(self.stall_after_secs)),
            hard_timeout: self.hard_timeout_secs.map(Duration::from_secs),
            post_processing: self.post_processing,
            ..ManagerConfig::default()
        }
    }

    pub fn provisioner_config(&self, paths: &AppPaths) -> ProvisionerConfig {
        ProvisionerConfig {
            specs: default_specs(&paths.tools_dir()),
            overrides: self
                .tool_overrides
                .iter()
                .map(|(kind, path)| (*kind, path.clone()))
                .collect::<HashMap<_, _>>(),
            allow_system: self.allow_system_tools,
        }
    }
}
