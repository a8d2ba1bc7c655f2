use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use thiserror::Error;
use tracing::{info, warn};

use yt_fetch_core::api::{ReleaseClient, ReleaseError};
use yt_fetch_core::application::{CookieStore, DownloadManager, ToolProvisioner, ToolUpdate};
use yt_fetch_core::config::{AppConfig, AppPaths, ConfigError};
use yt_fetch_core::domain::{
    CookieMode, DownloadError, DownloadRequest, JobState, Quality, ToolKind, ToolStatus,
};

use crate::ui::{self, DownloadView};

/// Exit status after Ctrl-C, as shells report it.
const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "yt-fetch", version, about = "Download YouTube videos as mp4")]
pub struct Cli {
    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file to use instead of the per-user one
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a single video
    Download {
        url: String,
        /// 2160, 1440, 1080, 720, 480, 360, 240, 144 or "best"
        #[arg(short, long)]
        quality: Option<String>,
        /// Destination directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        #[command(flatten)]
        cookies: CookieArgs,
        /// Skip remuxing and metadata embedding
        #[arg(long)]
        no_post_processing: bool,
    },
    /// Show video metadata without downloading
    Probe {
        url: String,
        #[command(flatten)]
        cookies: CookieArgs,
    },
    /// Manage the manual cookie file
    Cookies {
        #[command(subcommand)]
        action: CookieAction,
    },
    /// Inspect or install the external tools
    Tools {
        #[command(subcommand)]
        action: ToolAction,
    },
}

#[derive(Debug, Args)]
pub struct CookieArgs {
    /// Use the saved manual cookie file
    #[arg(long, conflicts_with = "browser")]
    pub manual_cookies: bool,
    /// Read cookies live from a browser, e.g. `firefox` or `chrome:Profile 1`
    #[arg(long, value_name = "BROWSER")]
    pub browser: Option<String>,
}

impl CookieArgs {
    fn mode(&self, fallback: &CookieMode) -> CookieMode {
        match (&self.browser, self.manual_cookies) {
            (Some(browser), _) => CookieMode::Browser(browser.clone()),
            (None, true) => CookieMode::Manual,
            (None, false) => fallback.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CookieAction {
    /// Save cookies from a Netscape cookie file, or stdin when omitted
    Set { file: Option<PathBuf> },
    /// Show where the manual cookie file lives and whether it is set
    Show,
}

#[derive(Debug, Subcommand)]
pub enum ToolAction {
    /// Report the state of each tool
    Status,
    /// Download any missing or stale tools
    Install,
    /// Refetch managed tools whose upstream release changed
    Update,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Failed to set up HTTP client: {0}")]
    Release(#[from] ReleaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DownloadApp {
    config: AppConfig,
    manager: DownloadManager,
}

impl DownloadApp {
    pub fn new(paths: &AppPaths, config: AppConfig) -> Result<Self, AppError> {
        let client = ReleaseClient::new(config.release.clone())?;
        let provisioner = ToolProvisioner::new(config.provisioner_config(paths), client);
        let cookies = CookieStore::new(paths.cookie_file());
        let manager = DownloadManager::new(Arc::new(provisioner), cookies, config.manager_config());

        Ok(Self { config, manager })
    }
}

pub async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    let paths = AppPaths::discover()?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let mut config = AppConfig::load_or_default(&config_path)?;

    if let Command::Download {
        no_post_processing: true,
        ..
    } = &cli.command
    {
        config.post_processing.mux = false;
        config.post_processing.embed_metadata = false;
    }

    let app = DownloadApp::new(&paths, config)?;

    match cli.command {
        Command::Download {
            url,
            quality,
            output,
            cookies,
            ..
        } => {
            let quality = quality
                .as_deref()
                .map(Quality::parse)
                .unwrap_or(app.config.default_quality);
            let request = DownloadRequest {
                url,
                quality,
                destination: output,
                cookie_mode: cookies.mode(&app.config.cookie_mode),
            };
            download(&app, request).await
        }
        Command::Probe { url, cookies } => {
            let mode = cookies.mode(&app.config.cookie_mode);
            let info = app.manager.probe(&url, &mode).await?;
            println!("{}", ui::video_info(&info));
            Ok(ExitCode::SUCCESS)
        }
        Command::Cookies { action } => cookies(&app, action),
        Command::Tools { action } => tools(&app, action).await,
    }
}

async fn download(app: &DownloadApp, request: DownloadRequest) -> Result<ExitCode, AppError> {
    if app.config.update_engine_on_download {
        refresh_engine(app.manager.provisioner()).await;
    }

    let handle = app.manager.start(request).await?;
    let mut events = handle.progress();
    let mut view = DownloadView::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    if let Some(line) = view.update(&event) {
                        println!("{line}");
                    }
                }
                None => break,
            },
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                println!("Cancelling...");
                handle.cancel();
            }
        }
    }

    let outcome = handle.wait().await;
    info!(job = %handle.id(), state = ?outcome.state, "download finished");

    Ok(match outcome.state {
        JobState::Succeeded => ExitCode::SUCCESS,
        JobState::Cancelled => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::FAILURE,
    })
}

/// Keep a managed engine current; system and configured engines are left alone.
async fn refresh_engine(provisioner: &ToolProvisioner) {
    let managed = matches!(
        provisioner.status(ToolKind::Engine).await,
        ToolStatus::Ready { .. } | ToolStatus::Stale { .. }
    );
    if !managed {
        return;
    }

    match provisioner.update(ToolKind::Engine).await {
        Ok(ToolUpdate::Updated(path)) => info!(path = %path.display(), "download engine updated"),
        Ok(_) => {}
        Err(e) => warn!("could not check for engine updates: {e}"),
    }
}

fn cookies(app: &DownloadApp, action: CookieAction) -> Result<ExitCode, AppError> {
    let store = app.manager.cookies();

    match action {
        CookieAction::Set { file } => {
            let content = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            if content.trim().is_empty() {
                warn!("cookie input is empty");
            }
            let path = store.write_manual(&content).map_err(DownloadError::from)?;
            println!("Saved cookies to {}", path.display());
        }
        CookieAction::Show => {
            let state = if store.has_manual() { "set" } else { "not set" };
            println!("{} ({state})", store.manual_path().display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn tools(app: &DownloadApp, action: ToolAction) -> Result<ExitCode, AppError> {
    let provisioner = app.manager.provisioner();

    match action {
        ToolAction::Status => {
            for (kind, status) in provisioner.statuses().await {
                println!("{}", ui::tool_status(kind, &status));
            }
            Ok(ExitCode::SUCCESS)
        }
        ToolAction::Install => {
            let mut failed = false;
            for kind in ToolKind::ALL {
                match provisioner.ensure(kind).await {
                    Ok(path) => println!("{:<14} {}", kind.name(), path.display()),
                    Err(e) => {
                        failed = true;
                        println!("{:<14} {e}", kind.name());
                    }
                }
            }
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        ToolAction::Update => {
            let mut failed = false;
            for kind in ToolKind::ALL {
                match provisioner.update(kind).await {
                    Ok(update) => println!("{}", ui::tool_update(kind, &update)),
                    Err(e) => {
                        failed = true;
                        println!("{:<14} {e}", kind.name());
                    }
                }
            }
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_arguments() {
        let cli = Cli::parse_from([
            "yt-fetch",
            "download",
            "https://youtu.be/dQw4w9WgXcQ",
            "-q",
            "720p",
            "--browser",
            "firefox",
        ]);
        match cli.command {
            Command::Download {
                quality, cookies, ..
            } => {
                assert_eq!(quality.as_deref(), Some("720p"));
                assert_eq!(
                    cookies.mode(&CookieMode::None),
                    CookieMode::Browser("firefox".into())
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_tools_update_subcommand() {
        let cli = Cli::parse_from(["yt-fetch", "tools", "update"]);
        assert!(matches!(
            cli.command,
            Command::Tools {
                action: ToolAction::Update
            }
        ));
    }

    #[test]
    fn test_cookie_flags_conflict() {
        let result = Cli::try_parse_from([
            "yt-fetch",
            "probe",
            "https://youtu.be/x",
            "--manual-cookies",
            "--browser",
            "edge",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cookie_mode_falls_back_to_config() {
        let args = CookieArgs {
            manual_cookies: false,
            browser: None,
        };
        assert_eq!(args.mode(&CookieMode::Manual), CookieMode::Manual);
    }
}
