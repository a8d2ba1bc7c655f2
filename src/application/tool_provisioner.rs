//! Acquisition and verification of the external executables.
//!
//! Each tool resolves independently, in this order: configured override,
//! verified managed install under `tools/`, the system `PATH` (when allowed),
//! then a fresh download from the tool's release source. Managed installs
//! carry a `<name>.stamp.json` with the version label and SHA-256 of the
//! installed executable; a file without a matching stamp is stale.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{ReleaseClient, ReleaseError};
use crate::domain::{Checksum, DownloadError, ToolKind, ToolSource, ToolSpec, ToolStatus};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("{0} is not configured")]
    NotConfigured(ToolKind),

    #[error("no download source for {0} on this platform; install it and make sure it is on PATH")]
    NoSource(ToolKind),

    #[error("configured path for {tool} is not a file: {}", path.display())]
    BadOverride { tool: ToolKind, path: PathBuf },

    #[error("failed to fetch {tool}: {source}")]
    Fetch {
        tool: ToolKind,
        #[source]
        source: ReleaseError,
    },

    #[error("downloaded artifact for {0} is empty")]
    EmptyArtifact(ToolKind),

    #[error("checksum mismatch for {tool}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        tool: ToolKind,
        expected: String,
        actual: String,
    },

    #[error("failed to extract {tool}: {message}")]
    Extract { tool: ToolKind, message: String },

    #[error("I/O error while provisioning {tool}: {source}")]
    Io {
        tool: ToolKind,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    pub fn tool(&self) -> ToolKind {
        match self {
            Self::NotConfigured(tool) | Self::NoSource(tool) | Self::EmptyArtifact(tool) => *tool,
            Self::BadOverride { tool, .. }
            | Self::Fetch { tool, .. }
            | Self::ChecksumMismatch { tool, .. }
            | Self::Extract { tool, .. }
            | Self::Io { tool, .. } => *tool,
        }
    }
}

impl From<ProvisionError> for DownloadError {
    fn from(err: ProvisionError) -> Self {
        DownloadError::Provision {
            tool: err.tool().to_string(),
            message: err.to_string(),
        }
    }
}

/// Record written next to a managed install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InstallStamp {
    version: String,
    sha256: String,
    /// Digest of the downloaded artifact; differs from `sha256` for archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_sha256: Option<String>,
}

impl InstallStamp {
    fn source_digest(&self) -> &str {
        self.source_sha256.as_deref().unwrap_or(&self.sha256)
    }
}

/// What [`ToolProvisioner::update`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolUpdate {
    /// The managed install already matches the release source.
    Current(PathBuf),
    /// A newer artifact was fetched and installed.
    Updated(PathBuf),
    /// The tool comes from a configured path and is left alone.
    Unmanaged(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub specs: Vec<ToolSpec>,
    pub overrides: HashMap<ToolKind, PathBuf>,
    pub allow_system: bool,
}

impl ProvisionerConfig {
    /// Release sources for the current platform, installing under `tools_dir`.
    pub fn for_platform(tools_dir: &Path) -> Self {
        Self {
            specs: default_specs(tools_dir),
            overrides: HashMap::new(),
            allow_system: true,
        }
    }
}

pub struct ToolProvisioner {
    client: ReleaseClient,
    specs: BTreeMap<ToolKind, ToolSpec>,
    overrides: HashMap<ToolKind, PathBuf>,
    allow_system: bool,
    // one lock per tool so two jobs never fetch the same tool twice
    locks: HashMap<ToolKind, Mutex<()>>,
}

impl ToolProvisioner {
    pub fn new(config: ProvisionerConfig, client: ReleaseClient) -> Self {
        let specs: BTreeMap<_, _> = config.specs.into_iter().map(|s| (s.kind, s)).collect();
        let locks = specs.keys().map(|k| (*k, Mutex::new(()))).collect();

        Self {
            client,
            specs,
            overrides: config.overrides,
            allow_system: config.allow_system,
            locks,
        }
    }

    pub fn spec(&self, kind: ToolKind) -> Option<&ToolSpec> {
        self.specs.get(&kind)
    }

    /// Return a usable path for `kind`, downloading and verifying it if needed.
    pub async fn ensure(&self, kind: ToolKind) -> Result<PathBuf, ProvisionError> {
        if let Some(path) = self.override_path(kind)? {
            return Ok(path);
        }

        let spec = self
            .specs
            .get(&kind)
            .ok_or(ProvisionError::NotConfigured(kind))?;
        let _guard = match self.locks.get(&kind) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        match inspect_managed(spec).await {
            ToolStatus::Ready { path, version } => {
                debug!(tool = %kind, %version, "managed install verified");
                return Ok(path);
            }
            ToolStatus::Stale { reason, .. } => {
                info!(tool = %kind, %reason, "managed install is stale");
            }
            _ => {}
        }

        if self.allow_system {
            if let Some(path) = find_on_path(&kind.file_name()) {
                debug!(tool = %kind, path = %path.display(), "using tool from PATH");
                return Ok(path);
            }
        }

        let source = spec.source.as_ref().ok_or(ProvisionError::NoSource(kind))?;
        let expected = self.expected_digest(kind, source).await?;
        self.install(spec, source, expected).await
    }

    /// Bring the managed install of `kind` in line with its release source.
    ///
    /// Sources with a pinned or published digest are compared against the
    /// install record and only refetched when upstream changed; sources
    /// without one are always refetched.
    pub async fn update(&self, kind: ToolKind) -> Result<ToolUpdate, ProvisionError> {
        if let Some(path) = self.override_path(kind)? {
            return Ok(ToolUpdate::Unmanaged(path));
        }

        let spec = self
            .specs
            .get(&kind)
            .ok_or(ProvisionError::NotConfigured(kind))?;
        let source = spec.source.as_ref().ok_or(ProvisionError::NoSource(kind))?;
        let _guard = match self.locks.get(&kind) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let expected = self.expected_digest(kind, source).await?;
        if let (Some(expected), ToolStatus::Ready { path, .. }) =
            (expected.as_deref(), inspect_managed(spec).await)
        {
            let recorded = read_stamp(&path).await;
            if recorded.is_some_and(|stamp| stamp.source_digest().eq_ignore_ascii_case(expected)) {
                debug!(tool = %kind, "managed install is current");
                return Ok(ToolUpdate::Current(path));
            }
            info!(tool = %kind, "newer release available");
        }

        let path = self.install(spec, source, expected).await?;
        Ok(ToolUpdate::Updated(path))
    }

    /// Current status of one tool. Never touches the network.
    pub async fn status(&self, kind: ToolKind) -> ToolStatus {
        if let Some(path) = self.overrides.get(&kind) {
            return ToolStatus::Overridden { path: path.clone() };
        }

        let managed = match self.specs.get(&kind) {
            Some(spec) => inspect_managed(spec).await,
            None => ToolStatus::Missing,
        };
        if matches!(managed, ToolStatus::Ready { .. }) {
            return managed;
        }

        if self.allow_system {
            if let Some(path) = find_on_path(&kind.file_name()) {
                return ToolStatus::System { path };
            }
        }

        managed
    }

    pub async fn statuses(&self) -> Vec<(ToolKind, ToolStatus)> {
        let mut out = Vec::with_capacity(ToolKind::ALL.len());
        for kind in ToolKind::ALL {
            out.push((kind, self.status(kind).await));
        }
        out
    }

    fn override_path(&self, kind: ToolKind) -> Result<Option<PathBuf>, ProvisionError> {
        match self.overrides.get(&kind) {
            Some(path) if path.is_file() => Ok(Some(path.clone())),
            Some(path) => Err(ProvisionError::BadOverride {
                tool: kind,
                path: path.clone(),
            }),
            None => Ok(None),
        }
    }

    /// Digest the artifact must have, fetching the manifest if there is one.
    async fn expected_digest(
        &self,
        kind: ToolKind,
        source: &ToolSource,
    ) -> Result<Option<String>, ProvisionError> {
        Ok(match &source.checksum {
            Checksum::Sha256(hex) => Some(hex.to_ascii_lowercase()),
            Checksum::Manifest { url, asset } => Some(
                self.client
                    .fetch_checksum(url, asset)
                    .await
                    .map_err(|source| ProvisionError::Fetch { tool: kind, source })?,
            ),
            Checksum::None => None,
        })
    }

    async fn install(
        &self,
        spec: &ToolSpec,
        source: &ToolSource,
        expected: Option<String>,
    ) -> Result<PathBuf, ProvisionError> {
        let kind = spec.kind;
        let io_err = |source| ProvisionError::Io { tool: kind, source };

        info!(tool = %kind, url = %source.url, version = %spec.version, "fetching tool");

        if let Some(parent) = spec.install_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let artifact = spec.install_path.with_extension("download");
        let (bytes, digest) = self
            .download_to(&source.url, &artifact, kind)
            .await
            .inspect_err(|_| {
                let _ = std::fs::remove_file(&artifact);
            })?;

        if let Err(e) = verify_artifact(kind, bytes, &digest, expected.as_deref()) {
            let _ = tokio::fs::remove_file(&artifact).await;
            return Err(e);
        }
        debug!(tool = %kind, bytes, sha256 = %digest, "artifact verified");

        let staged = match &source.archive_member {
            Some(member) => {
                let staged = spec.install_path.with_extension("tmp");
                let result = extract_member(kind, &artifact, member, &staged).await;
                let _ = tokio::fs::remove_file(&artifact).await;
                result?;
                staged
            }
            None => artifact,
        };

        make_executable(&staged).map_err(io_err)?;
        tokio::fs::rename(&staged, &spec.install_path)
            .await
            .map_err(io_err)?;

        let installed_digest = sha256_file(&spec.install_path).await.map_err(io_err)?;
        let stamp = InstallStamp {
            version: spec.version.clone(),
            sha256: installed_digest,
            source_sha256: Some(digest),
        };
        write_stamp(&spec.install_path, &stamp).await.map_err(io_err)?;

        info!(tool = %kind, path = %spec.install_path.display(), "tool installed");
        Ok(spec.install_path.clone())
    }

    async fn download_to(
        &self,
        url: &str,
        target: &Path,
        kind: ToolKind,
    ) -> Result<(u64, String), ProvisionError> {
        let io_err = |source| ProvisionError::Io { tool: kind, source };

        let (total, stream) = self
            .client
            .download_file_stream(url)
            .await
            .map_err(|source| ProvisionError::Fetch { tool: kind, source })?;
        let mut stream = std::pin::pin!(stream);

        let mut file = tokio::fs::File::create(target).await.map_err(io_err)?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ProvisionError::Fetch { tool: kind, source })?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(io_err)?;

        if let Some(total) = total.filter(|t| *t != written) {
            warn!(tool = %kind, total, written, "artifact size differs from Content-Length");
        }

        Ok((written, hex::encode(hasher.finalize())))
    }
}

fn verify_artifact(
    kind: ToolKind,
    bytes: u64,
    actual: &str,
    expected: Option<&str>,
) -> Result<(), ProvisionError> {
    if bytes == 0 {
        return Err(ProvisionError::EmptyArtifact(kind));
    }

    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => {
            Err(ProvisionError::ChecksumMismatch {
                tool: kind,
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Check a managed install against its stamp and the configured version label.
async fn inspect_managed(spec: &ToolSpec) -> ToolStatus {
    let path = spec.install_path.clone();
    if !path.is_file() {
        return ToolStatus::Missing;
    }

    let stale = |reason: &str| ToolStatus::Stale {
        path: path.clone(),
        reason: reason.to_string(),
    };

    let Some(stamp) = read_stamp(&path).await else {
        return stale("no install record");
    };
    if stamp.version != spec.version {
        return stale(&format!(
            "installed version {} does not match {}",
            stamp.version, spec.version
        ));
    }

    match sha256_file(&path).await {
        Ok(digest) if digest == stamp.sha256 => ToolStatus::Ready {
            path: path.clone(),
            version: stamp.version,
        },
        Ok(_) => stale("checksum does not match install record"),
        Err(e) => stale(&format!("unreadable: {e}")),
    }
}

fn stamp_path(install_path: &Path) -> PathBuf {
    let mut name = install_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".stamp.json");
    install_path.with_file_name(name)
}

async fn read_stamp(install_path: &Path) -> Option<InstallStamp> {
    let text = tokio::fs::read_to_string(stamp_path(install_path)).await.ok()?;
    serde_json::from_str(&text).ok()
}

async fn write_stamp(install_path: &Path, stamp: &InstallStamp) -> io::Result<()> {
    let json = serde_json::to_string_pretty(stamp).map_err(io::Error::other)?;
    tokio::fs::write(stamp_path(install_path), json).await
}

async fn sha256_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = File::open(&path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(io::Error::other)?
}

async fn extract_member(
    kind: ToolKind,
    archive_path: &Path,
    member: &str,
    out_path: &Path,
) -> Result<(), ProvisionError> {
    let archive_path = archive_path.to_path_buf();
    let out_path = out_path.to_path_buf();
    let member = member.replace('\\', "/").to_ascii_lowercase();
    let extract_err = move |message: String| ProvisionError::Extract { tool: kind, message };

    tokio::task::spawn_blocking(move || {
        let file = File::open(&archive_path).map_err(|e| extract_err(e.to_string()))?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| extract_err(format!("not a zip archive: {e}")))?;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| extract_err(format!("bad archive entry: {e}")))?;
            if entry.is_dir() {
                continue;
            }

            let name = entry.name().replace('\\', "/").to_ascii_lowercase();
            if name == member || name.ends_with(&format!("/{member}")) {
                let mut output = File::create(&out_path).map_err(|e| extract_err(e.to_string()))?;
                io::copy(&mut entry, &mut output).map_err(|e| extract_err(e.to_string()))?;
                return Ok(());
            }
        }

        Err(extract_err(format!("no entry named '{member}'")))
    })
    .await
    .map_err(|e| ProvisionError::Extract {
        tool: kind,
        message: e.to_string(),
    })?
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Locate `file_name` on the system `PATH`.
pub fn find_on_path(file_name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    find_in_dirs(file_name, std::env::split_paths(&paths))
}

fn find_in_dirs(file_name: &str, dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// Release sources for the current platform.
pub fn default_specs(tools_dir: &Path) -> Vec<ToolSpec> {
    ToolKind::ALL
        .into_iter()
        .map(|kind| ToolSpec {
            kind,
            version: "latest".to_string(),
            source: default_source(kind),
            install_path: tools_dir.join(kind.file_name()),
        })
        .collect()
}

fn default_source(kind: ToolKind) -> Option<ToolSource> {
    const YTDLP_BASE: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
    const FFMPEG_BASE: &str = "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest";
    const ATOMICPARSLEY_BASE: &str = "https://github.com/wez/atomicparsley/releases/latest/download";

    match kind {
        ToolKind::Engine => {
            let asset = if cfg!(target_os = "windows") {
                "yt-dlp.exe"
            } else if cfg!(target_os = "macos") {
                "yt-dlp_macos"
            } else if cfg!(target_arch = "aarch64") {
                "yt-dlp_linux_aarch64"
            } else {
                "yt-dlp_linux"
            };
            Some(ToolSource {
                url: format!("{YTDLP_BASE}/{asset}"),
                checksum: Checksum::Manifest {
                    url: format!("{YTDLP_BASE}/SHA2-256SUMS"),
                    asset: asset.to_string(),
                },
                archive_member: None,
            })
        }
        ToolKind::Muxer if cfg!(target_os = "windows") => {
            let asset = "ffmpeg-master-latest-win64-gpl.zip";
            Some(ToolSource {
                url: format!("{FFMPEG_BASE}/{asset}"),
                checksum: Checksum::Manifest {
                    url: format!("{FFMPEG_BASE}/checksums.sha256"),
                    asset: asset.to_string(),
                },
                archive_member: Some("bin/ffmpeg.exe".to_string()),
            })
        }
        // package managers cover ffmpeg elsewhere
        ToolKind::Muxer => None,
        ToolKind::MetadataEmbedder => {
            let (asset, member) = if cfg!(target_os = "windows") {
                ("AtomicParsleyWindows.zip", "AtomicParsley.exe")
            } else if cfg!(target_os = "macos") {
                ("AtomicParsleyMacOS.zip", "AtomicParsley")
            } else {
                ("AtomicParsleyLinux.zip", "AtomicParsley")
            };
            Some(ToolSource {
                url: format!("{ATOMICPARSLEY_BASE}/{asset}"),
                // the release page publishes no checksums
                checksum: Checksum::None,
                archive_member: Some(member.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ReleaseConfig;
    use std::io::Write;

    const BODY: &[u8] = b"#!/bin/sh\necho fake-tool\n";

    fn digest_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn client() -> ReleaseClient {
        ReleaseClient::new(ReleaseConfig::default()).unwrap()
    }

    fn tool_spec(dir: &Path, url: String, checksum: Checksum) -> ToolSpec {
        ToolSpec {
            kind: ToolKind::Engine,
            version: "2024.01.01".to_string(),
            source: Some(ToolSource {
                url,
                checksum,
                archive_member: None,
            }),
            install_path: dir.join("tools").join(ToolKind::Engine.file_name()),
        }
    }

    fn provisioner_for(specs: Vec<ToolSpec>) -> ToolProvisioner {
        ToolProvisioner::new(
            ProvisionerConfig {
                specs,
                overrides: HashMap::new(),
                allow_system: false,
            },
            client(),
        )
    }

    #[tokio::test]
    async fn test_missing_tool_fetched_once_then_reused() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/yt-dlp")
            .with_status(200)
            .with_body(BODY)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let spec = tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::Sha256(digest_of(BODY)),
        );
        let provisioner = provisioner_for(vec![spec.clone()]);

        assert_eq!(provisioner.status(ToolKind::Engine).await, ToolStatus::Missing);

        let path = provisioner.ensure(ToolKind::Engine).await.unwrap();
        assert_eq!(path, spec.install_path);
        assert_eq!(std::fs::read(&path).unwrap(), BODY);

        // present and verified: no further requests
        let again = provisioner.ensure(ToolKind::Engine).await.unwrap();
        assert_eq!(again, path);
        let fresh = provisioner_for(vec![spec]);
        fresh.ensure(ToolKind::Engine).await.unwrap();

        mock.assert_async().await;
        assert!(matches!(
            provisioner.status(ToolKind::Engine).await,
            ToolStatus::Ready { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_installed_tool_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/yt-dlp")
            .with_body(BODY)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner_for(vec![tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::None,
        )]);

        let path = provisioner.ensure(ToolKind::Engine).await.unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/yt-dlp")
            .with_body(b"tampered".as_slice())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let spec = tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::Sha256(digest_of(BODY)),
        );
        let provisioner = provisioner_for(vec![spec.clone()]);

        let err = provisioner.ensure(ToolKind::Engine).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ChecksumMismatch { .. }));
        assert!(!spec.install_path.exists());
        assert!(!spec.install_path.with_extension("download").exists());

        let err: DownloadError = err.into();
        assert!(matches!(err, DownloadError::Provision { ref tool, .. } if tool == "yt-dlp"));
    }

    #[tokio::test]
    async fn test_manifest_checksum() {
        let mut server = mockito::Server::new_async().await;
        let manifest = server
            .mock("GET", "/SHA2-256SUMS")
            .with_body(format!("{}  yt-dlp_linux\n", digest_of(BODY)))
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/yt-dlp_linux")
            .with_body(BODY)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner_for(vec![tool_spec(
            dir.path(),
            format!("{}/yt-dlp_linux", server.url()),
            Checksum::Manifest {
                url: format!("{}/SHA2-256SUMS", server.url()),
                asset: "yt-dlp_linux".to_string(),
            },
        )]);

        provisioner.ensure(ToolKind::Engine).await.unwrap();
        manifest.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_refetches_only_on_new_release() {
        const NEW_BODY: &[u8] = b"#!/bin/sh\necho fake-tool 2\n";

        let mut server = mockito::Server::new_async().await;
        let old_manifest = server
            .mock("GET", "/SHA2-256SUMS")
            .with_body(format!("{}  yt-dlp_linux\n", digest_of(BODY)))
            .expect(2)
            .create_async()
            .await;
        let old_artifact = server
            .mock("GET", "/yt-dlp_linux")
            .with_body(BODY)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let spec = tool_spec(
            dir.path(),
            format!("{}/yt-dlp_linux", server.url()),
            Checksum::Manifest {
                url: format!("{}/SHA2-256SUMS", server.url()),
                asset: "yt-dlp_linux".to_string(),
            },
        );
        let tools = provisioner_for(vec![spec.clone()]);

        let path = tools.ensure(ToolKind::Engine).await.unwrap();
        assert_eq!(
            tools.update(ToolKind::Engine).await.unwrap(),
            ToolUpdate::Current(path.clone())
        );
        old_manifest.assert_async().await;
        old_artifact.assert_async().await;
        old_manifest.remove_async().await;
        old_artifact.remove_async().await;

        // upstream publishes a new build under the same URL
        let new_manifest = server
            .mock("GET", "/SHA2-256SUMS")
            .with_body(format!("{}  yt-dlp_linux\n", digest_of(NEW_BODY)))
            .expect(2)
            .create_async()
            .await;
        let new_artifact = server
            .mock("GET", "/yt-dlp_linux")
            .with_body(NEW_BODY)
            .expect(1)
            .create_async()
            .await;

        let fresh = provisioner_for(vec![spec]);
        assert_eq!(
            fresh.update(ToolKind::Engine).await.unwrap(),
            ToolUpdate::Updated(path.clone())
        );
        assert_eq!(std::fs::read(&path).unwrap(), NEW_BODY);
        assert_eq!(
            fresh.update(ToolKind::Engine).await.unwrap(),
            ToolUpdate::Current(path.clone())
        );
        assert!(matches!(
            fresh.status(ToolKind::Engine).await,
            ToolStatus::Ready { .. }
        ));

        new_manifest.assert_async().await;
        new_artifact.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_without_digest_always_refetches() {
        let mut server = mockito::Server::new_async().await;
        let artifact = server
            .mock("GET", "/yt-dlp")
            .with_body(BODY)
            .expect(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tools = provisioner_for(vec![tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::None,
        )]);

        let path = tools.ensure(ToolKind::Engine).await.unwrap();
        assert_eq!(
            tools.update(ToolKind::Engine).await.unwrap(),
            ToolUpdate::Updated(path)
        );
        artifact.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/yt-dlp")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner_for(vec![tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::None,
        )]);

        let err = provisioner.ensure(ToolKind::Engine).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_version_change_triggers_refetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/yt-dlp")
            .with_body(BODY)
            .expect(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut spec = tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::None,
        );
        provisioner_for(vec![spec.clone()])
            .ensure(ToolKind::Engine)
            .await
            .unwrap();

        spec.version = "2025.02.02".to_string();
        let upgraded = provisioner_for(vec![spec]);
        assert!(matches!(
            upgraded.status(ToolKind::Engine).await,
            ToolStatus::Stale { .. }
        ));
        upgraded.ensure(ToolKind::Engine).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_corrupted_install_is_stale() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/yt-dlp")
            .with_body(BODY)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let spec = tool_spec(
            dir.path(),
            format!("{}/yt-dlp", server.url()),
            Checksum::None,
        );
        let provisioner = provisioner_for(vec![spec.clone()]);
        provisioner.ensure(ToolKind::Engine).await.unwrap();

        std::fs::write(&spec.install_path, b"truncated").unwrap();
        assert!(matches!(
            provisioner.status(ToolKind::Engine).await,
            ToolStatus::Stale { .. }
        ));
    }

    #[tokio::test]
    async fn test_zip_member_extraction() {
        let mut archive = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        archive
            .start_file(
                "ffmpeg-build/bin/ffmpeg.exe",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
        archive.write_all(BODY).unwrap();
        archive
            .start_file("ffmpeg-build/README", zip::write::SimpleFileOptions::default())
            .unwrap();
        archive.write_all(b"readme").unwrap();
        let zipped = archive.finish().unwrap().into_inner();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ffmpeg.zip")
            .with_body(zipped)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let spec = ToolSpec {
            kind: ToolKind::Muxer,
            version: "latest".to_string(),
            source: Some(ToolSource {
                url: format!("{}/ffmpeg.zip", server.url()),
                checksum: Checksum::None,
                archive_member: Some("bin/ffmpeg.exe".to_string()),
            }),
            install_path: dir.path().join("tools").join("ffmpeg"),
        };
        let provisioner = provisioner_for(vec![spec.clone()]);

        let path = provisioner.ensure(ToolKind::Muxer).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_override_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("my-ffmpeg");
        std::fs::write(&custom, BODY).unwrap();

        let mut overrides = HashMap::new();
        overrides.insert(ToolKind::Muxer, custom.clone());
        let provisioner = ToolProvisioner::new(
            ProvisionerConfig {
                specs: Vec::new(),
                overrides,
                allow_system: false,
            },
            client(),
        );

        assert_eq!(provisioner.ensure(ToolKind::Muxer).await.unwrap(), custom);
        assert_eq!(
            provisioner.update(ToolKind::Muxer).await.unwrap(),
            ToolUpdate::Unmanaged(custom.clone())
        );
        assert_eq!(
            provisioner.status(ToolKind::Muxer).await,
            ToolStatus::Overridden { path: custom }
        );
    }

    #[tokio::test]
    async fn test_missing_override_is_error() {
        let mut overrides = HashMap::new();
        overrides.insert(ToolKind::Muxer, PathBuf::from("/nonexistent/ffmpeg"));
        let provisioner = ToolProvisioner::new(
            ProvisionerConfig {
                specs: Vec::new(),
                overrides,
                allow_system: false,
            },
            client(),
        );

        assert!(matches!(
            provisioner.ensure(ToolKind::Muxer).await,
            Err(ProvisionError::BadOverride { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner_for(vec![ToolSpec {
            kind: ToolKind::Muxer,
            version: "latest".to_string(),
            source: None,
            install_path: dir.path().join("ffmpeg"),
        }]);

        assert!(matches!(
            provisioner.ensure(ToolKind::Muxer).await,
            Err(ProvisionError::NoSource(ToolKind::Muxer))
        ));
    }

    #[test]
    fn test_find_in_dirs() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(b.path().join("ffmpeg"), BODY).unwrap();

        let found = find_in_dirs("ffmpeg", vec![a.path().to_path_buf(), b.path().to_path_buf()]);
        assert_eq!(found, Some(b.path().join("ffmpeg")));
        assert_eq!(find_in_dirs("AtomicParsley", vec![a.path().to_path_buf()]), None);
    }

    #[test]
    fn test_default_specs_cover_all_tools() {
        let specs = default_specs(Path::new("/data/tools"));
        assert_eq!(specs.len(), 3);
        assert!(specs
            .iter()
            .all(|s| s.install_path.starts_with("/data/tools")));

        let engine = specs.iter().find(|s| s.kind == ToolKind::Engine).unwrap();
        let source = engine.source.as_ref().unwrap();
        assert!(source.url.starts_with("https://"));
        assert!(matches!(source.checksum, Checksum::Manifest { .. }));

        let unchecked: Vec<_> = specs
            .iter()
            .filter(|s| matches!(&s.source, Some(src) if src.checksum == Checksum::None))
            .map(|s| s.kind)
            .collect();
        assert_eq!(unchecked, vec![ToolKind::MetadataEmbedder]);
    }

    #[test]
    fn test_stamp_path() {
        assert_eq!(
            stamp_path(Path::new("/t/yt-dlp.exe")),
            PathBuf::from("/t/yt-dlp.exe.stamp.json")
        );
    }
}
