//! Job orchestration: one background task per `start` call.
//!
//! A job's state lives in a `watch` channel whose updates are serialized and
//! refuse to leave a terminal state. Events fan out over a `broadcast`
//! channel; the terminal `Finished` event is sent under the same lock that
//! records the terminal state, so a subscriber sees it exactly once whether it
//! subscribed before or after the job ended.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::classify::classify_failure;
use super::format::format_expression;
use super::post_process::{PostProcessing, PostProcessor};
use super::progress::{ProgressTracker, ProgressUpdate, PROGRESS_TEMPLATE};
use super::retry_handler::{RetryHandler, RetryPolicy};
use super::{CookieStore, ToolProvisioner};
use crate::domain::{
    CookieMode, DownloadError, DownloadRequest, JobEvent, JobId, JobOutcome, JobState, Phase,
    ProgressEvent, Quality, ToolKind, VideoInfo,
};
use crate::process::{self, OutputLine, RunEvent, RunOptions, RunResult};
use crate::utils::{output_template, validate_source_url};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    /// Time between the polite and the forced termination on cancel.
    pub cancel_grace: Duration,
    /// Report [`JobEvent::Stalled`] after this much engine silence.
    pub stall_after: Option<Duration>,
    /// Kill an attempt after this much silence; the attempt counts as a
    /// network failure.
    pub hard_timeout: Option<Duration>,
    pub post_processing: PostProcessing,
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cancel_grace: Duration::from_secs(5),
            stall_after: Some(Duration::from_secs(60)),
            hard_timeout: None,
            post_processing: PostProcessing::default(),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct JobSnapshot {
    state: JobState,
    outcome: Option<JobOutcome>,
}

struct JobShared {
    id: JobId,
    snapshot: watch::Sender<JobSnapshot>,
    events: broadcast::Sender<JobEvent>,
    cancel: CancellationToken,
}

impl JobShared {
    fn new(capacity: usize) -> Self {
        let (snapshot, _) = watch::channel(JobSnapshot {
            state: JobState::Pending,
            outcome: None,
        });
        let (events, _) = broadcast::channel(capacity.max(16));

        Self {
            id: JobId::new(),
            snapshot,
            events,
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> JobState {
        self.snapshot.borrow().state
    }

    fn emit(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_progress(&self, update: ProgressUpdate) {
        self.emit(JobEvent::Progress(ProgressEvent {
            job_id: self.id,
            phase: update.phase,
            percent: update.percent,
            downloaded_bytes: update.downloaded_bytes,
            total_bytes: update.total_bytes,
            message: update.message,
        }));
    }

    fn emit_phase(&self, phase: Phase, message: &str) {
        self.emit_progress(ProgressUpdate {
            phase,
            percent: None,
            downloaded_bytes: None,
            total_bytes: None,
            message: message.to_string(),
        });
    }

    /// Move to a non-terminal state. Ignored once the job has finished.
    fn transition(&self, next: JobState) -> bool {
        let changed = self.snapshot.send_if_modified(|snap| {
            if snap.state.is_terminal() || snap.state == next {
                return false;
            }
            snap.state = next;
            let _ = self.events.send(JobEvent::State(next));
            true
        });
        if changed {
            debug!(job = %self.id, state = ?next, "job state changed");
        }
        changed
    }

    /// Record the terminal outcome. Only the first call has any effect.
    fn finish(&self, outcome: JobOutcome) -> bool {
        let state = outcome.state;
        let changed = self.snapshot.send_if_modified(|snap| {
            if snap.state.is_terminal() {
                return false;
            }
            snap.state = outcome.state;
            snap.outcome = Some(outcome.clone());
            let _ = self.events.send(JobEvent::Finished(outcome.clone()));
            true
        });

        if changed {
            match &outcome.reason {
                Some(reason) if state == JobState::Failed => {
                    error!(job = %self.id, kind = reason.kind(), "job failed: {}", reason)
                }
                Some(reason) if state == JobState::Succeeded => {
                    warn!(job = %self.id, "job succeeded with warning: {}", reason)
                }
                _ => info!(job = %self.id, ?state, "job finished"),
            }
        }
        changed
    }
}

/// Caller's view of a job. Cheap to clone; all clones observe the same job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

enum ProgressState {
    Live(broadcast::Receiver<JobEvent>),
    Done,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.shared.snapshot.borrow().outcome.clone()
    }

    /// Events from now on, ending with exactly one [`JobEvent::Finished`].
    /// Subscribing after the job ended yields only the `Finished` event.
    pub fn progress(&self) -> BoxStream<'static, JobEvent> {
        let rx = self.shared.events.subscribe();
        if let Some(outcome) = self.outcome() {
            return stream::once(async move { JobEvent::Finished(outcome) }).boxed();
        }

        let job = self.shared.id;
        stream::unfold(ProgressState::Live(rx), move |state| async move {
            let ProgressState::Live(mut rx) = state else {
                return None;
            };

            loop {
                match rx.recv().await {
                    Ok(event) if event.is_terminal() => return Some((event, ProgressState::Done)),
                    Ok(event) => return Some((event, ProgressState::Live(rx))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%job, skipped, "progress subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Ask the job to stop. Has no effect on a finished job or when called
    /// again.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            debug!(job = %self.shared.id, "cancel ignored, job already finished");
            return;
        }
        if !self.shared.cancel.is_cancelled() {
            info!(job = %self.shared.id, "cancellation requested");
            self.shared.cancel.cancel();
        }
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.shared.snapshot.subscribe();
        let outcome = match rx.wait_for(|snap| snap.outcome.is_some()).await {
            Ok(snap) => snap.outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| JobOutcome::failed(lost_job()))
    }
}

fn lost_job() -> DownloadError {
    DownloadError::Io("job state is no longer available".to_string())
}

/// Everything one job's background task needs, resolved before it starts.
struct JobContext {
    engine: PathBuf,
    args: Vec<String>,
    retry: RetryPolicy,
    run_options: RunOptions,
    post: PostProcessor,
}

pub struct DownloadManager {
    provisioner: Arc<ToolProvisioner>,
    cookies: CookieStore,
    config: ManagerConfig,
}

impl DownloadManager {
    pub fn new(
        provisioner: Arc<ToolProvisioner>,
        cookies: CookieStore,
        config: ManagerConfig,
    ) -> Self {
        Self {
            provisioner,
            cookies,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &ToolProvisioner {
        &self.provisioner
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    /// Validate the request, make sure the tools are in place and launch the
    /// job in the background. Errors here mean no job was created.
    pub async fn start(&self, request: DownloadRequest) -> Result<JobHandle, DownloadError> {
        let url = validate_source_url(&request.url)?;
        let destination = prepare_destination(&request.destination)?;
        let cookie_args = self.cookies.args_for(&request.cookie_mode)?;

        let engine = self.provisioner.ensure(ToolKind::Engine).await?;
        // the engine merges separate video and audio streams with it
        let muxer = self.provisioner.ensure(ToolKind::Muxer).await?;

        let settings = self.config.post_processing;
        let mut post = PostProcessor::new(self.config.cancel_grace);
        if settings.mux {
            post = post.with_muxer(muxer.clone());
        }
        if settings.embed_metadata {
            let embedder = self.provisioner.ensure(ToolKind::MetadataEmbedder).await?;
            post = post.with_embedder(embedder);
        }

        let args = engine_args(&EngineInvocation {
            url: &url,
            quality: request.quality,
            destination: &destination,
            muxer: Some(&muxer),
            cookie_args: &cookie_args,
            embed_metadata: settings.embed_metadata,
        });

        let shared = Arc::new(JobShared::new(self.config.event_capacity));
        info!(
            job = %shared.id,
            %url,
            quality = %request.quality,
            destination = %destination.display(),
            "starting download job"
        );

        let context = JobContext {
            engine,
            args,
            retry: self.config.retry.clone(),
            run_options: RunOptions {
                grace: self.config.cancel_grace,
                idle: self.config.stall_after,
                hard_timeout: self.config.hard_timeout,
            },
            post,
        };

        shared.transition(JobState::Running);

        let task_shared = shared.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn(run_job(task_shared.clone(), context));
            if let Err(e) = worker.await {
                task_shared.finish(JobOutcome::failed(DownloadError::Io(format!(
                    "job task ended unexpectedly: {e}"
                ))));
            }
        });

        Ok(JobHandle { shared })
    }

    /// Fetch video metadata without downloading anything.
    pub async fn probe(
        &self,
        url: &str,
        cookie_mode: &CookieMode,
    ) -> Result<VideoInfo, DownloadError> {
        let url = validate_source_url(url)?;
        let cookie_args = self.cookies.args_for(cookie_mode)?;
        let engine = self.provisioner.ensure(ToolKind::Engine).await?;

        let mut args: Vec<String> = [
            "--dump-json",
            "--no-download",
            "--no-playlist",
            "--no-warnings",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(cookie_args);
        args.push(url.to_string());

        let options = RunOptions {
            grace: self.config.cancel_grace,
            idle: None,
            hard_timeout: self.config.hard_timeout,
        };
        let mut json = None;

        debug!(%url, "probing video metadata");
        let result = process::run_streaming(
            &engine,
            &args,
            &options,
            &CancellationToken::new(),
            |event| {
                if let RunEvent::Line(OutputLine::Stdout(text)) = event {
                    if json.is_none() && text.starts_with('{') {
                        json = Some(text.clone());
                    }
                }
            },
        )
        .await
        .map_err(|e| DownloadError::Io(format!("failed to run {}: {e}", engine.display())))?;

        match result {
            RunResult::Exited { status, .. } if status.success() => {
                let json = json.ok_or_else(|| DownloadError::Engine {
                    code: status.code(),
                    message: "engine printed no metadata".to_string(),
                })?;
                serde_json::from_str(&json).map_err(|e| DownloadError::Engine {
                    code: status.code(),
                    message: format!("unreadable metadata: {e}"),
                })
            }
            RunResult::Exited { status, tail } => Err(classify_failure(status.code(), &tail)),
            RunResult::Cancelled => Err(DownloadError::Cancelled),
            RunResult::TimedOut { idle } => Err(DownloadError::Network(format!(
                "no output from engine for {}s",
                idle.as_secs()
            ))),
        }
    }
}

async fn run_job(shared: Arc<JobShared>, context: JobContext) {
    let handler = RetryHandler::new(context.retry.clone(), shared.cancel.clone());

    let result = handler
        .run_observed(
            |attempt| run_attempt(&shared, &context, attempt),
            |notice| {
                shared.emit(JobEvent::Retrying {
                    attempt: notice.attempt,
                    max_attempts: notice.max_attempts,
                    delay: notice.delay,
                    reason: notice.error,
                })
            },
        )
        .await;

    let outcome = match result {
        Ok(media) => post_process(&shared, &context.post, media).await,
        Err(DownloadError::Cancelled) => JobOutcome::cancelled(),
        Err(e) => JobOutcome::failed(e),
    };

    shared.finish(outcome);
}

async fn post_process(
    shared: &JobShared,
    post: &PostProcessor,
    media: Option<PathBuf>,
) -> JobOutcome {
    let Some(media) = media else {
        if post.is_empty() {
            return JobOutcome::succeeded(None);
        }
        return JobOutcome::succeeded_with_warning(
            None,
            DownloadError::PostProcess {
                step: "output".to_string(),
                message: "output file could not be determined".to_string(),
            },
        );
    };

    if post.is_empty() {
        return JobOutcome::succeeded(Some(media));
    }

    match post
        .run(&media, &shared.cancel, |phase, message| shared.emit_phase(phase, message))
        .await
    {
        Ok(processed) => match processed.warning {
            Some(warning) => JobOutcome::succeeded_with_warning(Some(processed.output), warning),
            None => JobOutcome::succeeded(Some(processed.output)),
        },
        Err(DownloadError::Cancelled) => JobOutcome::cancelled(),
        Err(e) => JobOutcome::succeeded_with_warning(Some(media), e),
    }
}

async fn run_attempt(
    shared: &JobShared,
    context: &JobContext,
    attempt: u32,
) -> Result<Option<PathBuf>, DownloadError> {
    info!(job = %shared.id, attempt, "running download engine");
    shared.emit_phase(Phase::Preparing, "Starting download");

    let mut tracker = ProgressTracker::new();
    let result = process::run_streaming(
        &context.engine,
        &context.args,
        &context.run_options,
        &shared.cancel,
        |event| match event {
            RunEvent::Line(line) => match tracker.feed(line.text()) {
                Some(update) => shared.emit_progress(update),
                None => trace!(job = %shared.id, "{}", line.text()),
            },
            RunEvent::Idle(idle) => {
                warn!(job = %shared.id, ?idle, "download engine is silent");
                shared.emit(JobEvent::Stalled { idle });
            }
        },
    )
    .await
    .map_err(|e| DownloadError::Io(format!("failed to run {}: {e}", context.engine.display())))?;

    match result {
        RunResult::Exited { status, .. } if status.success() => {
            let output = tracker.output_path().filter(|p| p.is_file());
            if output.is_none() {
                warn!(job = %shared.id, "engine succeeded but reported no output file");
            }
            Ok(output)
        }
        RunResult::Exited { status, tail } => Err(classify_failure(status.code(), &tail)),
        RunResult::Cancelled => Err(DownloadError::Cancelled),
        RunResult::TimedOut { idle } => Err(DownloadError::Network(format!(
            "no output from engine for {}s",
            idle.as_secs()
        ))),
    }
}

/// Inputs for one engine command line.
#[derive(Debug, Clone)]
pub struct EngineInvocation<'a> {
    pub url: &'a Url,
    pub quality: Quality,
    pub destination: &'a Path,
    pub muxer: Option<&'a Path>,
    pub cookie_args: &'a [String],
    /// Embed metadata and chapters and keep a jpg thumbnail for the embedder.
    pub embed_metadata: bool,
}

/// Argument list for a download run. The URL is always last.
pub fn engine_args(invocation: &EngineInvocation<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--progress".into(),
        "--progress-template".into(),
        PROGRESS_TEMPLATE.into(),
        "--no-playlist".into(),
        "--no-colors".into(),
        "-f".into(),
        format_expression(invocation.quality),
        "-o".into(),
        output_template(invocation.destination),
        "--merge-output-format".into(),
        "mp4".into(),
    ];

    if let Some(muxer) = invocation.muxer {
        args.push("--ffmpeg-location".into());
        args.push(muxer.to_string_lossy().into_owned());
    }
    if invocation.embed_metadata {
        args.extend(
            [
                "--embed-metadata",
                "--embed-chapters",
                "--write-thumbnail",
                "--convert-thumbnails",
                "jpg",
            ]
            .map(String::from),
        );
    }

    args.extend(invocation.cookie_args.iter().cloned());
    args.push(invocation.url.to_string());
    args
}

/// The destination must be an existing, writable directory.
fn prepare_destination(destination: &Path) -> Result<PathBuf, DownloadError> {
    let destination = std::path::absolute(destination).map_err(|e| {
        DownloadError::InvalidInput(format!("bad destination {}: {e}", destination.display()))
    })?;

    if !destination.is_dir() {
        return Err(DownloadError::InvalidInput(format!(
            "destination directory does not exist: {}",
            destination.display()
        )));
    }

    let probe = destination.join(format!(".yt-fetch-{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&probe, b"").map_err(|e| {
        DownloadError::InvalidInput(format!(
            "destination directory is not writable: {} ({e})",
            destination.display()
        ))
    })?;
    let _ = std::fs::remove_file(&probe);

    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation<'a>(url: &'a Url, cookie_args: &'a [String]) -> EngineInvocation<'a> {
        EngineInvocation {
            url,
            quality: Quality::Height(720),
            destination: Path::new("/videos"),
            muxer: Some(Path::new("/tools/ffmpeg")),
            cookie_args,
            embed_metadata: false,
        }
    }

    #[test]
    fn test_engine_args() {
        let url = Url::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        let cookies = vec!["--cookies-from-browser".to_string(), "firefox".to_string()];
        let args = engine_args(&invocation(&url, &cookies));

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-f") + 1], format_expression(Quality::Height(720)));
        assert_eq!(args[pos("--ffmpeg-location") + 1], "/tools/ffmpeg");
        assert_eq!(args[pos("--progress-template") + 1], PROGRESS_TEMPLATE);
        assert_eq!(args[pos("--cookies-from-browser") + 1], "firefox");
        assert!(args[pos("-o") + 1].starts_with("/videos"));
        assert!(!args.contains(&"--write-thumbnail".to_string()));
        assert!(!args.contains(&"--embed-metadata".to_string()));
        assert_eq!(args.last().unwrap(), url.as_str());
    }

    #[test]
    fn test_engine_args_with_metadata() {
        let url = Url::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();
        let mut inv = invocation(&url, &[]);
        inv.embed_metadata = true;
        inv.muxer = None;
        let args = engine_args(&inv);

        for flag in ["--embed-metadata", "--embed-chapters", "--write-thumbnail"] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
        let pos = args.iter().position(|a| a == "--convert-thumbnails").unwrap();
        assert_eq!(args[pos + 1], "jpg");
        assert!(!args.contains(&"--ffmpeg-location".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--cookies")));
    }

    #[test]
    fn test_prepare_destination() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prepare_destination(dir.path()).unwrap(), dir.path());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let missing = dir.path().join("missing");
        assert!(matches!(
            prepare_destination(&missing),
            Err(DownloadError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_returns_recorded_outcome() {
        let handle = JobHandle {
            shared: Arc::new(JobShared::new(16)),
        };
        let waiter = handle.clone();
        let pending = tokio::spawn(async move { waiter.wait().await });

        handle.shared.transition(JobState::Running);
        handle.shared.finish(JobOutcome::succeeded(None));

        assert_eq!(pending.await.unwrap(), JobOutcome::succeeded(None));
        // already finished: returns at once
        assert_eq!(handle.wait().await, JobOutcome::succeeded(None));
    }

    #[tokio::test]
    async fn test_finish_is_recorded_once() {
        let shared = JobShared::new(16);
        let mut rx = shared.events.subscribe();

        assert!(shared.transition(JobState::Running));
        assert!(shared.finish(JobOutcome::cancelled()));
        assert!(!shared.finish(JobOutcome::succeeded(None)));
        assert!(!shared.transition(JobState::Running));

        assert_eq!(rx.recv().await.unwrap(), JobEvent::State(JobState::Running));
        assert_eq!(rx.recv().await.unwrap(), JobEvent::Finished(JobOutcome::cancelled()));
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.state(), JobState::Cancelled);
    }
}
