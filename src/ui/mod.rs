use std::time::Duration;

use yt_fetch_core::application::ToolUpdate;
use yt_fetch_core::domain::{
    JobEvent, JobOutcome, JobState, Phase, ProgressEvent, ToolKind, ToolStatus, VideoInfo,
};

/// Console view of one download.
pub struct DownloadView {
    pub status_message: String,
    pub download_progress: f32,
    pub is_downloading: bool,
    last_phase: Option<Phase>,
    last_bucket: Option<u32>,
}

/// Percent step between printed progress lines.
const PROGRESS_STEP: u32 = 10;

impl Default for DownloadView {
    fn default() -> Self {
        Self {
            status_message: "Waiting for download to start".to_string(),
            download_progress: 0.0,
            is_downloading: false,
            last_phase: None,
            last_bucket: None,
        }
    }
}

impl DownloadView {
    /// Apply an event; returns the line to print, if the change is worth one.
    pub fn update(&mut self, event: &JobEvent) -> Option<String> {
        match event {
            JobEvent::State(state) => {
                self.is_downloading = *state == JobState::Running;
                None
            }
            JobEvent::Progress(progress) => self.progress(progress),
            JobEvent::Retrying {
                attempt,
                max_attempts,
                delay,
                reason,
            } => {
                self.last_bucket = None;
                self.status_message = format!(
                    "Attempt {attempt}/{max_attempts} failed ({reason}), retrying in {}",
                    format_duration(*delay)
                );
                Some(self.status_message.clone())
            }
            JobEvent::Stalled { idle } => {
                self.status_message = format!(
                    "No output for {}, press Ctrl-C to cancel",
                    format_duration(*idle)
                );
                Some(self.status_message.clone())
            }
            JobEvent::Finished(outcome) => {
                self.is_downloading = false;
                self.status_message = outcome_message(outcome);
                Some(self.status_message.clone())
            }
        }
    }

    fn progress(&mut self, progress: &ProgressEvent) -> Option<String> {
        let phase_changed = self.last_phase != Some(progress.phase);
        self.last_phase = Some(progress.phase);
        self.status_message = progress.message.clone();

        let Some(percent) = progress.percent else {
            self.last_bucket = None;
            return phase_changed.then(|| progress.message.clone());
        };

        self.download_progress = percent / 100.0;
        let bucket = (percent as u32) / PROGRESS_STEP;
        if phase_changed || self.last_bucket != Some(bucket) {
            self.last_bucket = Some(bucket);
            let mut line = format!("{} {}", progress_bar(percent), progress.message);
            if let (Some(done), Some(total)) = (progress.downloaded_bytes, progress.total_bytes) {
                line.push_str(&format!(" ({} / {})", format_bytes(done), format_bytes(total)));
            }
            return Some(line);
        }
        None
    }
}

pub fn outcome_message(outcome: &JobOutcome) -> String {
    let output = outcome
        .output
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unknown location".to_string());

    match (outcome.state, &outcome.reason) {
        (JobState::Succeeded, None) => format!("Saved: {output}"),
        (JobState::Succeeded, Some(warning)) => format!("Saved: {output} (warning: {warning})"),
        (JobState::Cancelled, _) => "Download cancelled".to_string(),
        (_, Some(reason)) => format!("Download failed: {reason}"),
        (state, None) => format!("Download ended in state {state:?}"),
    }
}

pub fn video_info(info: &VideoInfo) -> String {
    let mut lines = vec![format!("Title:    {}", info.title), format!("ID:       {}", info.id)];
    if let Some(uploader) = &info.uploader {
        lines.push(format!("Uploader: {uploader}"));
    }
    if let Some(duration) = info.duration {
        lines.push(format!(
            "Duration: {}",
            format_duration(Duration::from_secs_f64(duration.max(0.0)))
        ));
    }
    lines.join("\n")
}

pub fn tool_status(kind: ToolKind, status: &ToolStatus) -> String {
    let detail = match status {
        ToolStatus::Ready { path, version } => format!("ready ({version}) {}", path.display()),
        ToolStatus::Overridden { path } => format!("configured {}", path.display()),
        ToolStatus::System { path } => format!("system {}", path.display()),
        ToolStatus::Stale { path, reason } => format!("stale: {reason} ({})", path.display()),
        ToolStatus::Missing => "missing".to_string(),
    };
    format!("{:<14} {detail}", kind.name())
}

pub fn tool_update(kind: ToolKind, update: &ToolUpdate) -> String {
    let detail = match update {
        ToolUpdate::Current(path) => format!("up to date {}", path.display()),
        ToolUpdate::Updated(path) => format!("updated {}", path.display()),
        ToolUpdate::Unmanaged(path) => format!("configured, not updated {}", path.display()),
    };
    format!("{:<14} {detail}", kind.name())
}

fn progress_bar(percent: f32) -> String {
    const WIDTH: usize = 20;
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * WIDTH as f32).round() as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(WIDTH - filled))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    } else if secs >= 60 {
        format!("{}:{:02}", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use yt_fetch_core::domain::{DownloadError, JobId};

    fn progress(percent: Option<f32>, phase: Phase) -> JobEvent {
        JobEvent::Progress(ProgressEvent {
            job_id: JobId::new(),
            phase,
            percent,
            downloaded_bytes: None,
            total_bytes: None,
            message: "Downloading video".to_string(),
        })
    }

    #[test]
    fn test_progress_lines_are_throttled() {
        let mut view = DownloadView::default();
        assert!(view.update(&progress(Some(1.0), Phase::Downloading)).is_some());
        assert!(view.update(&progress(Some(5.0), Phase::Downloading)).is_none());
        assert!(view.update(&progress(Some(12.0), Phase::Downloading)).is_some());
        assert!(view.update(&progress(None, Phase::Muxing)).is_some());
        assert!(view.update(&progress(None, Phase::Muxing)).is_none());
        assert!((view.download_progress - 0.12).abs() < f32::EPSILON);
    }

    #[test]
    fn test_outcome_messages() {
        let ok = JobOutcome::succeeded(Some(PathBuf::from("/v/clip.mp4")));
        assert_eq!(outcome_message(&ok), "Saved: /v/clip.mp4");

        let warned = JobOutcome::succeeded_with_warning(
            Some(PathBuf::from("/v/clip.mp4")),
            DownloadError::PostProcess {
                step: "mux".into(),
                message: "exit 1".into(),
            },
        );
        assert!(outcome_message(&warned).contains("warning"));

        assert_eq!(outcome_message(&JobOutcome::cancelled()), "Download cancelled");
        let failed = JobOutcome::failed(DownloadError::Network("reset".into()));
        assert!(outcome_message(&failed).starts_with("Download failed"));
    }

    #[test]
    fn test_tool_update_lines() {
        let line = tool_update(ToolKind::Engine, &ToolUpdate::Updated(PathBuf::from("/t/yt-dlp")));
        assert!(line.starts_with("yt-dlp"));
        assert!(line.ends_with("updated /t/yt-dlp"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(progress_bar(50.0), "[##########..........]");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MiB");
        assert_eq!(format_duration(Duration::from_secs(212)), "3:32");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
    }
}
