//! Interpretation of download-engine output lines.

use std::path::PathBuf;

use crate::domain::Phase;

/// Prefix of the structured progress template passed to the engine.
pub const PROGRESS_MARKER: &str = "[progress]";

/// Template producing `[progress] status|downloaded|total|estimate|percent|speed`.
pub const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress._percent_str)s|%(progress._speed_str)s";

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub percent: Option<f32>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Video,
    Audio,
    Unknown,
}

/// Tracks the engine's phase and output file across lines of one attempt.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    destination: Option<PathBuf>,
    merged: Option<PathBuf>,
    phase: Option<Phase>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Final media file reported by the engine so far.
    pub fn output_path(&self) -> Option<PathBuf> {
        self.merged.clone().or_else(|| self.destination.clone())
    }

    pub fn feed(&mut self, raw: &str) -> Option<ProgressUpdate> {
        let line = strip_ansi(raw);
        let line = line.trim();

        if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
            return self.structured(rest.trim());
        }

        if let Some(rest) = line.strip_prefix("[download]") {
            return self.download_line(rest.trim());
        }

        if let Some(rest) = line.strip_prefix("[Merger]") {
            if let Some(path) = quoted_after(rest, "Merging formats into") {
                self.merged = Some(PathBuf::from(path));
            }
            return Some(self.phase_update(Phase::Muxing, "Merging video and audio"));
        }

        if line.starts_with("[EmbedThumbnail]") || line.starts_with("[Metadata]") {
            return Some(self.phase_update(Phase::Embedding, "Embedding metadata"));
        }

        None
    }

    fn structured(&mut self, rest: &str) -> Option<ProgressUpdate> {
        let fields: Vec<&str> = rest.split('|').map(str::trim).collect();
        if fields.len() < 6 {
            return None;
        }

        let downloaded = parse_count(fields[1]);
        let total = parse_count(fields[2]).or_else(|| parse_count(fields[3]));
        let percent = parse_percent(fields[4]).or_else(|| match (downloaded, total) {
            (Some(d), Some(t)) if t > 0 => Some((d as f64 / t as f64 * 100.0) as f32),
            _ => None,
        });
        let speed = (fields[5] != "NA" && !fields[5].is_empty()).then_some(fields[5]);

        Some(self.download_progress(percent, downloaded, total, speed))
    }

    fn download_line(&mut self, rest: &str) -> Option<ProgressUpdate> {
        if let Some(path) = rest.strip_prefix("Destination:") {
            self.destination = Some(PathBuf::from(path.trim()));
            let message = match self.stream_kind() {
                StreamKind::Audio => "Fetching audio stream",
                _ => "Fetching video stream",
            };
            return Some(self.phase_update(Phase::Downloading, message));
        }

        if let Some(path) = rest.strip_suffix("has already been downloaded") {
            self.destination = Some(PathBuf::from(path.trim()));
            return Some(self.download_progress(Some(100.0), None, None, None));
        }

        // classic `45.2% of ~10.00MiB at 1.20MiB/s ETA 00:05`
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let idx = tokens.iter().position(|t| t.ends_with('%'))?;
        let percent = parse_percent(tokens[idx])?;

        let mut total = None;
        let mut speed = None;
        let mut iter = tokens[idx + 1..].iter();
        while let Some(token) = iter.next() {
            match *token {
                "of" => total = iter.next().and_then(|s| parse_size(s)),
                "at" => speed = iter.next().copied(),
                _ => {}
            }
        }
        let downloaded = total.map(|t| (t as f64 * f64::from(percent) / 100.0) as u64);

        Some(self.download_progress(Some(percent), downloaded, total, speed))
    }

    fn download_progress(
        &mut self,
        percent: Option<f32>,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
        speed: Option<&str>,
    ) -> ProgressUpdate {
        self.phase = Some(Phase::Downloading);
        let label = match self.stream_kind() {
            StreamKind::Video => "Downloading video",
            StreamKind::Audio => "Downloading audio",
            StreamKind::Unknown => "Downloading",
        };
        let mut message = match percent {
            Some(p) => format!("{label}: {p:.1}%"),
            None => label.to_string(),
        };
        if let Some(speed) = speed {
            message.push_str(&format!(" at {speed}"));
        }

        ProgressUpdate {
            phase: Phase::Downloading,
            percent,
            downloaded_bytes,
            total_bytes,
            message,
        }
    }

    fn phase_update(&mut self, phase: Phase, message: &str) -> ProgressUpdate {
        self.phase = Some(phase);
        ProgressUpdate {
            phase,
            percent: None,
            downloaded_bytes: None,
            total_bytes: None,
            message: message.to_string(),
        }
    }

    fn stream_kind(&self) -> StreamKind {
        let Some(ext) = self
            .destination
            .as_ref()
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
        else {
            return StreamKind::Unknown;
        };

        match ext.to_ascii_lowercase().as_str() {
            "m4a" | "aac" | "opus" | "mp3" | "ogg" => StreamKind::Audio,
            "mp4" | "webm" | "mkv" => StreamKind::Video,
            _ => StreamKind::Unknown,
        }
    }
}

fn quoted_after<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.trim().strip_prefix(prefix)?.trim();
    Some(rest.trim_matches('"'))
}

fn parse_count(field: &str) -> Option<u64> {
    // the engine prints floats for estimates
    field.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64)
}

fn parse_percent(field: &str) -> Option<f32> {
    let value = field.trim().trim_end_matches('%').trim().parse::<f32>().ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}

/// `10.00MiB`, `~1.5GiB`, `512KiB`, `900B`
fn parse_size(token: &str) -> Option<u64> {
    let token = token.trim_start_matches('~');
    let split = token.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = token.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" => 1000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        _ => return None,
    };

    Some((value * multiplier) as u64)
}

fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // skip `ESC [ ... <letter>`
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
