//! Maps engine output after a failed run to a [`DownloadError`] kind.

use std::sync::OnceLock;

use regex::RegexSet;

use crate::domain::DownloadError;

const AUTH_PATTERNS: &[&str] = &[
    r"HTTP Error 403.*Forbidden",
    r"Sign in to confirm",
    r"only available to .*members",
    r"only available for",
    r"[Mm]embers[- ]only",
    r"[Mm]embership required",
    r"[Pp]rivate video",
    r"[Vv]ideo is private",
    r"[Vv]ideo unavailable.*(private|member|sign in)",
    r"[Cc]ookies.*(expired|are no longer valid)",
    r"[Aa]uthentication.*(failed|required)",
    r"[Rr]equires authentication",
    r"[Ll]ogin.*required",
];

const INVALID_URL_PATTERNS: &[&str] = &[
    r"Unsupported URL",
    r"is not a valid URL",
    r"[Ii]nvalid URL",
    r"Incomplete YouTube ID",
];

const FORMAT_PATTERNS: &[&str] = &[
    r"Requested format is not available",
    r"No video formats found",
];

const NETWORK_PATTERNS: &[&str] = &[
    r"HTTP Error (429|5\d\d)",
    r"[Tt]imed? ?out",
    r"[Cc]onnection (reset|refused|aborted)",
    r"[Tt]emporary failure in name resolution",
    r"[Nn]ame or service not known",
    r"getaddrinfo failed",
    r"Unable to download (webpage|API page)",
    r"IncompleteRead",
    r"[Nn]etwork is unreachable",
    r"SSL: ",
];

struct Classifier {
    auth: RegexSet,
    invalid_url: RegexSet,
    format: RegexSet,
    network: RegexSet,
}

fn classifier() -> Option<&'static Classifier> {
    static CLASSIFIER: OnceLock<Option<Classifier>> = OnceLock::new();
    CLASSIFIER
        .get_or_init(|| {
            Some(Classifier {
                auth: RegexSet::new(AUTH_PATTERNS).ok()?,
                invalid_url: RegexSet::new(INVALID_URL_PATTERNS).ok()?,
                format: RegexSet::new(FORMAT_PATTERNS).ok()?,
                network: RegexSet::new(NETWORK_PATTERNS).ok()?,
            })
        })
        .as_ref()
}

/// Classify a failed engine run from its exit code and trailing output.
pub fn classify_failure(code: Option<i32>, tail: &[String]) -> DownloadError {
    let message = summary(tail);

    let Some(c) = classifier() else {
        return DownloadError::Engine { code, message };
    };

    // error lines carry the cause; fall back to the whole tail
    let errors: Vec<&str> = tail
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("ERROR") || l.contains("error"))
        .collect();
    let haystack = if errors.is_empty() {
        tail.join("\n")
    } else {
        errors.join("\n")
    };

    if c.auth.is_match(&haystack) {
        DownloadError::Authentication(message)
    } else if c.invalid_url.is_match(&haystack) {
        DownloadError::InvalidInput(message)
    } else if c.format.is_match(&haystack) {
        DownloadError::FormatUnavailable(message)
    } else if c.network.is_match(&haystack) {
        DownloadError::Network(message)
    } else {
        DownloadError::Engine { code, message }
    }
}

/// Last `ERROR:` line, or the last non-empty line.
fn summary(tail: &[String]) -> String {
    tail.iter()
        .rev()
        .find(|l| l.starts_with("ERROR"))
        .or_else(|| tail.iter().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| "no output".to_string())
}
