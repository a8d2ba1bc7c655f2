//! Format expression policy.
//!
//! A supported height `h` produces
//! `bestvideo[height<=h][ext=mp4]+bestaudio[ext=m4a]/best[height<=h][ext=mp4]/best`:
//! separate mp4 video and m4a audio capped at `h`, else a single muxed mp4
//! capped at `h`, else whatever is best. Unsupported qualities use
//! [`FALLBACK_FORMAT`].

use crate::domain::Quality;

pub const FALLBACK_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best";

pub fn format_expression(quality: Quality) -> String {
    match quality {
        Quality::Height(h) => format!(
            "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[height<={h}][ext=mp4]/best"
        ),
        Quality::Best => FALLBACK_FORMAT.to_string(),
    }
}
