use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the release client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub user_agent: String,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("yt-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Parsed `SHA2-256SUMS` style checksum list.
///
/// Each line is `<hex digest> <asset>`; the asset may carry a leading `*`
/// (binary mode marker).
#[derive(Debug, Clone, Default)]
pub struct ChecksumManifest {
    entries: Vec<(String, String)>,
}

impl ChecksumManifest {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let digest = parts.next()?;
                let asset = parts.next()?.trim_start_matches('*');
                let is_hex = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
                is_hex.then(|| (digest.to_ascii_lowercase(), asset.to_string()))
            })
            .collect();

        Self { entries }
    }

    pub fn digest_for(&self, asset: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, name)| name == asset)
            .map(|(digest, _)| digest.as_str())
    }
}

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
