use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a delivery event: an HLS segment GET or an Icecast auth callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Hls,
    Icecast,
    Unknown,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Hls => "hls",
            Source::Icecast => "icecast",
            Source::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Source {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hls" => Ok(Source::Hls),
            "icecast" => Ok(Source::Icecast),
            _ => Ok(Source::Unknown),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric encoding used on the wire into the `sessions`/`listeners_total` tables.
/// Must match the authoritative enum mapping in the sink schema.
impl From<Source> for i16 {
    fn from(value: Source) -> Self {
        match value {
            Source::Hls => 0,
            Source::Icecast => 1,
            Source::Unknown => 255,
        }
    }
}

/// A single segment delivery (HLS) or auth callback (Icecast), as submitted
/// by a request handler. Produced by the out-of-scope ingress handlers in
/// `wavecast-server`; consumed only by `wavecast_tracker::Tracker::submit`.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: DateTime<Utc>,
    /// Absolute segment path. Empty for Icecast callbacks.
    pub path: String,
    /// Remote address, possibly with a trailing `:port`.
    pub ip: String,
    pub user_agent: String,
    pub referer: String,
    /// HLS session identifier, taken from a query string or cookie. May be
    /// empty or not a valid UUID.
    pub sid: String,
    /// User identifier, same provenance/looseness as `sid`.
    pub uid: String,
    /// Icecast client identifier. `Some` only when `source == Source::Icecast`.
    pub icecast_id: Option<i64>,
    pub mount: String,
    /// Bytes delivered by this event. Zero for Icecast callbacks.
    pub chunk_size: u64,
    pub source: Source,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_string_form() {
        for s in [Source::Hls, Source::Icecast, Source::Unknown] {
            let text = s.to_string();
            let parsed: Source = text.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn unrecognized_token_parses_to_unknown() {
        let parsed: Source = "bogus".parse().unwrap();
        assert_eq!(parsed, Source::Unknown);
    }

    #[test]
    fn numeric_encoding_matches_schema() {
        assert_eq!(i16::from(Source::Hls), 0);
        assert_eq!(i16::from(Source::Icecast), 1);
        assert_eq!(i16::from(Source::Unknown), 255);
    }
}
