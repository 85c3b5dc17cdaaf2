use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use wavecast_protocol::{Event, Source};

use crate::ua::UaParser;

/// Audio codec parsed from the first token of an HLS chunk filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Aac,
    Mp3,
    Ac3,
    Eac3,
    DolbyAtmos,
    Flac,
    Opus,
    Speex,
    Vorbis,
    Unknown,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Aac => "aac",
            Codec::Mp3 => "mp3",
            Codec::Ac3 => "ac3",
            Codec::Eac3 => "eac3",
            Codec::DolbyAtmos => "dolby_atmos",
            Codec::Flac => "flac",
            Codec::Opus => "opus",
            Codec::Speex => "speex",
            Codec::Vorbis => "vorbis",
            Codec::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "aac" => Codec::Aac,
            "mp3" => Codec::Mp3,
            "ac3" => Codec::Ac3,
            "eac3" => Codec::Eac3,
            "dolby_atmos" => Codec::DolbyAtmos,
            "flac" => Codec::Flac,
            "opus" => Codec::Opus,
            "speex" => Codec::Speex,
            "vorbis" => Codec::Vorbis,
            _ => Codec::Unknown,
        })
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Codec> for i16 {
    fn from(value: Codec) -> Self {
        match value {
            Codec::Aac => 0,
            Codec::Mp3 => 1,
            Codec::Ac3 => 2,
            Codec::Eac3 => 3,
            Codec::DolbyAtmos => 4,
            Codec::Flac => 5,
            Codec::Opus => 6,
            Codec::Speex => 7,
            Codec::Vorbis => 8,
            Codec::Unknown => 255,
        }
    }
}

/// Stream quality tier, the second token of an HLS chunk filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    Lofi,
    Midfi,
    Hifi,
    Unknown,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Lofi => "lofi",
            Quality::Midfi => "midfi",
            Quality::Hifi => "hifi",
            Quality::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "lofi" => Quality::Lofi,
            "midfi" => Quality::Midfi,
            "hifi" => Quality::Hifi,
            _ => Quality::Unknown,
        })
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Quality> for i16 {
    fn from(value: Quality) -> Self {
        match value {
            Quality::Lofi => 0,
            Quality::Midfi => 1,
            Quality::Hifi => 2,
            Quality::Unknown => 255,
        }
    }
}

/// User-agent enrichment captured once at Session creation. Empty UA input
/// produces every field at its zero value (empty string / `false`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UaFields {
    pub browser: String,
    pub browser_version: String,
    pub device: String,
    pub os: String,
    pub is_desktop: bool,
    pub is_mobile: bool,
    pub is_tablet: bool,
    pub is_tv: bool,
    pub is_bot: bool,
    pub is_android: bool,
    pub is_ios: bool,
    pub is_windows: bool,
    pub is_linux: bool,
    pub is_mac: bool,
    pub is_openbsd: bool,
    pub is_chromeos: bool,
    pub is_chrome: bool,
    pub is_firefox: bool,
    pub is_safari: bool,
    pub is_edge: bool,
    pub is_opera: bool,
    pub is_samsung_browser: bool,
    pub is_vivaldi: bool,
    pub is_yandex_browser: bool,
}

/// The in-memory aggregate of all segment deliveries attributed to one
/// listener over a contiguous active period. Provenance fields (everything
/// but `last_active`/`total_bytes`) are set once at creation and never
/// mutated afterward (invariant I4).
#[derive(Debug, Clone)]
pub struct Session {
    pub sid: Uuid,
    pub uid: Uuid,
    pub source: Source,
    pub mount: String,
    pub start: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub total_bytes: u64,
    pub codec: Codec,
    pub quality: Quality,
    pub ip: Option<IpAddr>,
    pub referer: String,
    pub ua: UaFields,
    /// Back-pointer to the Icecast client id that resolved to this session,
    /// so the tracker can remove the id→uuid mapping in lock-step on reap
    /// without a reverse scan (§9).
    pub icecast_id: Option<i64>,
}

impl Session {
    /// Fold one more event's byte contribution into this session.
    /// Never touches provenance fields.
    pub fn ingest(&mut self, event: &Event) {
        self.last_active = event.time;
        self.total_bytes += event.chunk_size;
    }

    /// Duration as computed at flush time: `last_active - start`.
    pub fn duration(&self) -> chrono::Duration {
        self.last_active - self.start
    }
}

/// Parse the `<codec>_<quality>_<timestamp>_<duration>_<sequence>.<ext>`
/// chunk-filename grammar. Only the first two underscore-separated tokens
/// are meaningful at the session level; fewer than five tokens, or tokens
/// that don't match a known codec/quality, degrade to `Unknown` rather than
/// failing — the filename grammar's five-token shape is documented, not
/// contractual (§9).
pub fn parse_chunk_basename(path: &str) -> (Codec, Quality) {
    let basename = path.rsplit('/').next().unwrap_or("");
    if basename.is_empty() {
        return (Codec::Unknown, Quality::Unknown);
    }
    let stem = basename.rsplit_once('.').map(|(s, _)| s).unwrap_or(basename);
    let mut tokens = stem.split('_');
    let codec = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(Codec::Unknown);
    let quality = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(Quality::Unknown);
    (codec, quality)
}

/// Parse an IP, possibly with a trailing `:port`, by splitting on the first
/// `:` and keeping the left side.
///
/// Known defect (§9, preserved intentionally): this corrupts IPv6 literal
/// addresses, which contain `:` as part of the address itself. Fixing this
/// requires bracket-aware parsing (`[::1]:443`) and is out of scope for this
/// pass — flagged here rather than silently patched.
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    if raw.is_empty() {
        return None;
    }
    let host = raw.split_once(':').map(|(h, _)| h).unwrap_or(raw);
    host.parse().ok()
}

fn parse_uuid_or_zero(raw: &str) -> Uuid {
    raw.parse().unwrap_or(Uuid::nil())
}

/// Pure transformation from a submitted event into a freshly-seeded Session.
/// Called exactly once, at Session creation — never on subsequent events for
/// an existing session (§4.1, §9: the UA parser is consulted only here).
pub fn enrich(event: &Event, ua_parser: &UaParser) -> Session {
    let sid = parse_uuid_or_zero(&event.sid);
    let uid = parse_uuid_or_zero(&event.uid);
    let ip = parse_ip(&event.ip);
    let ua = if event.user_agent.is_empty() {
        UaFields::default()
    } else {
        ua_parser.classify(&event.user_agent)
    };
    let (codec, quality) = parse_chunk_basename(&event.path);

    Session {
        sid,
        uid,
        source: event.source,
        mount: event.mount.clone(),
        start: event.time,
        last_active: event.time,
        total_bytes: event.chunk_size,
        codec,
        quality,
        ip,
        referer: event.referer.clone(),
        ua,
        icecast_id: event.icecast_id,
    }
}
