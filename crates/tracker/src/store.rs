use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use wavecast_protocol::Source;

use crate::session::Session;

/// The live session index plus the auxiliary Icecast client-id mapping.
/// Owned exclusively by the tracker's worker task — never touched from any
/// other execution context, so no synchronization primitive guards it
/// (§4.2). Invariant I5 is maintained here: an entry exists in
/// `icecast_index` iff a live Session for that client exists in `sessions`.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<Uuid, Session>,
    icecast_index: HashMap<i64, Uuid>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get_mut(&mut self, sid: &Uuid) -> Option<&mut Session> {
        self.sessions.get_mut(sid)
    }

    pub fn insert(&mut self, session: Session) {
        let sid = session.sid;
        if let (Source::Icecast, Some(icecast_id)) = (session.source, session.icecast_id) {
            self.icecast_index.insert(icecast_id, sid);
        }
        self.sessions.insert(sid, session);
    }

    /// Resolve an Icecast client id to its session UUID, minting a fresh one
    /// on first sighting per §3's identity-resolution rule.
    pub fn resolve_icecast(&mut self, icecast_id: i64) -> Uuid {
        *self
            .icecast_index
            .entry(icecast_id)
            .or_insert_with(Uuid::new_v4)
    }

    fn remove(&mut self, sid: &Uuid) -> Option<Session> {
        let session = self.sessions.remove(sid)?;
        if let Some(icecast_id) = session.icecast_id {
            self.icecast_index.remove(&icecast_id);
        }
        Some(session)
    }

    /// Walk the store once, extracting every Session past its idle
    /// threshold (§4.3 Reap). HLS sessions expire on wall-clock idleness;
    /// Icecast sessions expire as soon as a second event has arrived (the
    /// callback is a two-event start/stop shape) or past the fail-safe
    /// upper bound, whichever comes first.
    pub fn reap_expired(
        &mut self,
        now: DateTime<Utc>,
        session_timeout: Duration,
        icecast_session_timeout: Duration,
    ) -> Vec<Session> {
        let expired: Vec<Uuid> = self
            .sessions
            .values()
            .filter(|s| Self::is_expired(s, now, session_timeout, icecast_session_timeout))
            .map(|s| s.sid)
            .collect();

        expired
            .into_iter()
            .filter_map(|sid| self.remove(&sid))
            .collect()
    }

    fn is_expired(
        session: &Session,
        now: DateTime<Utc>,
        session_timeout: Duration,
        icecast_session_timeout: Duration,
    ) -> bool {
        match session.source {
            Source::Icecast => {
                session.last_active > session.start
                    || now - session.last_active > icecast_session_timeout
            }
            _ => now - session.last_active > session_timeout,
        }
    }

    /// Per-mount listener counts for the sampling tick (§4.3 Sample). HLS
    /// counts are restricted to sessions active within `session_timeout`;
    /// Icecast counts are restricted to sessions that have not yet received
    /// a second event. This asymmetry mirrors the Icecast callback's
    /// two-event shape and is preserved intentionally (§9) rather than
    /// unified with the HLS window.
    pub fn sample(&self, now: DateTime<Utc>, session_timeout: Duration) -> SampleCounts {
        let mut hls = HashMap::new();
        let mut icecast = HashMap::new();

        for session in self.sessions.values() {
            match session.source {
                Source::Hls => {
                    if now - session.last_active <= session_timeout {
                        *hls.entry(session.mount.clone()).or_insert(0i64) += 1;
                    }
                }
                Source::Icecast => {
                    if session.last_active == session.start {
                        *icecast.entry(session.mount.clone()).or_insert(0i64) += 1;
                    }
                }
                Source::Unknown => {}
            }
        }

        SampleCounts { hls, icecast }
    }

    /// Drain every remaining Session, for use during shutdown (§4.3
    /// Shutdown). Clears the Icecast index in lock-step.
    pub fn drain_all(&mut self) -> Vec<Session> {
        self.icecast_index.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}

pub struct SampleCounts {
    pub hls: HashMap<String, i64>,
    pub icecast: HashMap<String, i64>,
}
