use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration as TokioDuration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wavecast_protocol::{Event, Source, TrackerConfig};

use crate::session::{Session, enrich};
use crate::sink::{
    LISTENERS_COLUMNS, LISTENERS_TABLE, RowBatch, SESSION_COLUMNS, SESSIONS_TABLE, SinkAdapter,
    SinkConnection, SinkValue, postgres::PostgresSinkAdapter,
};
use crate::store::SessionStore;
use crate::ua::UaParser;

/// Per-mount listener-count snapshots are taken once a minute, independent
/// of the reaper interval (§4.3). Not configurable — see §4.3.
const SAMPLING_INTERVAL: TokioDuration = TokioDuration::from_secs(60);

/// The tracker actor: accepts non-blocking enqueues from many request
/// handlers, owns the session store exclusively from a single worker task,
/// and performs durable writes through the sink adapter (§2, §4.3).
pub struct Tracker {
    submit_tx: Mutex<Option<mpsc::Sender<Event>>>,
    closed: AtomicBool,
    shutdown_started: AtomicBool,
    dropped: Arc<AtomicU64>,
    flush_errors: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Tracker {
    /// Build a tracker from configuration. When `connection_string` is
    /// absent or empty, the tracker is constructed in disabled mode: no
    /// worker is spawned and every `submit` is a no-op drop. Otherwise the
    /// sink connection is acquired synchronously so an unreachable sink is
    /// a fatal startup error, per §7 ("fatal errors are reserved for
    /// startup... and propagate to the caller of the constructor").
    pub async fn connect(config: TrackerConfig) -> anyhow::Result<Self> {
        match config.connection_string.as_deref() {
            Some(conn) if !conn.trim().is_empty() => {
                let adapter: Arc<dyn SinkAdapter> =
                    Arc::new(PostgresSinkAdapter::new(conn.to_string()));
                Self::with_sink(config, adapter).await
            }
            _ => Ok(Self::disabled()),
        }
    }

    /// Construct against an arbitrary sink adapter (used in tests with an
    /// in-memory fake, and by `connect` for the Postgres adapter).
    pub async fn with_sink(config: TrackerConfig, sink: Arc<dyn SinkAdapter>) -> anyhow::Result<Self> {
        let connection = sink
            .acquire()
            .await
            .map_err(|e| anyhow::anyhow!("failed to acquire sink connection: {e}"))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let flush_errors = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let worker = Worker {
            rx,
            store: SessionStore::new(),
            ua_parser: UaParser::new(),
            session_timeout: chrono::Duration::seconds(config.session_timeout_secs as i64),
            icecast_timeout: chrono::Duration::seconds(config.icecast_session_timeout_secs as i64),
            connection: Some(connection),
            sink: Some(sink),
            flush_errors: Arc::clone(&flush_errors),
            cancel: cancel.clone(),
        };

        let reaper_interval = TokioDuration::from_secs(config.reaper_interval_secs.max(1));
        let handle = tokio::spawn(worker.run(reaper_interval));

        Ok(Self {
            submit_tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            dropped,
            flush_errors,
            worker: Mutex::new(Some(handle)),
            cancel,
        })
    }

    fn disabled() -> Self {
        Self {
            submit_tx: Mutex::new(None),
            closed: AtomicBool::new(true),
            shutdown_started: AtomicBool::new(false),
            dropped: Arc::new(AtomicU64::new(0)),
            flush_errors: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Non-blocking enqueue. Returns `true` if queued, `false` (and
    /// increments the dropped-event counter) if the ingress is full, closed,
    /// or the tracker is disabled. Never blocks, never fails otherwise; safe
    /// for concurrent use from many request handlers (§4.3, §5).
    pub fn submit(&self, event: Event) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let Ok(guard) = self.submit_tx.try_lock() else {
            // Another task is mid-shutdown, swapping the sender out.
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match guard.as_ref() {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flush_error_count(&self) -> u64 {
        self.flush_errors.load(Ordering::Relaxed)
    }

    /// Idempotent graceful shutdown. Closes the ingress, waits for the
    /// worker to drain queued events and flush all remaining sessions, then
    /// releases the sink. If `deadline` elapses first, cancels the sink
    /// context to unblock a stuck bulk copy and still waits for the worker
    /// to exit before returning (§4.3, §5).
    pub async fn shutdown(&self, deadline: TokioDuration) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);

        // Drop our side of the channel so the worker's `recv()` returns
        // `None` once the backlog drains, rather than blocking forever.
        self.submit_tx.lock().await.take();

        let Some(mut handle) = self.worker.lock().await.take() else {
            return; // disabled tracker: nothing to drain
        };

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("tracker worker task failed: {e}"),
            Err(_) => {
                tracing::warn!("shutdown deadline elapsed; cancelling in-flight sink operation");
                self.cancel.cancel();
                if let Err(e) = handle.await {
                    tracing::error!("tracker worker task failed after cancellation: {e}");
                }
            }
        }
    }
}

struct Worker {
    rx: mpsc::Receiver<Event>,
    store: SessionStore,
    ua_parser: UaParser,
    session_timeout: chrono::Duration,
    icecast_timeout: chrono::Duration,
    connection: Option<Box<dyn SinkConnection>>,
    sink: Option<Arc<dyn SinkAdapter>>,
    flush_errors: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self, reaper_interval: TokioDuration) {
        let mut reaper_tick = tokio::time::interval(reaper_interval);
        let mut sampler_tick = tokio::time::interval(SAMPLING_INTERVAL);
        reaper_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sampler_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(event) => self.ingest(event),
                        None => break,
                    }
                }
                _ = reaper_tick.tick() => {
                    self.reap().await;
                }
                _ = sampler_tick.tick() => {
                    self.sample().await;
                }
            }
        }

        self.final_flush().await;

        if let Some(conn) = self.connection.take() {
            conn.release().await;
        }
        if let Some(sink) = self.sink.take() {
            sink.close().await;
        }
    }

    /// Resolve identity and fold the event into an existing or new Session
    /// (§4.3 Ingest).
    fn ingest(&mut self, event: Event) {
        let sid = match event.source {
            Source::Icecast => self.store.resolve_icecast(event.icecast_id.unwrap_or(0)),
            _ => event.sid.parse().unwrap_or(Uuid::nil()),
        };

        if let Some(session) = self.store.get_mut(&sid) {
            session.ingest(&event);
            return;
        }

        let mut session = enrich(&event, &self.ua_parser);
        session.sid = sid;
        self.store.insert(session);
    }

    async fn reap(&mut self) {
        let now = Utc::now();
        let expired = self
            .store
            .reap_expired(now, self.session_timeout, self.icecast_timeout);
        if expired.is_empty() {
            return;
        }
        let batch_size = expired.len();
        let rows = expired.iter().map(session_row).collect();
        if let Err(e) = self
            .copy_batch(SESSIONS_TABLE, SESSION_COLUMNS, RowBatch::new(rows))
            .await
        {
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(batch_size, error = %e, "reaper flush failed; batch dropped");
        }
    }

    async fn sample(&mut self) {
        let now = Utc::now();
        let counts = self.store.sample(now, self.session_timeout);
        if counts.hls.is_empty() && counts.icecast.is_empty() {
            return;
        }

        let mut rows = Vec::with_capacity(counts.hls.len() + counts.icecast.len());
        for (mount, count) in &counts.hls {
            rows.push(listener_row(now, Source::Hls, mount, *count));
        }
        for (mount, count) in &counts.icecast {
            rows.push(listener_row(now, Source::Icecast, mount, *count));
        }

        let batch_size = rows.len();
        if let Err(e) = self
            .copy_batch(LISTENERS_TABLE, LISTENERS_COLUMNS, RowBatch::new(rows))
            .await
        {
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(batch_size, error = %e, "sampling flush failed; batch dropped");
        }
    }

    /// Final flush on shutdown: every remaining Session, regardless of idle
    /// state, with duration computed the same way as a reaper expiry.
    async fn final_flush(&mut self) {
        let remaining = self.store.drain_all();
        if remaining.is_empty() {
            return;
        }
        let batch_size = remaining.len();
        let rows = remaining.iter().map(session_row).collect();
        if let Err(e) = self
            .copy_batch(SESSIONS_TABLE, SESSION_COLUMNS, RowBatch::new(rows))
            .await
        {
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(batch_size, error = %e, "shutdown flush failed; sessions lost");
        }
    }

    async fn copy_batch(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
        rows: RowBatch,
    ) -> anyhow::Result<u64> {
        let Some(conn) = self.connection.as_mut() else {
            anyhow::bail!("sink not configured");
        };

        tokio::select! {
            result = conn.bulk_copy(table, columns, rows) => Ok(result?),
            _ = self.cancel.cancelled() => {
                anyhow::bail!("sink operation cancelled at shutdown deadline")
            }
        }
    }
}

fn session_row(session: &Session) -> Vec<SinkValue> {
    vec![
        SinkValue::Uuid(session.sid),
        SinkValue::Uuid(session.uid),
        SinkValue::SmallInt(session.source.into()),
        SinkValue::Timestamp(session.start),
        SinkValue::Timestamp(session.last_active),
        SinkValue::BigInt(session.total_bytes as i64),
        SinkValue::SmallInt(session.codec.into()),
        SinkValue::SmallInt(session.quality.into()),
        SinkValue::Inet(session.ip),
        SinkValue::Text(session.referer.clone()),
        SinkValue::Text(session.ua.browser.clone()),
        SinkValue::Text(session.ua.browser_version.clone()),
        SinkValue::Text(session.ua.device.clone()),
        SinkValue::Text(session.ua.os.clone()),
        SinkValue::Bool(session.ua.is_desktop),
        SinkValue::Bool(session.ua.is_mobile),
        SinkValue::Bool(session.ua.is_tablet),
        SinkValue::Bool(session.ua.is_tv),
        SinkValue::Bool(session.ua.is_bot),
        SinkValue::Bool(session.ua.is_android),
        SinkValue::Bool(session.ua.is_ios),
        SinkValue::Bool(session.ua.is_windows),
        SinkValue::Bool(session.ua.is_linux),
        SinkValue::Bool(session.ua.is_mac),
        SinkValue::Bool(session.ua.is_openbsd),
        SinkValue::Bool(session.ua.is_chromeos),
        SinkValue::Bool(session.ua.is_chrome),
        SinkValue::Bool(session.ua.is_firefox),
        SinkValue::Bool(session.ua.is_safari),
        SinkValue::Bool(session.ua.is_edge),
        SinkValue::Bool(session.ua.is_opera),
        SinkValue::Bool(session.ua.is_samsung_browser),
        SinkValue::Bool(session.ua.is_vivaldi),
        SinkValue::Bool(session.ua.is_yandex_browser),
    ]
}

fn listener_row(
    ts: chrono::DateTime<Utc>,
    source: Source,
    mount: &str,
    count: i64,
) -> Vec<SinkValue> {
    vec![
        SinkValue::Timestamp(ts),
        SinkValue::SmallInt(source.into()),
        SinkValue::Text(mount.to_string()),
        SinkValue::BigInt(count),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::fake::FakeSink;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn hls_event(sid: &str, uid: &str, path: &str, chunk_size: u64, time: chrono::DateTime<Utc>) -> Event {
        Event {
            time,
            path: path.to_string(),
            ip: "10.0.0.1:55555".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            referer: String::new(),
            sid: sid.to_string(),
            uid: uid.to_string(),
            icecast_id: None,
            mount: "radio1".to_string(),
            chunk_size,
            source: Source::Hls,
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            connection_string: Some("fake".to_string()),
            queue_capacity: 4,
            session_timeout_secs: 60,
            icecast_session_timeout_secs: 24 * 60 * 60,
            reaper_interval_secs: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_hls_session_two_segments_idle_expiry() {
        let fake = FakeSink::default();
        let tracker = Tracker::with_sink(config(), Arc::new(fake.clone())).await.unwrap();

        let t0 = Utc::now();
        assert!(tracker.submit(hls_event(
            "11111111-1111-1111-1111-111111111111",
            "22222222-2222-2222-2222-222222222222",
            "/radio1/mp3_hifi_1700000000_6.000_42.ts",
            1000,
            t0,
        )));
        tokio::time::advance(TokioDuration::from_secs(30)).await;
        assert!(tracker.submit(hls_event(
            "11111111-1111-1111-1111-111111111111",
            "22222222-2222-2222-2222-222222222222",
            "/radio1/mp3_hifi_1700000000_6.000_43.ts",
            2000,
            t0 + chrono::Duration::seconds(30),
        )));

        // let the worker drain the two submitted events before advancing time
        tokio::task::yield_now().await;

        tokio::time::advance(TokioDuration::from_secs(61)).await;
        tokio::time::advance(TokioDuration::from_millis(100)).await;
        tokio::task::yield_now().await;

        let rows = fake.sessions.lock().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        match (&row[0], &row[1], &row[5]) {
            (SinkValue::Uuid(sid), SinkValue::Uuid(uid), SinkValue::BigInt(total)) => {
                assert_eq!(sid.to_string(), "11111111-1111-1111-1111-111111111111");
                assert_eq!(uid.to_string(), "22222222-2222-2222-2222-222222222222");
                assert_eq!(*total, 3000);
            }
            _ => panic!("unexpected row shape"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_sid_coalesces_into_zero_uuid_bucket() {
        let fake = FakeSink::default();
        let tracker = Tracker::with_sink(config(), Arc::new(fake.clone())).await.unwrap();
        let t0 = Utc::now();

        tracker.submit(hls_event("not-a-uuid", "aaaa0000-0000-0000-0000-000000000000", "/r/mp3_lofi_1_1_1.ts", 10, t0));
        tracker.submit(hls_event("not-a-uuid", "bbbb0000-0000-0000-0000-000000000000", "/r/mp3_lofi_1_1_2.ts", 20, t0));
        tokio::task::yield_now().await;

        tokio::time::advance(TokioDuration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let rows = fake.sessions.lock().unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0][0] {
            SinkValue::Uuid(sid) => assert_eq!(*sid, Uuid::nil()),
            _ => panic!("expected sid column"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn icecast_mint_expire_mints_a_new_uuid_after_expiry() {
        let fake = FakeSink::default();
        let tracker = Tracker::with_sink(config(), Arc::new(fake.clone())).await.unwrap();
        let t0 = Utc::now();

        let start_event = Event {
            time: t0,
            path: String::new(),
            ip: "10.0.0.2".to_string(),
            user_agent: "icecast-client/1.0".to_string(),
            referer: String::new(),
            sid: String::new(),
            uid: String::new(),
            icecast_id: Some(7),
            mount: "m".to_string(),
            chunk_size: 0,
            source: Source::Icecast,
        };
        tracker.submit(start_event.clone());
        tokio::task::yield_now().await;

        let mut second_event = start_event.clone();
        second_event.time = t0 + chrono::Duration::seconds(10);
        tracker.submit(second_event);
        tokio::task::yield_now().await;

        tokio::time::advance(TokioDuration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert_eq!(fake.sessions.lock().unwrap().len(), 1);

        let mut later_event = start_event;
        later_event.time = t0 + chrono::Duration::hours(1);
        tracker.submit(later_event);
        tokio::task::yield_now().await;

        tokio::time::advance(TokioDuration::from_secs(11)).await;
        tokio::task::yield_now().await;

        let rows = fake.sessions.lock().unwrap();
        assert_eq!(rows.len(), 2);
        let (SinkValue::Uuid(first), SinkValue::Uuid(second)) = (&rows[0][0], &rows[1][0]) else {
            panic!("expected uuid columns");
        };
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn overflow_under_burst_drops_past_capacity() {
        let fake = FakeSink::default();
        let mut cfg = config();
        cfg.queue_capacity = 4;
        let tracker = Tracker::with_sink(cfg, Arc::new(fake)).await.unwrap();

        // No `.await` yet in this task, so on tokio's single-threaded test
        // runtime the worker task has not been polled and cannot drain —
        // this reproduces "block the worker" without any special hook.
        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..10 {
            let event = hls_event(
                "11111111-1111-1111-1111-111111111111",
                "22222222-2222-2222-2222-222222222222",
                "/r/mp3_lofi_1_1_1.ts",
                1,
                Utc::now(),
            );
            let mut event = event;
            event.mount = format!("m{i}");
            if tracker.submit(event) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        assert_eq!(accepted, 4);
        assert_eq!(rejected, 6);
        assert_eq!(tracker.dropped_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_snapshot_counts_listeners_per_mount() {
        let fake = FakeSink::default();
        let tracker = Tracker::with_sink(config(), Arc::new(fake.clone())).await.unwrap();
        let t0 = Utc::now();

        for i in 0..3 {
            let mut event = hls_event(
                &format!("11111111-1111-1111-1111-00000000000{i}"),
                "22222222-2222-2222-2222-222222222222",
                "/a/mp3_lofi_1_1_1.ts",
                1,
                t0,
            );
            event.mount = "a".to_string();
            tracker.submit(event);
        }
        let mut event_b = hls_event(
            "33333333-3333-3333-3333-333333333333",
            "22222222-2222-2222-2222-222222222222",
            "/b/mp3_lofi_1_1_1.ts",
            1,
            t0,
        );
        event_b.mount = "b".to_string();
        tracker.submit(event_b);

        tokio::task::yield_now().await;
        tokio::time::advance(TokioDuration::from_secs(60)).await;
        tokio::task::yield_now().await;

        let rows = fake.listeners.lock().unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_deadline_elapses_and_increments_flush_errors() {
        let fake = FakeSink::default();
        fake.should_hang.store(true, AtomicOrdering::SeqCst);
        let tracker = Tracker::with_sink(config(), Arc::new(fake.clone())).await.unwrap();

        for i in 0..5u32 {
            let mut event = hls_event(
                &format!("44444444-4444-4444-4444-44444444444{}", i % 10),
                "22222222-2222-2222-2222-222222222222",
                "/r/mp3_lofi_1_1_1.ts",
                1,
                Utc::now(),
            );
            event.mount = format!("m{i}");
            tracker.submit(event);
        }
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        tracker.shutdown(TokioDuration::from_millis(100)).await;
        assert!(started.elapsed() < TokioDuration::from_secs(2));
        assert!(tracker.flush_error_count() >= 1);
    }

    #[tokio::test]
    async fn disabled_tracker_always_drops() {
        let tracker = Tracker::connect(TrackerConfig {
            connection_string: None,
            ..config()
        }).await.unwrap();

        assert!(!tracker.submit(hls_event(
            "11111111-1111-1111-1111-111111111111",
            "22222222-2222-2222-2222-222222222222",
            "/r/mp3_lofi_1_1_1.ts",
            1,
            Utc::now(),
        )));
        assert_eq!(tracker.dropped_count(), 1);

        tracker.shutdown(TokioDuration::from_millis(50)).await;
    }
}
