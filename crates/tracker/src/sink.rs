use std::net::IpAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use postgres_types::{IsNull, ToSql, Type, to_sql_checked};
use uuid::Uuid;

/// Ordered column list for the `sessions` table (§6, authoritative).
pub const SESSION_COLUMNS: &[&str] = &[
    "sid",
    "uid",
    "source",
    "start_time",
    "end_time",
    "total_bytes",
    "codec",
    "quality",
    "ip",
    "referer",
    "ua_browser",
    "ua_browser_version",
    "ua_device",
    "ua_os",
    "ua_is_desktop",
    "ua_is_mobile",
    "ua_is_tablet",
    "ua_is_tv",
    "ua_is_bot",
    "ua_is_android",
    "ua_is_ios",
    "ua_is_windows",
    "ua_is_linux",
    "ua_is_mac",
    "ua_is_openbsd",
    "ua_is_chromeos",
    "ua_is_chrome",
    "ua_is_firefox",
    "ua_is_safari",
    "ua_is_edge",
    "ua_is_opera",
    "ua_is_samsung_browser",
    "ua_is_vivaldi",
    "ua_is_yandex_browser",
];

pub const SESSIONS_TABLE: &str = "sessions";

/// Ordered column list for the `listeners_total` table (§6, authoritative).
pub const LISTENERS_COLUMNS: &[&str] = &["timestamp", "source", "mount", "count"];

pub const LISTENERS_TABLE: &str = "listeners_total";

/// A single field value in a bulk-copy row. Dynamically typed so the same
/// `BulkCopy` contract serves both `sessions` and `listeners_total` rows
/// without a method per table (§4.4).
#[derive(Debug, Clone)]
pub enum SinkValue {
    Uuid(Uuid),
    SmallInt(i16),
    BigInt(i64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Inet(Option<IpAddr>),
}

impl ToSql for SinkValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SinkValue::Uuid(v) => v.to_sql(ty, out),
            SinkValue::SmallInt(v) => v.to_sql(ty, out),
            SinkValue::BigInt(v) => v.to_sql(ty, out),
            SinkValue::Text(v) => v.to_sql(ty, out),
            SinkValue::Bool(v) => v.to_sql(ty, out),
            SinkValue::Timestamp(v) => v.to_sql(ty, out),
            SinkValue::Inet(Some(v)) => v.to_sql(ty, out),
            SinkValue::Inet(None) => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Dispatch happens dynamically in `to_sql` against the concrete
        // wrapped value, so every column type is "accepted" here; the
        // underlying `ToSql` impl still enforces the real type match.
        true
    }

    to_sql_checked!();
}

/// Errors the sink adapter can raise. Every variant maps to the
/// Flush-error taxonomy in §7: the affected batch is dropped and
/// `FlushErrorCount` is incremented, never retried in-process.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to acquire sink connection: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("bulk copy into {table} failed: {source}")]
    Copy {
        table: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("sink context cancelled before the operation completed")]
    Cancelled,
}

/// A batch of rows awaiting bulk copy, pulled one at a time by the adapter
/// so large batches don't require materializing the wire format up front
/// (§2.4: "a pull-based iterator").
pub struct RowBatch {
    rows: std::vec::IntoIter<Vec<SinkValue>>,
}

impl RowBatch {
    pub fn new(rows: Vec<Vec<SinkValue>>) -> Self {
        Self { rows: rows.into_iter() }
    }
}

impl Iterator for RowBatch {
    type Item = Vec<SinkValue>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// A single pooled connection to the durable sink. The tracker holds at
/// most one of these for its entire lifetime (§4.4, §9).
#[async_trait]
pub trait SinkConnection: Send {
    /// Stream `rows` into `table` using the given column order. Returns the
    /// number of rows written.
    async fn bulk_copy(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
        rows: RowBatch,
    ) -> Result<u64, SinkError>;

    /// Release the connection back to the adapter. Does not close it.
    async fn release(self: Box<Self>);
}

/// Thin contract over a bulk-copy capable relational client (§4.4). The
/// tracker depends only on this trait, never on a concrete database driver.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SinkConnection>, SinkError>;

    /// Torn down once, on tracker teardown.
    async fn close(&self);
}

pub mod postgres {
    use super::*;
    use futures_util::pin_mut;
    use tokio_postgres::NoTls;
    use tokio_postgres::binary_copy::BinaryCopyInWriter;

    /// `SinkAdapter` over `tokio_postgres`, the corpus's bulk-load-capable
    /// Postgres client (grounded in `sx9-cdn-data-fabric`'s use of
    /// `tokio-postgres` for the same job). Connects lazily on first
    /// `acquire()`; the tracker calls this exactly once at construction per
    /// §9 ("a pool of size one is the minimum and the maximum").
    pub struct PostgresSinkAdapter {
        connection_string: String,
    }

    impl PostgresSinkAdapter {
        pub fn new(connection_string: impl Into<String>) -> Self {
            Self { connection_string: connection_string.into() }
        }
    }

    #[async_trait]
    impl SinkAdapter for PostgresSinkAdapter {
        async fn acquire(&self) -> Result<Box<dyn SinkConnection>, SinkError> {
            let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
                .await
                .map_err(|e| SinkError::Connect(e.into()))?;

            // The driver future must be polled for the connection to make
            // progress; run it on its own task for the life of the client.
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("sink connection driver error: {e}");
                }
            });

            Ok(Box::new(PostgresConnection { client, driver: Some(handle) }))
        }

        async fn close(&self) {}
    }

    struct PostgresConnection {
        client: tokio_postgres::Client,
        driver: Option<tokio::task::JoinHandle<()>>,
    }

    #[async_trait]
    impl SinkConnection for PostgresConnection {
        async fn bulk_copy(
            &mut self,
            table: &'static str,
            columns: &'static [&'static str],
            rows: RowBatch,
        ) -> Result<u64, SinkError> {
            let column_list = columns.join(", ");
            let statement = format!("COPY {table} ({column_list}) FROM STDIN BINARY");

            let sink = self
                .client
                .copy_in(&statement)
                .await
                .map_err(|e| SinkError::Copy { table, source: e.into() })?;
            let types = column_types(table);
            let writer = BinaryCopyInWriter::new(sink, &types);
            pin_mut!(writer);

            let mut written = 0u64;
            for row in rows {
                let values: Vec<&(dyn ToSql + Sync)> =
                    row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                writer
                    .as_mut()
                    .write(&values)
                    .await
                    .map_err(|e| SinkError::Copy { table, source: e.into() })?;
                written += 1;
            }

            writer
                .finish()
                .await
                .map_err(|e| SinkError::Copy { table, source: e.into() })?;

            Ok(written)
        }

        async fn release(mut self: Box<Self>) {
            if let Some(handle) = self.driver.take() {
                handle.abort();
            }
        }
    }

    fn column_types(table: &str) -> Vec<Type> {
        if table == SESSIONS_TABLE {
            let mut types = vec![
                Type::UUID,
                Type::UUID,
                Type::INT2,
                Type::TIMESTAMPTZ,
                Type::TIMESTAMPTZ,
                Type::INT8,
                Type::INT2,
                Type::INT2,
                Type::INET,
                Type::VARCHAR,
                Type::VARCHAR,
                Type::VARCHAR,
                Type::VARCHAR,
                Type::VARCHAR,
            ];
            types.extend(std::iter::repeat_n(Type::BOOL, 20));
            types
        } else {
            vec![Type::TIMESTAMPTZ, Type::INT2, Type::VARCHAR, Type::INT8]
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory `SinkAdapter` for exercising the tracker without a real
    /// database, following the teacher's preference for testing through
    /// the public API rather than mocking internals.
    #[derive(Default, Clone)]
    pub struct FakeSink {
        pub sessions: Arc<Mutex<Vec<Vec<SinkValue>>>>,
        pub listeners: Arc<Mutex<Vec<Vec<SinkValue>>>>,
        pub fail_next: Arc<std::sync::atomic::AtomicBool>,
        pub hang: Arc<tokio::sync::Notify>,
        pub should_hang: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl SinkAdapter for FakeSink {
        async fn acquire(&self) -> Result<Box<dyn SinkConnection>, SinkError> {
            Ok(Box::new(self.clone()))
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl SinkConnection for FakeSink {
        async fn bulk_copy(
            &mut self,
            table: &'static str,
            _columns: &'static [&'static str],
            rows: RowBatch,
        ) -> Result<u64, SinkError> {
            use std::sync::atomic::Ordering;

            if self.should_hang.load(Ordering::SeqCst) {
                self.hang.notified().await;
            }

            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(SinkError::Copy {
                    table,
                    source: anyhow::anyhow!("simulated failure"),
                });
            }

            let rows: Vec<_> = rows.collect();
            let count = rows.len() as u64;
            if table == SESSIONS_TABLE {
                self.sessions.lock().unwrap().extend(rows);
            } else {
                self.listeners.lock().unwrap().extend(rows);
            }
            Ok(count)
        }

        async fn release(self: Box<Self>) {}
    }
}
