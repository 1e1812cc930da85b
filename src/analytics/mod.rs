//! Asynchronous decision audit pipeline.
//!
//! Callers hand records to [`Analytics::record`], which never blocks. A pool
//! of workers drains the shared queue, serializes each record and appends
//! batches to a [`RecordSink`] once a worker buffer fills, the queue stays
//! idle for `flush_interval`, or a second has passed since the last flush.

pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use sink::{MemorySink, RecordSink, RedisSink};

/// Key every batch is appended under.
pub const ANALYTICS_KEY_NAME: &str = "iam-system-analytics";

/// Upper bound on how long a worker may hold buffered records.
const FORCED_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const PERMANENT_EXPIRY_DAYS: i64 = 365 * 100;

/// Audit projection of one access decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    pub timestamp: i64,
    pub username: String,
    pub effect: String,
    pub conclusion: String,
    pub request: String,
    pub policies: String,
    pub deciders: String,
    pub expire_at: DateTime<Utc>,
}

impl AnalyticsRecord {
    /// `expires_in_secs <= 0` keeps the record for 100 years.
    pub fn new(
        username: impl Into<String>,
        effect: impl Into<String>,
        conclusion: impl Into<String>,
        request: impl Into<String>,
        policies: impl Into<String>,
        deciders: impl Into<String>,
        expires_in_secs: i64,
    ) -> Self {
        let now = Utc::now();
        let ttl = if expires_in_secs > 0 {
            chrono::Duration::seconds(expires_in_secs)
        } else {
            chrono::Duration::days(PERMANENT_EXPIRY_DAYS)
        };

        Self {
            timestamp: now.timestamp(),
            username: username.into(),
            effect: effect.into(),
            conclusion: conclusion.into(),
            request: request.into(),
            policies: policies.into(),
            deciders: deciders.into(),
            expire_at: now + ttl,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsOptions {
    pub enable: bool,
    pub pool_size: usize,
    pub records_buffer_size: usize,
    pub flush_interval_ms: u64,
    pub storage_expiration_secs: i64,
}

impl Default for AnalyticsOptions {
    fn default() -> Self {
        Self {
            enable: true,
            pool_size: 50,
            records_buffer_size: 2000,
            flush_interval_ms: 200,
            storage_expiration_secs: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("analytics queue is full")]
    QueueFull,
}

pub struct Analytics {
    sink: Arc<dyn RecordSink>,
    pool_size: usize,
    worker_buffer_size: usize,
    flush_interval: Duration,
    sender: RwLock<Option<flume::Sender<AnalyticsRecord>>>,
    receiver: flume::Receiver<AnalyticsRecord>,
    should_stop: AtomicBool,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Analytics {
    pub fn new(options: &AnalyticsOptions, sink: Arc<dyn RecordSink>) -> Self {
        let pool_size = options.pool_size.max(1);
        let records_buffer_size = options.records_buffer_size.max(1);
        let worker_buffer_size = (records_buffer_size / pool_size).max(1);
        debug!(worker_buffer_size, "analytics pool worker buffer size");

        let (tx, rx) = flume::bounded(records_buffer_size);
        Self {
            sink,
            pool_size,
            worker_buffer_size,
            flush_interval: Duration::from_millis(options.flush_interval_ms.max(1)),
            sender: RwLock::new(Some(tx)),
            receiver: rx,
            should_stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.should_stop.load(Ordering::SeqCst) {
            warn!("analytics already stopped, not starting workers");
            return;
        }

        let mut workers = self.workers.lock();
        for id in 0..self.pool_size {
            workers.push(tokio::spawn(record_worker(
                id,
                self.receiver.clone(),
                self.sink.clone(),
                self.worker_buffer_size,
                self.flush_interval,
            )));
        }
        info!(pool_size = self.pool_size, "analytics workers started");
    }

    /// Close the queue and wait until every worker has flushed and exited.
    pub async fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        drop(self.sender.write().take());

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.await {
                error!(error = %err, "analytics worker panicked");
            }
        }
        info!("analytics workers stopped");
    }

    /// Enqueue a record without blocking. Once stopping has begun this is a
    /// silent no-op.
    pub fn record(&self, record: AnalyticsRecord) -> Result<(), RecordError> {
        if self.should_stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.sender.read();
        let Some(tx) = guard.as_ref() else {
            return Ok(());
        };
        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(RecordError::QueueFull),
            Err(flume::TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    pub fn queued(&self) -> usize {
        self.receiver.len()
    }
}

async fn record_worker(
    id: usize,
    records: flume::Receiver<AnalyticsRecord>,
    sink: Arc<dyn RecordSink>,
    buffer_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<Vec<u8>> = Vec::with_capacity(buffer_size);
    let mut last_sent = Instant::now();

    loop {
        let ready_to_send = match tokio::time::timeout(flush_interval, records.recv_async()).await {
            Ok(Ok(record)) => {
                match rmp_serde::to_vec_named(&record) {
                    Ok(encoded) => buffer.push(encoded),
                    Err(err) => error!(worker = id, error = %err, "encoding analytics record"),
                }
                buffer.len() >= buffer_size
            }
            // queue closed and drained
            Ok(Err(_)) => {
                flush(&*sink, &mut buffer, buffer_size).await;
                debug!(worker = id, "analytics worker exiting");
                return;
            }
            Err(_) => true,
        };

        if !buffer.is_empty() && (ready_to_send || last_sent.elapsed() >= FORCED_FLUSH_INTERVAL) {
            flush(&*sink, &mut buffer, buffer_size).await;
            last_sent = Instant::now();
        }
    }
}

async fn flush(sink: &dyn RecordSink, buffer: &mut Vec<Vec<u8>>, capacity: usize) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::replace(buffer, Vec::with_capacity(capacity));
    if let Err(err) = sink.append_pipelined(ANALYTICS_KEY_NAME, batch).await {
        error!(error = %err, "failed to flush analytics batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pool_size: usize, buffer: usize, flush_ms: u64) -> AnalyticsOptions {
        AnalyticsOptions {
            enable: true,
            pool_size,
            records_buffer_size: buffer,
            flush_interval_ms: flush_ms,
            storage_expiration_secs: 0,
        }
    }

    fn sample(n: usize) -> AnalyticsRecord {
        AnalyticsRecord::new(
            format!("user{n}"),
            "allow",
            "policies p1 allow access",
            format!(r#"{{"subject":"user{n}"}}"#),
            "[]",
            "[]",
            3600,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_when_worker_buffer_fills() {
        let sink = Arc::new(MemorySink::new());
        let analytics = Analytics::new(&options(1, 5, 60_000), sink.clone());
        analytics.start();

        let records: Vec<_> = (0..5).map(sample).collect();
        for r in &records {
            analytics.record(r.clone()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let (key, values) = &batches[0];
        assert_eq!(key, ANALYTICS_KEY_NAME);
        let decoded: Vec<AnalyticsRecord> = values
            .iter()
            .map(|v| rmp_serde::from_slice(v).unwrap())
            .collect();
        assert_eq!(decoded, records);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_flushes_partial_buffer() {
        let sink = Arc::new(MemorySink::new());
        let analytics = Analytics::new(&options(1, 100, 200), sink.clone());
        analytics.start();

        analytics.record(sample(1)).unwrap();
        analytics.record(sample(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.record_count(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.record_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_flush_under_steady_trickle() {
        let sink = Arc::new(MemorySink::new());
        // idle timeout never fires while a record arrives every 100ms
        let analytics = Analytics::new(&options(1, 1000, 500), sink.clone());
        analytics.start();

        for n in 0..15 {
            analytics.record(sample(n)).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(sink.record_count() >= 10);
    }

    #[tokio::test]
    async fn test_stop_flushes_remaining_records() {
        let sink = Arc::new(MemorySink::new());
        let analytics = Analytics::new(&options(4, 400, 60_000), sink.clone());
        analytics.start();

        for n in 0..7 {
            analytics.record(sample(n)).unwrap();
        }
        analytics.stop().await;
        assert_eq!(sink.record_count(), 7);
    }

    #[tokio::test]
    async fn test_record_after_stop_is_noop() {
        let sink = Arc::new(MemorySink::new());
        let analytics = Analytics::new(&options(2, 10, 100), sink.clone());
        analytics.start();
        analytics.stop().await;

        assert_eq!(analytics.record(sample(1)), Ok(()));
        assert_eq!(sink.record_count(), 0);
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let sink = Arc::new(MemorySink::new());
        let analytics = Analytics::new(&options(1, 2, 100), sink);

        assert!(analytics.record(sample(1)).is_ok());
        assert!(analytics.record(sample(2)).is_ok());
        assert_eq!(analytics.record(sample(3)), Err(RecordError::QueueFull));
        assert_eq!(analytics.queued(), 2);
    }

    #[test]
    fn test_record_expiry() {
        let permanent = AnalyticsRecord::new("u", "deny", "c", "{}", "[]", "[]", 0);
        assert!(permanent.expire_at - Utc::now() > chrono::Duration::days(365 * 99));

        let short = AnalyticsRecord::new("u", "deny", "c", "{}", "[]", "[]", 60);
        let ttl = short.expire_at - Utc::now();
        assert!(ttl <= chrono::Duration::seconds(60));
        assert!(ttl > chrono::Duration::seconds(50));
    }
}
