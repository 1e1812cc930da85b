use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

/// Durable destination for serialized audit batches.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append_pipelined(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()>;
}

/// Appends each batch to a redis list with a single pipelined round-trip.
#[derive(Clone)]
pub struct RedisSink {
    client: redis::Client,
    key_prefix: String,
}

impl RedisSink {
    pub fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).context("opening redis client for analytics")?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }
}

#[async_trait]
impl RecordSink for RedisSink {
    async fn append_pipelined(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let key = format!("{}{}", self.key_prefix, key);
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to redis")?;

        let count = values.len();
        let mut pipe = redis::pipe();
        for value in values {
            pipe.rpush(&key, value).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context("appending analytics batch")?;

        debug!(key = %key, count, "analytics batch appended");
        Ok(())
    }
}

/// Keeps every appended batch in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<(String, Vec<Vec<u8>>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(String, Vec<Vec<u8>>)> {
        self.batches.lock().clone()
    }

    pub fn record_count(&self) -> usize {
        self.batches.lock().iter().map(|(_, b)| b.len()).sum()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append_pipelined(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()> {
        if !values.is_empty() {
            self.batches.lock().push((key.to_string(), values));
        }
        Ok(())
    }
}
