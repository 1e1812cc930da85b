//! Pub/sub transport for change notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::debug;

/// Named-channel publish/subscribe with at-most-once delivery.
///
/// A subscription stream ending means the connection dropped; callers are
/// expected to subscribe again.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, channel: &str, message: String) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("opening redis client for notifications")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationBus for RedisBus {
    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to redis")?;
        let receivers: i64 = conn
            .publish(channel, message)
            .await
            .context("publishing notification")?;
        debug!(channel, receivers, "notification published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("connecting to redis pubsub")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("subscribing to {channel}"))?;

        let messages = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(messages.boxed())
    }
}

/// In-process bus built on broadcast channels.
#[derive(Debug)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable, publish and subscribe fail like a downed server.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End every open subscription stream, as a dropped connection would.
    pub fn disconnect_all(&self) {
        self.channels.lock().clear();
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("notification bus is down"))
        }
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        self.ensure_available()?;
        if let Some(tx) = self.channels.lock().get(channel) {
            // no subscribers is not an error for pub/sub
            let _ = tx.send(message);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        self.ensure_available()?;
        let rx = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe();

        let messages = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}
