//! Keeps the cache fresh: an initial reload at start, then at most one reload
//! per tick while change notifications keep arriving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::NotificationBus;
use super::notification::{handle_bus_message, NOTIFICATION_CHANNEL};
use super::PolicyCache;

/// A queued "please reload". The optional acknowledgement fires once the
/// reload that absorbed this request has finished.
#[derive(Debug, Default)]
pub struct ReloadRequest {
    ack: Option<oneshot::Sender<()>>,
}

impl ReloadRequest {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn with_ack() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { ack: Some(tx) }, rx)
    }

    fn complete(self) {
        if let Some(ack) = self.ack {
            let _ = ack.send(());
        }
    }
}

/// Producer side of the debounce queue.
#[derive(Debug, Clone)]
pub struct ReloadQueue {
    tx: mpsc::UnboundedSender<ReloadRequest>,
}

impl ReloadQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReloadRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the loader has shut down.
    pub fn enqueue(&self, request: ReloadRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    pub reload_interval_ms: u64,
    pub reconnect_backoff_secs: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            reload_interval_ms: 1000,
            reconnect_backoff_secs: 10,
        }
    }
}

impl LoaderOptions {
    fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms.max(1))
    }

    fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

pub struct Loader {
    cache: Arc<PolicyCache>,
    bus: Option<Arc<dyn NotificationBus>>,
    options: LoaderOptions,
    queue: ReloadQueue,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<ReloadRequest>>>,
    pending: Arc<Mutex<Vec<ReloadRequest>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Loader {
    pub fn new(
        cache: Arc<PolicyCache>,
        bus: Option<Arc<dyn NotificationBus>>,
        options: LoaderOptions,
    ) -> Self {
        let (queue, queue_rx) = ReloadQueue::channel();
        Self {
            cache,
            bus,
            options,
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            pending: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> ReloadQueue {
        self.queue.clone()
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    /// Reload once, then spawn the queue, ticker and bus listener tasks.
    /// Later calls do nothing.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        reload(&self.cache).await;

        let Some(queue_rx) = self.queue_rx.lock().take() else {
            return;
        };
        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(reload_queue_loop(
            queue_rx,
            self.pending.clone(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(reload_loop(
            self.cache.clone(),
            self.pending.clone(),
            self.options.reload_interval(),
            self.cancel.clone(),
        )));
        if let Some(bus) = self.bus.clone() {
            tasks.push(tokio::spawn(pubsub_loop(
                bus,
                NOTIFICATION_CHANNEL.to_string(),
                self.queue.clone(),
                self.options.reconnect_backoff(),
                self.cancel.clone(),
            )));
        }
        self.tasks.lock().extend(tasks);
        info!("cache loader started");
    }

    /// Reload immediately, bypassing the debounce queue.
    pub async fn reload(&self) -> Result<()> {
        self.cache.reload().await
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "loader task panicked");
            }
        }
        info!("cache loader stopped");
    }
}

async fn reload(cache: &PolicyCache) {
    match cache.reload().await {
        Ok(()) => debug!("refresh target storage succeeded"),
        Err(err) => error!(error = %err, "failed to refresh target storage"),
    }
}

fn take_pending(pending: &Mutex<Vec<ReloadRequest>>) -> Vec<ReloadRequest> {
    std::mem::take(&mut *pending.lock())
}

async fn reload_queue_loop(
    mut queue: mpsc::UnboundedReceiver<ReloadRequest>,
    pending: Arc<Mutex<Vec<ReloadRequest>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            request = queue.recv() => {
                let Some(request) = request else { return };
                pending.lock().push(request);
                info!("reload queued");
            }
        }
    }
}

async fn reload_loop(
    cache: Arc<PolicyCache>,
    pending: Arc<Mutex<Vec<ReloadRequest>>>,
    period: Duration,
    cancel: CancellationToken,
) {
    // start() has just reloaded, so the first check waits a full period
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let requests = take_pending(&pending);
                if requests.is_empty() {
                    continue;
                }
                let start = Instant::now();
                reload(&cache).await;
                let absorbed = requests.len();
                for request in requests {
                    request.complete();
                }
                info!(absorbed, elapsed = ?start.elapsed(), "reload: cycle completed");
            }
        }
    }
}

async fn pubsub_loop(
    bus: Arc<dyn NotificationBus>,
    channel: String,
    queue: ReloadQueue,
    backoff: Duration,
    cancel: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = listen(&*bus, &channel, &queue) => outcome,
        };
        match outcome {
            Ok(()) => warn!(channel = %channel, "notification subscription closed, reconnect in {:?}", backoff),
            Err(err) => error!(error = %err, "connection to notification bus failed, reconnect in {:?}", backoff),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => warn!(channel = %channel, "reconnecting to notification bus"),
        }
    }
}

async fn listen(bus: &dyn NotificationBus, channel: &str, queue: &ReloadQueue) -> Result<()> {
    let mut messages = bus.subscribe(channel).await?;
    info!(channel, "subscribed to change notifications");
    while let Some(message) = messages.next().await {
        handle_bus_message(&message, queue);
    }
    Ok(())
}
