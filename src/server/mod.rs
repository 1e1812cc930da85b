//! Process wiring: components, HTTP adapter and ordered shutdown.

pub mod api;
pub mod config;
pub mod signal;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::analytics::sink::{RecordSink, RedisSink};
use crate::analytics::Analytics;
use crate::authorization::Authorizer;
use crate::security::cache_strategy::CacheStrategy;
use crate::store::bus::{NotificationBus, RedisBus};
use crate::store::http_store::HttpStore;
use crate::store::load::Loader;
use crate::store::{PolicyCache, PolicySecretStore};
use api::{create_router, AppState};
use config::Config;
use signal::{ShutdownCallback, ShutdownCoordinator};

const ANALYTICS_KEY_PREFIX: &str = "analytics-";

#[async_trait]
impl ShutdownCallback for Analytics {
    async fn on_shutdown(&self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}

#[async_trait]
impl ShutdownCallback for Loader {
    async fn on_shutdown(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}

/// Waits for the HTTP server to finish draining once the stop token fires.
#[derive(Default)]
struct HttpServerTask(Mutex<Option<JoinHandle<Result<()>>>>);

#[async_trait]
impl ShutdownCallback for HttpServerTask {
    async fn on_shutdown(&self) -> Result<()> {
        let Some(handle) = self.0.lock().take() else {
            return Ok(());
        };
        handle.await.context("joining HTTP server task")?
    }
}

/// Every long-lived component of one decision-plane instance.
pub struct DecisionPlane {
    pub cache: Arc<PolicyCache>,
    pub loader: Arc<Loader>,
    pub analytics: Option<Arc<Analytics>>,
    pub authorizer: Authorizer,
    pub strategy: CacheStrategy,
}

impl DecisionPlane {
    pub fn new(
        config: &Config,
        store: Arc<dyn PolicySecretStore>,
        bus: Option<Arc<dyn NotificationBus>>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let cache = Arc::new(PolicyCache::new(store));
        let loader = Arc::new(Loader::new(cache.clone(), bus, config.loader.clone()));

        let mut authorizer = Authorizer::new(cache.clone());
        let analytics = if config.analytics.enable {
            let analytics = Arc::new(Analytics::new(&config.analytics, sink));
            authorizer = authorizer
                .with_analytics(analytics.clone(), config.analytics.storage_expiration_secs);
            Some(analytics)
        } else {
            None
        };

        let strategy = CacheStrategy::from_cache(cache.clone()).with_audience(config.jwt.audience.clone());

        Self {
            cache,
            loader,
            analytics,
            authorizer,
            strategy,
        }
    }

    /// Load the first snapshot and spawn the background tasks.
    pub async fn start(&self) {
        self.loader.start().await;
        if let Some(analytics) = &self.analytics {
            analytics.start();
        }
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.cache.clone(),
            self.authorizer.clone(),
            self.strategy.clone(),
        ))
    }
}

pub async fn run(config: Config) -> Result<()> {
    info!(bind = %config.server.bind, management = %config.management.base_url, "authorization server starting");

    let store = HttpStore::new(
        config.management.base_url.clone(),
        config.management.token.clone(),
        config.management.timeout(),
    )?;
    let bus = RedisBus::new(&config.redis.url).context("creating notification bus")?;
    let sink = RedisSink::new(&config.redis.url, ANALYTICS_KEY_PREFIX).context("creating analytics sink")?;

    let plane = DecisionPlane::new(&config, Arc::new(store), Some(Arc::new(bus)), Arc::new(sink));

    // nothing is spawned until the port is ours
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!("HTTP server listening on {}", config.server.bind);

    let coordinator = ShutdownCoordinator::new();
    let server_task = Arc::new(HttpServerTask::default());
    coordinator.register("http server", server_task.clone());
    if let Some(analytics) = &plane.analytics {
        coordinator.register("analytics", analytics.clone());
    }
    coordinator.register("cache loader", plane.loader.clone());
    coordinator.arm();
    coordinator.install_os_signal_handler();

    plane.start().await;

    let app = create_router(plane.app_state());
    let stop = coordinator.stop_token();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
            .context("serving HTTP")
    });
    *server_task.0.lock() = Some(handle);

    coordinator.wait_terminated().await;
    info!("authorization server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_failure_returns_before_starting() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.server.bind = taken.local_addr().unwrap().to_string();
        // a management plane that would hang the initial reload if it ran
        config.management.base_url = "http://10.255.255.1:9".to_string();
        config.management.timeout_secs = 30;

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), run(config)).await;
        let err = result.expect("run returned promptly").unwrap_err();
        assert!(err.to_string().starts_with("binding "));
    }
}
