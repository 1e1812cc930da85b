//! Process shutdown coordination.
//!
//! The first SIGINT/SIGTERM (or [`ShutdownCoordinator::request_shutdown`])
//! cancels the stop token and runs the registered callbacks in order. A second
//! signal while they run exits the process with status 1.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

static OS_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

#[async_trait]
pub trait ShutdownCallback: Send + Sync {
    async fn on_shutdown(&self) -> Result<()>;
}

/// Adapts an async closure into a [`ShutdownCallback`].
pub struct ShutdownFn<F>(pub F);

#[async_trait]
impl<F, Fut> ShutdownCallback for ShutdownFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn on_shutdown(&self) -> Result<()> {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Armed,
    Draining,
    Terminated,
}

type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub struct ShutdownCoordinator {
    state: Mutex<CoordinatorState>,
    callbacks: Mutex<Vec<(String, Arc<dyn ShutdownCallback>)>>,
    signals_tx: mpsc::Sender<ShutdownSignal>,
    signals_rx: Mutex<Option<mpsc::Receiver<ShutdownSignal>>>,
    stop: CancellationToken,
    terminated: CancellationToken,
    force_exit: ExitHook,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Self::with_exit_hook(Arc::new(|code| std::process::exit(code)))
    }

    /// Replace `std::process::exit` for the forced path.
    pub fn with_exit_hook(force_exit: ExitHook) -> Arc<Self> {
        // two slots: one graceful signal plus the forcing one
        let (tx, rx) = mpsc::channel(2);
        Arc::new(Self {
            state: Mutex::new(CoordinatorState::Idle),
            callbacks: Mutex::new(Vec::new()),
            signals_tx: tx,
            signals_rx: Mutex::new(Some(rx)),
            stop: CancellationToken::new(),
            terminated: CancellationToken::new(),
            force_exit,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    /// Callbacks run in registration order.
    pub fn register(&self, name: impl Into<String>, callback: Arc<dyn ShutdownCallback>) {
        self.callbacks.lock().push((name.into(), callback));
    }

    /// Cancelled exactly once, when draining begins.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn wait_terminated(&self) {
        self.terminated.cancelled().await
    }

    /// Start reacting to shutdown signals.
    ///
    /// # Panics
    /// When called more than once on the same coordinator.
    pub fn arm(self: &Arc<Self>) -> JoinHandle<()> {
        {
            let mut state = self.state.lock();
            if *state != CoordinatorState::Idle {
                panic!("shutdown coordinator armed twice");
            }
            *state = CoordinatorState::Armed;
        }
        let Some(rx) = self.signals_rx.lock().take() else {
            panic!("shutdown coordinator armed twice");
        };
        tokio::spawn(self.clone().run(rx))
    }

    /// Forward SIGINT/SIGTERM into this coordinator.
    ///
    /// # Panics
    /// When an OS handler was already installed in this process.
    pub fn install_os_signal_handler(&self) {
        if OS_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
            panic!("OS signal handler installed twice");
        }
        tokio::spawn(forward_os_signals(self.signals_tx.clone()));
    }

    /// Emulate a termination signal. Never blocks; returns whether the
    /// coordinator took the request.
    pub fn request_shutdown(&self) -> bool {
        if self.state() == CoordinatorState::Idle {
            return false;
        }
        self.signals_tx.try_send(ShutdownSignal::Requested).is_ok()
    }

    async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<ShutdownSignal>) {
        let Some(first) = signals.recv().await else {
            return;
        };
        info!(signal = ?first, "shutdown signal received, draining");
        *self.state.lock() = CoordinatorState::Draining;
        self.stop.cancel();

        let callbacks = self.callbacks.lock().clone();
        let mut runner = tokio::spawn(run_callbacks(callbacks));

        tokio::select! {
            joined = &mut runner => {
                if let Err(err) = joined {
                    error!(error = %err, "shutdown callbacks panicked");
                }
                info!("graceful shutdown completed");
            }
            Some(second) = signals.recv() => {
                warn!(signal = ?second, "second shutdown signal received, exiting immediately");
                runner.abort();
                (self.force_exit)(1);
            }
        }

        *self.state.lock() = CoordinatorState::Terminated;
        self.terminated.cancel();
    }
}

async fn run_callbacks(callbacks: Vec<(String, Arc<dyn ShutdownCallback>)>) {
    for (name, callback) in callbacks {
        info!(callback = %name, "running shutdown callback");
        if let Err(err) = callback.on_shutdown().await {
            error!(callback = %name, error = %err, "shutdown callback failed");
        }
    }
}

async fn forward_os_signals(tx: mpsc::Sender<ShutdownSignal>) {
    #[cfg(unix)]
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(err) => {
            error!(error = %err, "cannot listen for SIGTERM");
            None
        }
    };

    loop {
        #[cfg(unix)]
        let sig = tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(err) = res {
                    error!(error = %err, "cannot listen for SIGINT");
                    return;
                }
                ShutdownSignal::Interrupt
            }
            _ = async {
                match terminate.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => ShutdownSignal::Terminate,
        };

        #[cfg(not(unix))]
        let sig = match signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(err) => {
                error!(error = %err, "cannot listen for SIGINT");
                return;
            }
        };

        // a full buffer means two signals are already pending
        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(sig) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl ShutdownCallback for Recording {
        async fn on_shutdown(&self) -> Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                return Err(anyhow!("{} failed", self.name));
            }
            Ok(())
        }
    }

    struct Stuck {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl ShutdownCallback for Stuck {
        async fn on_shutdown(&self) -> Result<()> {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<dyn ShutdownCallback> {
        Arc::new(Recording {
            name,
            log: log.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let coordinator = ShutdownCoordinator::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        coordinator.register("first", recording("first", &log, false));
        coordinator.register("second", recording("second", &log, true));
        coordinator.register("third", recording("third", &log, false));

        let stop = coordinator.stop_token();
        coordinator.arm();
        assert_eq!(coordinator.state(), CoordinatorState::Armed);
        assert!(!stop.is_cancelled());

        assert!(coordinator.request_shutdown());
        coordinator.wait_terminated().await;

        assert!(stop.is_cancelled());
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(coordinator.state(), CoordinatorState::Terminated);
    }

    #[tokio::test]
    async fn test_request_before_arm_is_rejected() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.request_shutdown());
    }

    #[tokio::test]
    #[should_panic(expected = "armed twice")]
    async fn test_arming_twice_panics() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.arm();
        coordinator.arm();
    }

    #[tokio::test]
    async fn test_request_shutdown_never_blocks_when_buffer_full() {
        let coordinator = ShutdownCoordinator::new();
        // armed state without a running consumer: the buffer only holds two
        *coordinator.state.lock() = CoordinatorState::Armed;
        assert!(coordinator.request_shutdown());
        assert!(coordinator.request_shutdown());
        assert!(!coordinator.request_shutdown());
    }

    #[tokio::test]
    async fn test_second_signal_forces_exit() {
        let exit_code = Arc::new(Mutex::new(None));
        let hook_code = exit_code.clone();
        let coordinator = ShutdownCoordinator::with_exit_hook(Arc::new(move |code| {
            *hook_code.lock() = Some(code);
        }));

        let log = Arc::new(Mutex::new(Vec::new()));
        let entered = Arc::new(Notify::new());
        coordinator.register("before", recording("before", &log, false));
        coordinator.register("stuck", Arc::new(Stuck { entered: entered.clone() }));
        coordinator.register("after", recording("after", &log, false));
        coordinator.arm();

        assert!(coordinator.request_shutdown());
        entered.notified().await;
        assert_eq!(coordinator.state(), CoordinatorState::Draining);

        assert!(coordinator.request_shutdown());
        coordinator.wait_terminated().await;

        assert_eq!(*exit_code.lock(), Some(1));
        assert_eq!(*log.lock(), vec!["before"]);
    }

    #[tokio::test]
    async fn test_closure_callback() {
        let coordinator = ShutdownCoordinator::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        coordinator.register(
            "closure",
            Arc::new(ShutdownFn(move || {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    Ok(())
                }
            })),
        );
        coordinator.arm();
        coordinator.request_shutdown();
        coordinator.wait_terminated().await;
        assert_eq!(*hits.lock(), 1);
    }
}
