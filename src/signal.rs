//! Signal/lifecycle supervisor (§4.6): on SIGTERM/SIGINT, stops the
//! dispatcher from accepting new work and begins a bounded drain of
//! in-flight workers. In-flight workers are never killed here — they may
//! be writing persistent artifacts — so a second signal forces an
//! immediate exit instead of waiting further.

use crate::admission::AdmissionController;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{info, warn};

/// The stop flag plus the wakeup the dispatcher's receive loop selects on,
/// so a signal arriving while the loop is blocked inside `next_frame()`
/// (the normal, broker-idle case) still makes `Dispatcher::run` return
/// instead of waiting for the next inbound frame (§4.6).
pub struct Shutdown {
    stop: Arc<AtomicBool>,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            notify: Notify::new(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Resolves once the shutdown has been triggered. A permit is stored
    /// by `notify_one` if nothing is waiting yet, so a signal racing the
    /// loop between its flag check and this call is never lost.
    pub async fn cancelled(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn trigger(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Shares the raw stop flag with components (e.g. the heartbeat
    /// timer) that only need a poll, not the wakeup.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the SIGTERM/SIGINT handlers and triggers `shutdown` on the
/// first one received. A second signal forces the process to exit
/// immediately, bypassing the drain period.
pub fn install(shutdown: Arc<Shutdown>) {
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM, entering drain"),
            _ = int.recv() => info!("received SIGINT, entering drain"),
        }
        shutdown.trigger();

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        warn!("received second signal during drain, forcing exit");
        std::process::exit(1);
    });
}

/// Blocks until every in-flight worker has been observed to exit or
/// `timeout` elapses, whichever comes first (§4.6 "bounded drain
/// period").
pub async fn drain(admission: &AdmissionController, timeout: Duration, poll_interval: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = admission.global_count().await;
        if remaining == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining, "drain timeout elapsed with workers still in flight");
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
