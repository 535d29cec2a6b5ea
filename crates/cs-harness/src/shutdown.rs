use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown with in-flight work tracking.
///
/// Background loops `select!` on [`subscribe`](Self::subscribe). Request
/// handlers wrap each unit of work in a [`WorkGuard`] from
/// [`begin_work`](Self::begin_work), which refuses new work once shutdown
/// has been triggered. [`wait_idle`](Self::wait_idle) then waits for the
/// outstanding guards to drop.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let Some(_guard) = shutdown.begin_work() else { return Err(Busy) };
/// run_task().await;
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    inflight_tx: Arc<watch::Sender<usize>>,
    inflight_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (inflight_tx, inflight_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            inflight_tx: Arc::new(inflight_tx),
            inflight_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Flip into shutdown and wake every subscriber. Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(inflight = self.inflight(), "shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Register one unit of in-flight work, or `None` once shutting down.
    pub fn begin_work(&self) -> Option<WorkGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.inflight_tx.send_modify(|n| *n += 1);
        Some(WorkGuard {
            tx: self.inflight_tx.clone(),
        })
    }

    pub fn inflight(&self) -> usize {
        *self.inflight_rx.borrow()
    }

    /// Wait until no work is in flight, or until `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> DrainResult {
        let mut rx = self.inflight_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *rx.borrow_and_update();
            if current == 0 {
                info!("all in-flight work drained");
                return DrainResult::Complete;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete,
                Err(_) => {
                    warn!(remaining = current, "drain timeout");
                    return DrainResult::Timeout { remaining: current };
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// WorkGuard
// ---------------------------------------------------------------------------

/// Decrements the in-flight count when dropped.
#[derive(Debug)]
pub struct WorkGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
