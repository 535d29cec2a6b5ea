//! Squad slots: the resizable bound on concurrently executing tasks.
//!
//! The count is a strict ceiling. Shrinking below the number of tasks in
//! flight cancels nothing; new acquirers simply wait until enough permits
//! have been returned.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use cs_api_types::SquadStatus;
use cs_core::config::SquadConfig;
use cs_telemetry::metrics::PlatformMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotState {
    capacity: usize,
    in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct SquadSlots {
    bounds: SquadConfig,
    tx: Arc<watch::Sender<SlotState>>,
    rx: watch::Receiver<SlotState>,
}

impl SquadSlots {
    /// Start at `bounds.min` slots.
    pub fn new(bounds: SquadConfig) -> Self {
        let initial = bounds.min.max(1);
        Self::with_capacity(bounds, initial)
    }

    pub fn with_capacity(bounds: SquadConfig, capacity: usize) -> Self {
        let capacity = bounds.clamp(capacity).max(1);
        let (tx, rx) = watch::channel(SlotState {
            capacity,
            in_flight: 0,
        });
        PlatformMetrics::squad_slots(capacity);
        Self {
            bounds,
            tx: Arc::new(tx),
            rx,
        }
    }

    fn try_take(&self) -> Option<SquadPermit> {
        let taken = self.tx.send_if_modified(|s| {
            if s.in_flight < s.capacity {
                s.in_flight += 1;
                true
            } else {
                false
            }
        });
        taken.then(|| SquadPermit {
            tx: self.tx.clone(),
        })
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> SquadPermit {
        let mut rx = self.rx.clone();
        loop {
            rx.borrow_and_update();
            if let Some(permit) = self.try_take() {
                return permit;
            }
            debug!(in_flight = self.in_flight(), capacity = self.capacity(), "waiting for squad slot");
            // the sender lives in `self`, so this cannot observe a closed channel
            let _ = rx.changed().await;
        }
    }

    pub fn try_acquire(&self) -> Option<SquadPermit> {
        self.try_take()
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<SquadPermit> {
        tokio::time::timeout(timeout, self.acquire()).await.ok()
    }

    /// Set the slot count, clamped to the configured bounds. Returns the
    /// applied value.
    pub fn resize(&self, requested: usize) -> usize {
        let capacity = self.bounds.clamp(requested).max(1);
        let changed = self.tx.send_if_modified(|s| {
            if s.capacity == capacity {
                false
            } else {
                s.capacity = capacity;
                true
            }
        });
        if changed {
            info!(capacity, in_flight = self.in_flight(), "squad slots resized");
            PlatformMetrics::squad_slots(capacity);
        }
        capacity
    }

    pub fn capacity(&self) -> usize {
        self.rx.borrow().capacity
    }

    pub fn in_flight(&self) -> usize {
        self.rx.borrow().in_flight
    }

    pub fn available(&self) -> usize {
        let s = *self.rx.borrow();
        s.capacity.saturating_sub(s.in_flight)
    }

    pub fn bounds(&self) -> &SquadConfig {
        &self.bounds
    }

    pub fn status(&self) -> SquadStatus {
        let s = *self.rx.borrow();
        SquadStatus {
            capacity: s.capacity,
            in_flight: s.in_flight,
            available: s.capacity.saturating_sub(s.in_flight),
        }
    }
}

/// One held slot; released on drop.
#[derive(Debug)]
pub struct SquadPermit {
    tx: Arc<watch::Sender<SlotState>>,
}

impl Drop for SquadPermit {
    fn drop(&mut self) {
        self.tx.send_modify(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }
}
