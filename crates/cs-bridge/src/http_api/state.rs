use std::sync::Arc;
use std::time::Instant;

use cs_harness::shutdown::ShutdownSignal;

use crate::event_bus::EventBus;
use crate::platform::Platform;

/// Shared application state for all HTTP handlers.
pub struct ApiState {
    pub platform: Arc<dyn Platform>,
    pub bus: EventBus,
    pub shutdown: ShutdownSignal,
    pub started_at: Instant,
    /// Upper bound for `limit` on `/bus/history`.
    pub history_limit_cap: usize,
}

impl ApiState {
    pub fn new(platform: Arc<dyn Platform>, bus: EventBus) -> Self {
        let cap = bus.capacity();
        Self {
            platform,
            bus,
            shutdown: ShutdownSignal::new(),
            started_at: Instant::now(),
            history_limit_cap: cap,
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
