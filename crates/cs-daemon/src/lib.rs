//! Long-running service around the agent registry.
//!
//! - [`autoscaler`]: CPU-driven start/stop of managed containers and squad
//!   slot recalibration
//! - [`daemon`]: API listeners, background loops and graceful drain

pub mod autoscaler;
pub mod daemon;

pub use autoscaler::{decide, Autoscaler, ScaleDecision, TickReport};
pub use daemon::{Daemon, DaemonPlatform};
