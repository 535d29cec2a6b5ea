//! Transport layer of the platform.
//!
//! - [`event_bus`]: the in-process communication bus (bounded ring + flume
//!   fan-out)
//! - [`protocol`]: bus message kinds, envelopes and filters
//! - [`http_api`]: axum REST surface
//! - [`platform`]: the trait the HTTP surface drives

pub mod api_error;
pub mod event_bus;
pub mod http_api;
pub mod platform;
pub mod protocol;

pub use event_bus::EventBus;
pub use platform::{Platform, PlatformError};
pub use protocol::{BusFilter, BusKind, BusMessage};
