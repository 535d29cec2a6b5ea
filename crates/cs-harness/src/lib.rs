//! Reliability plumbing shared by the daemon, agents and clients:
//! cooperative shutdown with in-flight draining, and retry with backoff
//! for calls to external collaborators.

pub mod retry;
pub mod shutdown;
