//! Language-specialist workers and everything that drives them.
//!
//! - [`state_machine`]: task lifecycle transitions
//! - [`worker`]: generate, build, test and fix one task
//! - [`split`]: fan a timed-out generation out to peer workers
//! - [`squad`]: resizable bound on concurrent tasks
//! - [`registry`]: one worker per language, high-level operations
//! - [`coordinator`]: retries with research, simulated user and escalation
//! - [`escalation`]: out-of-band notification, peer fix and reply training
//! - [`platform`]: the [`cs_bridge::Platform`] implementation

pub mod coordinator;
pub mod escalation;
pub mod platform;
pub mod prompts;
pub mod registry;
pub mod split;
pub mod squad;
pub mod state_machine;
pub mod worker;

pub use coordinator::{Coordinator, CoordinatorResult};
pub use platform::AgentPlatform;
pub use registry::{AgentRegistry, DevelopResult, RegistryDeps};
pub use split::{SplitError, SplitExecutor, SplitOutcome, SplitRequest, WorkerPool};
pub use squad::{SquadPermit, SquadSlots};
pub use state_machine::{StateMachineError, TaskEvent, TaskStateMachine};
pub use worker::{ExecuteOptions, Requirements, Worker, WorkerDeps, WorkerError};
