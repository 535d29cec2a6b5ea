//! Container sandbox: per-project images and long-lived containers driven
//! through a docker-compatible CLI, with resource limits sized from the
//! host.

pub mod archive;
pub mod docker;
pub mod host;
pub mod orchestrator;
pub mod resources;
pub mod runtime;

use thiserror::Error;

pub use archive::ProjectArchive;
pub use docker::DockerCli;
pub use host::{CpuSampler, FixedCpuSampler, ProcStatSampler};
pub use orchestrator::{ContainerHandle, ContainerState, ProjectInfo, SandboxOrchestrator, SandboxSettings};
pub use resources::{HostCapacity, ResourceLimits};
pub use runtime::{CommandRunner, FakeRuntime, ProcessRunner};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn {0}")]
    Spawn(String),

    #[error("{op} failed: {stderr}")]
    Command { op: String, stderr: String },

    #[error("image build failed: {0}")]
    Build(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
