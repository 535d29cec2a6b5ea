//! The seam between the HTTP surface and the agent platform.
//!
//! `cs-agents` implements [`Platform`]; the bridge only sees the trait so
//! the router can be tested with a stub.

use async_trait::async_trait;
use thiserror::Error;

use cs_api_types::{
    DevelopRequest, DevelopResponse, FixRequest, FixResponse, QuickRunRequest, QuickRunResponse,
    StatusSnapshot,
};

use crate::api_error::ApiError;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::InvalidArgument(m) => ApiError::BadRequest(m),
            PlatformError::NotFound(m) => ApiError::NotFound(m),
            PlatformError::Unavailable(m) => ApiError::Unavailable(m),
            PlatformError::Internal(m) => ApiError::Internal(m),
        }
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Create and execute a task. Task failures are reported inside the
    /// response, not as `Err`.
    async fn develop(&self, request: DevelopRequest) -> Result<DevelopResponse, PlatformError>;

    async fn quick_run(&self, request: QuickRunRequest)
        -> Result<QuickRunResponse, PlatformError>;

    async fn fix(&self, request: FixRequest) -> Result<FixResponse, PlatformError>;

    async fn status(&self) -> StatusSnapshot;
}
