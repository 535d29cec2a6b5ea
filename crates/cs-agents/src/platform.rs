//! [`cs_bridge::Platform`] backed by the registry and coordinator.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use cs_api_types::{
    DevelopRequest, DevelopResponse, FixRequest, FixResponse, QuickRunRequest, QuickRunResponse,
    StatusSnapshot,
};
use cs_bridge::{Platform, PlatformError};
use cs_intelligence::LlmMessage;

use crate::coordinator::Coordinator;
use crate::prompts::Persona;
use crate::registry::{AgentRegistry, RegistryError};
use crate::worker::{ExecuteOptions, WorkerError};

impl From<RegistryError> for PlatformError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnsupportedLanguage(lang)
            | RegistryError::Worker(WorkerError::UnsupportedLanguage(lang)) => {
                PlatformError::InvalidArgument(format!("unsupported language: {lang}"))
            }
            RegistryError::Worker(WorkerError::TaskNotFound(id)) => {
                PlatformError::NotFound(format!("task {id}"))
            }
            e @ (RegistryError::SandboxUnavailable | RegistryError::RemoteDisabled) => {
                PlatformError::Unavailable(e.to_string())
            }
            RegistryError::Sandbox(cs_sandbox::SandboxError::Unavailable(msg)) => {
                PlatformError::Unavailable(msg)
            }
            RegistryError::Sandbox(cs_sandbox::SandboxError::NotFound(name)) => {
                PlatformError::NotFound(format!("container {name}"))
            }
            other => PlatformError::Internal(other.to_string()),
        }
    }
}

pub struct AgentPlatform {
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
    started: Instant,
}

impl AgentPlatform {
    pub fn new(registry: Arc<AgentRegistry>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            registry,
            coordinator,
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    async fn peer_suggestion(&self, request: &FixRequest) -> FixResponse {
        let errors = request.errors.join("\n");
        let context = request.context.clone().unwrap_or_default();
        let prompt = format!(
            "Another agent hit these errors while running generated code.\nContext: {context}\nErrors:\n{errors}\n\nReply with a short, concrete fix the agent can apply."
        );
        let reply = self
            .registry
            .deps()
            .llm
            .chat(
                &[LlmMessage::user(prompt)],
                Some(Persona::Debugger.system_prompt()),
                None,
            )
            .await;
        let suggestion = reply.content.trim().to_string();
        FixResponse {
            success: reply.success && !suggestion.is_empty(),
            cause: reply.error.unwrap_or_default(),
            suggestion,
            corrected_code: None,
        }
    }
}

#[async_trait]
impl Platform for AgentPlatform {
    async fn develop(&self, request: DevelopRequest) -> Result<DevelopResponse, PlatformError> {
        if request.description.trim().is_empty() {
            return Err(PlatformError::InvalidArgument("description is required".into()));
        }
        let options = ExecuteOptions {
            use_rag: request.use_rag,
            run_tests: request.run_tests,
        };
        if request.coordinated {
            let result = self
                .coordinator
                .develop(&request.description, &request.language, options)
                .await?;
            return Ok(result.to_response());
        }
        let metadata = match request.metadata {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        let result = self
            .registry
            .develop(&request.description, &request.language, options, metadata)
            .await?;
        Ok(result.to_response())
    }

    async fn quick_run(&self, request: QuickRunRequest) -> Result<QuickRunResponse, PlatformError> {
        if request.code.trim().is_empty() {
            return Err(PlatformError::InvalidArgument("code is required".into()));
        }
        let out = self
            .registry
            .execute_code(&request.language, &request.code, request.filename.as_deref())
            .await?;
        Ok(QuickRunResponse {
            success: out.success,
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
        })
    }

    async fn fix(&self, request: FixRequest) -> Result<FixResponse, PlatformError> {
        if request.errors.is_empty() {
            return Err(PlatformError::InvalidArgument("errors are required".into()));
        }
        let Some(code) = request.code.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(self.peer_suggestion(&request).await);
        };
        let language = request.language.as_deref().unwrap_or("python");
        let worker = self.registry.worker(language)?;
        let error = request.errors.join("\n");
        match worker.analyze_error(code, &error).await {
            Some(fix) => Ok(FixResponse {
                success: true,
                cause: fix.cause,
                suggestion: fix.fix_suggestion,
                corrected_code: (!fix.corrected_code.is_empty()).then_some(fix.corrected_code),
            }),
            None => Ok(FixResponse {
                success: false,
                cause: "no fix could be derived".into(),
                ..Default::default()
            }),
        }
    }

    async fn status(&self) -> StatusSnapshot {
        let llm_available = self.registry.deps().llm.check_connection().await;
        if !llm_available {
            warn!("llm endpoint unreachable");
        }
        StatusSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            workers: self.registry.status(),
            containers: self.registry.container_summary().await,
            squad: self.registry.squad().status(),
            autoscaler: None,
            bus: self.registry.deps().bus.stats(),
            llm_available,
            remote_enabled: self.registry.remote_enabled(),
        }
    }
}
