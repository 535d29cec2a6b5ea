//! Agent registry: one cached [`Worker`] per language, created on first
//! use, plus the high-level operations the API surface and coordinator
//! call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use cs_api_types::{ContainerSummary, DevelopResponse, WorkerStatus};
use cs_core::config::{Config, RemoteConfig};
use cs_core::decision_memory::DecisionMemory;
use cs_core::language;
use cs_core::types::{ExecOutput, Task, TaskState};
use cs_intelligence::{LlmClient, OllamaEmbedder, RetrievalIndex};
use cs_sandbox::{
    ContainerState, ProcessRunner, ProjectInfo, SandboxError, SandboxOrchestrator, SandboxSettings,
};

use crate::split::{SplitExecutor, WorkerPool};
use crate::squad::SquadSlots;
use crate::worker::{ExecuteOptions, Worker, WorkerDeps, WorkerError};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("container sandbox unavailable")]
    SandboxUnavailable,
    #[error("remote push needs REMOTE_ORCHESTRATOR_ENABLED or a repository url")]
    RemoteDisabled,
    #[error("git {step} failed: {stderr}")]
    Git { step: String, stderr: String },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one `develop` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopResult {
    pub task_id: Uuid,
    pub language: String,
    pub state: TaskState,
    pub success: bool,
    pub code: String,
    pub tests: String,
    pub iterations: u32,
    pub errors: Vec<String>,
    pub container_id: Option<String>,
    pub project_path: Option<PathBuf>,
    pub metadata: Map<String, Value>,
}

impl From<Task> for DevelopResult {
    fn from(task: Task) -> Self {
        let container_id = task
            .metadata
            .get("container_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            task_id: task.id,
            success: task.is_success(),
            state: task.state,
            language: task.language,
            code: task.code,
            tests: task.tests,
            iterations: task.iterations,
            errors: task.errors,
            container_id,
            project_path: task.project_path,
            metadata: task.metadata,
        }
    }
}

impl DevelopResult {
    pub fn to_response(&self) -> DevelopResponse {
        DevelopResponse {
            task_id: Some(self.task_id.to_string()),
            status: self.state.as_str().to_string(),
            code: self.code.clone(),
            tests: self.tests.clone(),
            iterations: self.iterations,
            errors: self.errors.clone(),
            success: self.success,
            attempts: 1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub project: ProjectInfo,
    pub run: ExecOutput,
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RegistryDeps {
    pub worker: WorkerDeps,
    pub squad: SquadSlots,
    pub remote: RemoteConfig,
}

impl RegistryDeps {
    pub fn new(worker: WorkerDeps, squad: SquadSlots) -> Self {
        Self {
            worker,
            squad,
            remote: RemoteConfig::default(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    /// Production collaborators: Ollama client, docker CLI, on-disk
    /// retrieval and decision stores. A decision store that cannot be
    /// opened is logged and left out.
    pub async fn from_config(cfg: &Config, bus: cs_bridge::EventBus) -> Self {
        let llm = LlmClient::from_config(&cfg.llm);
        let sandbox = SandboxOrchestrator::new(Arc::new(ProcessRunner), SandboxSettings::from_config(cfg))
            .with_bus(bus.clone());

        let mut retrieval = RetrievalIndex::new(cfg.retrieval_dir(), None);
        if let Some(model) = &cfg.llm.embedding_model {
            retrieval = retrieval.with_embedder(Arc::new(OllamaEmbedder::new(
                cfg.llm.base_url.clone(),
                model.clone(),
                Duration::from_secs(cfg.llm.timeout_secs),
            )));
        }

        let mut worker = WorkerDeps::new(llm, bus)
            .with_sandbox(Arc::new(sandbox))
            .with_retrieval(Arc::new(retrieval))
            .with_worker_config(cfg.worker.clone())
            .with_split_config(cfg.split.clone());
        match DecisionMemory::new(cfg.decision_db_path()).await {
            Ok(memory) => worker = worker.with_memory(Arc::new(memory)),
            Err(err) => warn!(error = %err, "decision memory disabled"),
        }

        Self {
            worker,
            squad: SquadSlots::new(cfg.squad.clone()),
            remote: cfg.remote.clone(),
        }
    }
}

/// What `initialize` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryInit {
    pub sandbox: bool,
    pub llm: bool,
    pub remote: bool,
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

pub struct AgentRegistry {
    deps: WorkerDeps,
    squad: SquadSlots,
    remote: RemoteConfig,
    split: Arc<SplitExecutor>,
    workers: RwLock<HashMap<&'static str, Arc<Worker>>>,
}

impl AgentRegistry {
    pub fn new(deps: RegistryDeps) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<AgentRegistry>| {
            let pool: Weak<dyn WorkerPool> = me.clone();
            let split = Arc::new(SplitExecutor::new(
                pool,
                deps.worker.split.clone(),
                deps.worker.bus.clone(),
            ));
            Self {
                deps: deps.worker,
                squad: deps.squad,
                remote: deps.remote,
                split,
                workers: RwLock::new(HashMap::new()),
            }
        })
    }

    /// Prepare the sandbox network and probe the model server.
    pub async fn initialize(&self) -> RegistryInit {
        let sandbox = match &self.deps.sandbox {
            Some(sandbox) => sandbox.init().await.unwrap_or_else(|err| {
                warn!(error = %err, "sandbox init failed");
                false
            }),
            None => false,
        };
        let llm = self.deps.llm.check_connection().await;
        let init = RegistryInit {
            sandbox,
            llm,
            remote: self.remote.enabled,
        };
        info!(sandbox, llm, remote = init.remote, "registry initialised");
        init
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }

    pub fn squad(&self) -> &SquadSlots {
        &self.squad
    }

    pub fn sandbox(&self) -> Option<&Arc<SandboxOrchestrator>> {
        self.deps.sandbox.as_ref()
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote.enabled
    }

    /// The worker for `language`, created on first use.
    pub fn worker(&self, language: &str) -> Result<Arc<Worker>, RegistryError> {
        let canonical = language::normalize(language)
            .ok_or_else(|| RegistryError::UnsupportedLanguage(language.to_string()))?;
        if let Some(worker) = self
            .workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(canonical)
        {
            return Ok(Arc::clone(worker));
        }
        let mut workers = self.workers.write().unwrap_or_else(|p| p.into_inner());
        if let Some(worker) = workers.get(canonical) {
            return Ok(Arc::clone(worker));
        }
        let worker = Arc::new(Worker::new(canonical, self.deps.clone())?);
        worker.set_split_executor(Arc::clone(&self.split));
        info!(language = canonical, "worker created");
        workers.insert(canonical, Arc::clone(&worker));
        Ok(worker)
    }

    /// Workers created so far, by language name.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self
            .workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        workers.sort_by_key(|w| w.language());
        workers
    }

    fn require_sandbox(&self) -> Result<&Arc<SandboxOrchestrator>, RegistryError> {
        self.deps.sandbox.as_ref().ok_or(RegistryError::SandboxUnavailable)
    }

    // -- operations ---------------------------------------------------------

    /// Create and execute one task under a squad slot.
    pub async fn develop(
        &self,
        description: &str,
        language: &str,
        options: ExecuteOptions,
        metadata: Map<String, Value>,
    ) -> Result<DevelopResult, RegistryError> {
        let worker = self.worker(language)?;
        let _permit = self.squad.acquire().await;
        let task = worker.create_task(description, metadata);
        self.deps.bus.log_request(
            "registry",
            worker.name(),
            json!({ "action": "develop", "task_id": task.id.to_string() }),
        );
        let task = worker.execute(task.id, options).await?;
        Ok(DevelopResult::from(task))
    }

    pub async fn create_project(
        &self,
        language: &str,
        code: &str,
        dependencies: &[String],
        name: Option<&str>,
    ) -> Result<ProjectInfo, RegistryError> {
        let worker = self.worker(language)?;
        let sandbox = self.require_sandbox()?;
        Ok(sandbox
            .create_project(worker.language(), code, dependencies, name)
            .await?)
    }

    /// Run `code` in the language's scratch container, creating it on
    /// first use.
    pub async fn execute_code(
        &self,
        language: &str,
        code: &str,
        filename: Option<&str>,
    ) -> Result<ExecOutput, RegistryError> {
        let worker = self.worker(language)?;
        let sandbox = self.require_sandbox()?;
        if !sandbox.docker_available().await {
            return Err(RegistryError::SandboxUnavailable);
        }
        let scratch = format!("{}_{}_scratch", sandbox.prefix(), worker.language());
        let container = match sandbox.get(&scratch) {
            Some(handle) => {
                if handle.state != ContainerState::Running {
                    sandbox.start(&handle.id).await?;
                }
                handle.id
            }
            None => {
                sandbox
                    .create_project(worker.language(), code, &[], Some("scratch"))
                    .await?
                    .container_id
            }
        };
        Ok(sandbox.run_code(&container, Some(code), filename).await?)
    }

    /// Import an exported project and run its entry point.
    pub async fn upload_and_process(
        &self,
        archive: &[u8],
        language: &str,
        name: Option<&str>,
    ) -> Result<UploadResult, RegistryError> {
        let worker = self.worker(language)?;
        let sandbox = self.require_sandbox()?;
        let project = sandbox.import_project(archive, worker.language(), name).await?;
        let run = sandbox.run_code(&project.container_id, None, None).await?;
        Ok(UploadResult { project, run })
    }

    pub async fn download_project(&self, container: &str) -> Result<Vec<u8>, RegistryError> {
        Ok(self.require_sandbox()?.export_project(container).await?)
    }

    /// Commit the container's project directory and push it to `repo_url`.
    pub async fn push_to_remote_repo(
        &self,
        container: &str,
        repo_url: &str,
        branch: &str,
    ) -> Result<String, RegistryError> {
        if !self.remote.enabled && repo_url.trim().is_empty() {
            return Err(RegistryError::RemoteDisabled);
        }
        let sandbox = self.require_sandbox()?;
        let handle = sandbox
            .get(container)
            .ok_or_else(|| SandboxError::NotFound(container.to_string()))?;
        let runner = Arc::clone(sandbox.cli().runner());
        let dir = handle.project_path.clone();
        let message = format!("{} project {}", handle.language, handle.name);
        let branch = if branch.is_empty() { "main" } else { branch };

        let steps: Vec<(&str, Vec<String>)> = vec![
            ("init", vec!["init".into()]),
            ("add", vec!["add".into(), "-A".into()]),
            (
                "commit",
                vec![
                    "-c".into(),
                    "user.name=code-squad".into(),
                    "-c".into(),
                    "user.email=code-squad@localhost".into(),
                    "commit".into(),
                    "--allow-empty".into(),
                    "-m".into(),
                    message,
                ],
            ),
            ("push", vec!["push".into(), repo_url.to_string(), format!("HEAD:{branch}")]),
        ];
        for (step, args) in steps {
            let out = runner.run("git", &args, Some(&dir), GIT_TIMEOUT).await?;
            if !out.success {
                self.deps.bus.log_github_op(step, repo_url, false);
                return Err(RegistryError::Git {
                    step: step.to_string(),
                    stderr: out.diagnostics().to_string(),
                });
            }
        }
        self.deps.bus.log_github_op("push", repo_url, true);
        info!(container = %handle.name, repo = repo_url, branch, "project pushed");
        Ok(format!("{repo_url}#{branch}"))
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers().iter().map(|w| w.status()).collect()
    }

    pub async fn container_summary(&self) -> ContainerSummary {
        let Some(sandbox) = &self.deps.sandbox else {
            return ContainerSummary::default();
        };
        let handles = sandbox.list(None);
        let running = handles.iter().filter(|h| h.state == ContainerState::Running).count();
        ContainerSummary {
            running,
            stopped: handles.iter().filter(|h| h.state == ContainerState::Stopped).count(),
            total: handles.len(),
            runtime_available: sandbox.docker_available().await,
        }
    }

    /// Find a task in any worker.
    pub fn find_task(&self, id: Uuid) -> Option<Task> {
        self.workers().iter().find_map(|w| w.get_task(id))
    }

    /// Drop finished tasks from every worker.
    pub fn evict_finished(&self) -> usize {
        let mut evicted = 0;
        for worker in self.workers() {
            for task in worker.list_tasks() {
                if task.state.is_terminal() && worker.remove_task(task.id).is_some() {
                    evicted += 1;
                }
            }
        }
        evicted
    }

    pub async fn shutdown(&self, retain_containers: bool) {
        if let Some(sandbox) = &self.deps.sandbox {
            sandbox.shutdown(retain_containers).await;
        }
    }
}

#[async_trait]
impl WorkerPool for AgentRegistry {
    fn languages_by_load(&self) -> Vec<(String, usize)> {
        let workers = self.workers.read().unwrap_or_else(|p| p.into_inner());
        language::supported()
            .into_iter()
            .map(|lang| {
                let load = workers.get(lang).map_or(0, |w| w.active_count());
                (lang.to_string(), load)
            })
            .collect()
    }

    async fn generate_only(
        &self,
        language: &str,
        description: &str,
        depth: u32,
        timeout: Duration,
    ) -> Task {
        let worker = match self.worker(language) {
            Ok(worker) => worker,
            Err(err) => {
                let mut task = Task::new(description, language);
                task.state = TaskState::Failed;
                task.push_error(err.to_string());
                return task;
            }
        };
        let mut metadata = Map::new();
        metadata.insert("fallback_depth".into(), json!(depth));
        let task = worker.create_task(description, metadata);
        match worker.execute_generate_only(task.id, timeout).await {
            Ok(task) => task,
            Err(err) => {
                let mut task = task;
                task.state = TaskState::Failed;
                task.push_error(err.to_string());
                task
            }
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("workers", &self.workers().len())
            .field("squad", &self.squad.status())
            .finish()
    }
}
