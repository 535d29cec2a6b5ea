//! Language-specialist worker: owns its tasks and drives each one through
//! analyse, generate, build, test and the bounded fix loop.
//!
//! Failures never escape as `Err`; they are appended to `task.errors` and
//! the task ends in `Failed`. `Err` is reserved for caller mistakes
//! (unknown task id, re-running a finished task).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use cs_api_types::WorkerStatus;
use cs_bridge::EventBus;
use cs_core::config::{SplitConfig, WorkerConfig};
use cs_core::decision_memory::{DecisionContext, DecisionMemory, NewDecision, Outcome};
use cs_core::language::{self, LanguageTemplate};
use cs_core::types::{Task, TaskState};
use cs_intelligence::{extract_code, json_object_slice, GenerateRequest, LlmClient, LlmResponse, RetrievalIndex};
use cs_sandbox::SandboxOrchestrator;
use cs_telemetry::metrics::PlatformMetrics;
use cs_telemetry::tracing_setup::task_span;

use crate::prompts::{self, Persona};
use crate::split::{SplitExecutor, SplitOutcome, SplitRequest};
use crate::state_machine::{TaskEvent, TaskStateMachine};

/// `application` of every decision record written by workers.
pub const DECISION_APP: &str = "code-squad";

const MAX_DIAGNOSTIC_CHARS: usize = 2000;

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("task {0} has already been started")]
    AlreadyStarted(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Prepend retrieval context to the generation prompt.
    pub use_rag: bool,
    /// Build and test in the sandbox. When false the task completes right
    /// after generation.
    pub run_tests: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            use_rag: true,
            run_tests: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis results
// ---------------------------------------------------------------------------

fn default_project_name() -> String {
    "project".to_string()
}

fn default_complexity() -> String {
    "medium".to_string()
}

/// Structured analysis stored under `task.metadata.requirements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files_needed: Vec<String>,
    #[serde(default = "default_complexity")]
    pub estimated_complexity: String,
}

impl Requirements {
    /// Shape used whenever the model's analysis cannot be parsed.
    pub fn fallback(tpl: &LanguageTemplate) -> Self {
        Self {
            project_name: default_project_name(),
            description: String::new(),
            features: Vec::new(),
            dependencies: Vec::new(),
            files_needed: vec![tpl.main_file()],
            estimated_complexity: default_complexity(),
        }
    }

    pub fn parse(response: &str, tpl: &LanguageTemplate) -> Option<Self> {
        let slice = json_object_slice(response)?;
        let mut req: Requirements = serde_json::from_str(slice).ok()?;
        if req.project_name.trim().is_empty() {
            req.project_name = default_project_name();
        }
        if req.files_needed.is_empty() {
            req.files_needed.push(tpl.main_file());
        }
        Some(req)
    }
}

/// Debugger persona output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSuggestion {
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub fix_suggestion: String,
    #[serde(default)]
    pub corrected_code: String,
}

impl FixSuggestion {
    pub fn parse(response: &str, language: &str) -> Option<Self> {
        let parsed = json_object_slice(response)
            .and_then(|slice| serde_json::from_str::<FixSuggestion>(slice).ok());
        let mut fix = match parsed {
            Some(fix) => fix,
            // bare code is still a usable fix
            None => {
                let code = extract_code(response, language);
                if code.trim().is_empty() {
                    return None;
                }
                FixSuggestion {
                    cause: "unstructured reply".into(),
                    fix_suggestion: String::new(),
                    corrected_code: code,
                }
            }
        };
        if fix.corrected_code.contains("```") {
            fix.corrected_code = extract_code(&fix.corrected_code, language);
        }
        Some(fix)
    }
}

enum Generated {
    Code(String),
    TimedOut,
    Failed(String),
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(max).collect();
        s.push_str("...");
        s
    }
}

pub fn fallback_depth(task: &Task) -> u32 {
    task.metadata
        .get("fallback_depth")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub llm: LlmClient,
    pub bus: EventBus,
    pub sandbox: Option<Arc<SandboxOrchestrator>>,
    pub retrieval: Option<Arc<RetrievalIndex>>,
    pub memory: Option<Arc<DecisionMemory>>,
    pub worker: WorkerConfig,
    pub split: SplitConfig,
}

impl WorkerDeps {
    pub fn new(llm: LlmClient, bus: EventBus) -> Self {
        Self {
            llm,
            bus,
            sandbox: None,
            retrieval: None,
            memory: None,
            worker: WorkerConfig::default(),
            split: SplitConfig::default(),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<SandboxOrchestrator>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<RetrievalIndex>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_memory(mut self, memory: Arc<DecisionMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_split_config(mut self, split: SplitConfig) -> Self {
        self.split = split;
        self
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    language: &'static str,
    template: &'static LanguageTemplate,
    name: String,
    deps: WorkerDeps,
    tasks: RwLock<HashMap<Uuid, Task>>,
    split: OnceLock<Arc<SplitExecutor>>,
}

impl Worker {
    pub fn new(language: &str, deps: WorkerDeps) -> Result<Self, WorkerError> {
        let canonical = language::normalize(language)
            .ok_or_else(|| WorkerError::UnsupportedLanguage(language.to_string()))?;
        let template = language::template(canonical)
            .ok_or_else(|| WorkerError::UnsupportedLanguage(language.to_string()))?;
        Ok(Self {
            language: canonical,
            template,
            name: format!("{canonical}_agent"),
            deps,
            tasks: RwLock::new(HashMap::new()),
            split: OnceLock::new(),
        })
    }

    /// Attach the fallback executor. Only the first call has an effect.
    pub fn set_split_executor(&self, split: Arc<SplitExecutor>) {
        let _ = self.split.set(split);
    }

    pub fn language(&self) -> &'static str {
        self.language
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &'static LanguageTemplate {
        self.template
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }

    // -- task table ---------------------------------------------------------

    pub fn create_task(&self, description: &str, metadata: Map<String, Value>) -> Task {
        let task = Task::new(description, self.language).with_metadata(metadata);
        debug!(task_id = %task.id, worker = %self.name, "task created");
        self.store(&task);
        task
    }

    pub fn get_task(&self, id: Uuid) -> Option<Task> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    /// Newest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn remove_task(&self, id: Uuid) -> Option<Task> {
        self.tasks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
    }

    /// Tasks not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    pub fn status(&self) -> WorkerStatus {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let count = |state: TaskState| tasks.values().filter(|t| t.state == state).count();
        WorkerStatus {
            language: self.language.to_string(),
            capabilities: self.template.capabilities.iter().map(|c| c.to_string()).collect(),
            active_tasks: tasks.values().filter(|t| !t.state.is_terminal()).count(),
            completed: count(TaskState::Completed),
            failed: count(TaskState::Failed),
            total: tasks.len(),
        }
    }

    fn store(&self, task: &Task) {
        self.tasks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task.id, task.clone());
    }

    fn claim(&self, id: Uuid) -> Result<Task, WorkerError> {
        let task = self.get_task(id).ok_or(WorkerError::TaskNotFound(id))?;
        if task.state != TaskState::Pending {
            return Err(WorkerError::AlreadyStarted(id));
        }
        Ok(task)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Apply `event`, publish the transition and make it visible through
    /// [`get_task`](Self::get_task).
    fn advance(&self, task: &mut Task, sm: &mut TaskStateMachine, event: TaskEvent) {
        let from = task.state;
        let to = match sm.transition(event) {
            Ok(to) => to,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "ignored transition");
                return;
            }
        };
        task.state = to;
        let id = task.id.to_string();
        if from == TaskState::Pending {
            self.deps.bus.log_task_start(&self.name, &id, &task.description);
        } else if to.is_terminal() {
            task.completed_at = Some(Utc::now());
            self.deps
                .bus
                .log_task_end(&self.name, &id, to.as_str(), to == TaskState::Completed);
        } else {
            self.deps.bus.log_task_state(&self.name, &id, from.as_str(), to.as_str());
        }
        self.store(task);
    }

    /// Drive a pending task to a terminal state.
    pub async fn execute(&self, task_id: Uuid, options: ExecuteOptions) -> Result<Task, WorkerError> {
        let task = self.claim(task_id)?;
        let span = task_span(&task.id.to_string(), self.language);
        Ok(self.run(task, options).instrument(span).await)
    }

    /// Analysis and generation only, bounded by `timeout`. Never touches the
    /// sandbox and never splits.
    pub async fn execute_generate_only(&self, task_id: Uuid, timeout: Duration) -> Result<Task, WorkerError> {
        let mut task = self.claim(task_id)?;
        let span = task_span(&task.id.to_string(), self.language);
        let fut = async move {
            let mut sm = TaskStateMachine::resume(task.state);
            self.advance(&mut task, &mut sm, TaskEvent::Analyze);
            let requirements = self.analyze_requirements(&task.description).await;
            task.metadata.insert("requirements".into(), json!(requirements));
            self.advance(&mut task, &mut sm, TaskEvent::Generate);
            match self.generate_code(&task, &requirements, true, timeout).await {
                Generated::Code(code) => {
                    task.code = code;
                    self.conclude(task, sm, TaskEvent::Complete).await
                }
                Generated::TimedOut => {
                    task.push_error(format!("Generation timed out after {}s", timeout.as_secs()));
                    self.conclude(task, sm, TaskEvent::Fail).await
                }
                Generated::Failed(err) => {
                    task.push_error(err);
                    self.conclude(task, sm, TaskEvent::Fail).await
                }
            }
        };
        Ok(fut.instrument(span).await)
    }

    async fn run(&self, mut task: Task, options: ExecuteOptions) -> Task {
        let mut sm = TaskStateMachine::resume(task.state);
        info!(worker = %self.name, "task started");

        self.advance(&mut task, &mut sm, TaskEvent::Analyze);
        let requirements = self.analyze_requirements(&task.description).await;
        task.metadata.insert("requirements".into(), json!(requirements));

        self.advance(&mut task, &mut sm, TaskEvent::Generate);
        let deadline = Duration::from_secs(self.deps.worker.generation_timeout_secs);
        match self.generate_code(&task, &requirements, options.use_rag, deadline).await {
            Generated::Code(code) => task.code = code,
            Generated::Failed(err) => return self.fail(task, sm, err).await,
            Generated::TimedOut => {
                warn!(deadline_secs = deadline.as_secs(), "generation deadline expired, splitting");
                match self.split_fallback(&mut task, &requirements).await {
                    Ok(outcome) if outcome.success => {
                        task.code = outcome.combined_code;
                        if self.deps.split.generate_only {
                            return self.conclude(task, sm, TaskEvent::Complete).await;
                        }
                    }
                    Ok(outcome) => {
                        for part in outcome.parts.iter().filter(|p| !p.success) {
                            for err in &part.errors {
                                task.push_error(format!("chunk {} ({}): {err}", part.index, part.language));
                            }
                        }
                        return self.fail(task, sm, "Split fallback produced no code".into()).await;
                    }
                    Err(err) => {
                        let msg = format!("Generation timed out after {}s; {err}", deadline.as_secs());
                        return self.fail(task, sm, msg).await;
                    }
                }
            }
        }
        self.store(&task);

        if !options.run_tests {
            return self.conclude(task, sm, TaskEvent::Complete).await;
        }

        let sandbox = match self.available_sandbox().await {
            Some(sandbox) => sandbox,
            None if self.deps.worker.degraded_mode => {
                warn!("sandbox unavailable, completing without build and test");
                task.metadata.insert("degraded".into(), Value::Bool(true));
                return self.conclude(task, sm, TaskEvent::Complete).await;
            }
            None => return self.fail(task, sm, "Container sandbox unavailable".into()).await,
        };

        task.tests = self.generate_tests(&task.code, &task.description).await;

        self.advance(&mut task, &mut sm, TaskEvent::Build);
        let project = format!("{}_{}", requirements.project_name, task.short_id());
        let info = match sandbox
            .create_project(self.language, &task.code, &requirements.dependencies, Some(&project))
            .await
        {
            Ok(info) => info,
            Err(err) => return self.fail(task, sm, format!("Build failed: {err}")).await,
        };
        task.container_id = Some(info.container_id.clone());
        task.project_path = Some(info.project_path.clone());
        if !task.tests.trim().is_empty() {
            let test_file = self.template.test_file();
            if let Err(err) = sandbox.update_code(&info.container_id, &task.tests, Some(&test_file)).await {
                return self.fail(task, sm, format!("Could not write tests: {err}")).await;
            }
        }

        self.advance(&mut task, &mut sm, TaskEvent::Test);
        self.fix_loop(task, sm, &sandbox, &info.container_id).await
    }

    async fn fix_loop(
        &self,
        mut task: Task,
        mut sm: TaskStateMachine,
        sandbox: &SandboxOrchestrator,
        container: &str,
    ) -> Task {
        let max = self.deps.worker.max_iterations.max(1);
        let mut fix_ids: Vec<i64> = Vec::new();
        for iteration in 1..=max {
            task.iterations = iteration;
            self.store(&task);

            let run = if task.tests.trim().is_empty() {
                sandbox.run_code(container, None, None).await
            } else {
                sandbox.run_tests(container, None, None).await
            };
            let out = match run {
                Ok(out) => out,
                Err(err) => {
                    task.metadata.insert("fix_decisions".into(), json!(fix_ids));
                    return self.fail(task, sm, format!("Sandbox error: {err}")).await;
                }
            };
            if out.success {
                info!(iteration, "tests passed");
                task.metadata.insert("fix_decisions".into(), json!(fix_ids));
                return self.conclude(task, sm, TaskEvent::Complete).await;
            }

            let diagnostics = truncate(out.diagnostics(), MAX_DIAGNOSTIC_CHARS);
            task.push_error(format!("Iteração {iteration}: {diagnostics}"));
            if iteration == max {
                warn!(max, "iteration limit reached");
                break;
            }

            self.advance(&mut task, &mut sm, TaskEvent::Fix);
            let fix = match self.analyze_error(&task.code, &diagnostics).await {
                Some(fix) if !fix.corrected_code.trim().is_empty() => fix,
                _ => {
                    task.push_error(format!("No fix produced for iteration {iteration}"));
                    break;
                }
            };
            if fix.corrected_code.trim() == task.code.trim() {
                task.push_error("Fix produced identical code".to_string());
                break;
            }
            if let Some(id) = self.record_fix(&task, &diagnostics, &fix).await {
                fix_ids.push(id);
            }
            if let Err(err) = sandbox.update_code(container, &fix.corrected_code, None).await {
                task.metadata.insert("fix_decisions".into(), json!(fix_ids));
                return self.fail(task, sm, format!("Could not apply fix: {err}")).await;
            }
            debug!(iteration, cause = %fix.cause, "fix applied");
            task.code = fix.corrected_code;
            self.advance(&mut task, &mut sm, TaskEvent::Test);
        }
        task.metadata.insert("fix_decisions".into(), json!(fix_ids));
        self.conclude(task, sm, TaskEvent::Fail).await
    }

    async fn fail(&self, mut task: Task, sm: TaskStateMachine, error: String) -> Task {
        warn!(task_id = %task.id, error = %error, "task failed");
        self.deps.bus.log_error(&self.name, &error);
        task.push_error(error);
        self.conclude(task, sm, TaskEvent::Fail).await
    }

    /// Terminal transition plus bookkeeping: release the container
    /// reference, record metrics, learn from the outcome.
    async fn conclude(&self, mut task: Task, mut sm: TaskStateMachine, event: TaskEvent) -> Task {
        if let Some(container) = task.container_id.take() {
            task.metadata.insert("container_id".into(), Value::String(container));
        }
        self.advance(&mut task, &mut sm, event);
        PlatformMetrics::task_finished(self.language, task.state.as_str(), task.iterations);
        info!(state = %task.state, iterations = task.iterations, "task finished");

        let fix_ids: Vec<i64> = task
            .metadata
            .get("fix_decisions")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        match task.state {
            TaskState::Completed => {
                self.settle_fixes(&fix_ids, true).await;
                self.index_success(&task).await;
            }
            TaskState::Failed => {
                self.settle_fixes(&fix_ids, false).await;
                self.record_failure(&task).await;
            }
            _ => {}
        }
        self.store(&task);
        task
    }

    // -- model calls --------------------------------------------------------

    async fn call_llm(&self, request: GenerateRequest) -> LlmResponse {
        self.deps
            .bus
            .log_llm_call(&self.name, self.deps.llm.model(), request.prompt.len());
        let resp = self.deps.llm.generate(request).await;
        self.deps
            .bus
            .log_llm_response(&self.name, &resp.model, resp.success, resp.tokens_used);
        resp
    }

    /// `None` when `deadline` expires first. The request keeps running in
    /// its own task and its output is dropped.
    async fn call_llm_within(&self, request: GenerateRequest, deadline: Duration) -> Option<LlmResponse> {
        self.deps
            .bus
            .log_llm_call(&self.name, self.deps.llm.model(), request.prompt.len());
        let llm = self.deps.llm.clone();
        let call = tokio::spawn(async move { llm.generate(request).await });
        let resp = match tokio::time::timeout(deadline, call).await {
            Err(_) => return None,
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => LlmResponse {
                model: self.deps.llm.model().to_string(),
                error: Some(err.to_string()),
                ..Default::default()
            },
        };
        self.deps
            .bus
            .log_llm_response(&self.name, &resp.model, resp.success, resp.tokens_used);
        Some(resp)
    }

    pub async fn analyze_requirements(&self, description: &str) -> Requirements {
        let request = GenerateRequest::new(prompts::analyze_requirements(self.template, description))
            .with_system(prompts::system_prompt(self.language))
            .with_temperature(0.2);
        let resp = self.call_llm(request).await;
        if !resp.success {
            return Requirements::fallback(self.template);
        }
        Requirements::parse(&resp.content, self.template).unwrap_or_else(|| {
            debug!("unparseable analysis, using defaults");
            Requirements::fallback(self.template)
        })
    }

    async fn generate_code(
        &self,
        task: &Task,
        requirements: &Requirements,
        use_rag: bool,
        deadline: Duration,
    ) -> Generated {
        let examples = if use_rag {
            self.retrieval_context(&task.description).await
        } else {
            String::new()
        };
        let context = task.metadata.get("context").and_then(Value::as_str).unwrap_or("");
        let prompt = prompts::generate_code(self.language, &task.description, context, &examples);
        let request = GenerateRequest::new(prompt).with_system(prompts::system_prompt(self.language));
        let Some(resp) = self.call_llm_within(request, deadline).await else {
            return Generated::TimedOut;
        };
        if !resp.success {
            return Generated::Failed(format!(
                "LLM unavailable: {}",
                resp.error.unwrap_or_else(|| "no response".into())
            ));
        }

        let mut code = extract_code(&resp.content, self.language);
        if code.trim().chars().count() < self.deps.worker.min_output_chars {
            debug!(chars = code.trim().len(), "short generation, retrying with explicit prompt");
            let features = if requirements.features.is_empty() {
                vec![task.description.clone()]
            } else {
                requirements.features.clone()
            };
            let prompt = prompts::generate_explicit(self.language, &requirements.project_name, &features);
            let request = GenerateRequest::new(prompt).with_system(prompts::system_prompt(self.language));
            match self.call_llm_within(request, deadline).await {
                Some(retry) if retry.success => {
                    let retried = extract_code(&retry.content, self.language);
                    if retried.trim().len() > code.trim().len() {
                        code = retried;
                    }
                }
                Some(_) => {}
                None if code.trim().is_empty() => return Generated::TimedOut,
                None => {}
            }
        }
        if code.trim().is_empty() {
            return Generated::Failed("LLM returned an empty response".into());
        }
        self.deps.bus.log_code_gen(&self.name, self.language, code.len());
        Generated::Code(code)
    }

    /// Empty when the model gives nothing usable; the main entry point is
    /// then run instead of a test suite.
    pub async fn generate_tests(&self, code: &str, description: &str) -> String {
        let request = GenerateRequest::new(prompts::generate_tests(self.template, code, description))
            .with_system(Persona::Tester.system_prompt());
        let resp = self.call_llm(request).await;
        if !resp.success {
            return String::new();
        }
        extract_code(&resp.content, self.language)
    }

    pub async fn analyze_error(&self, code: &str, error: &str) -> Option<FixSuggestion> {
        let hints = self.known_fixes(error).await;
        let error_text = if hints.is_empty() {
            error.to_string()
        } else {
            format!(
                "{error}\n\nFixes that worked for similar errors:\n- {}",
                hints.join("\n- ")
            )
        };
        let request = GenerateRequest::new(prompts::analyze_error(self.language, code, &error_text))
            .with_system(Persona::Debugger.system_prompt())
            .with_temperature(0.2);
        let resp = self.call_llm(request).await;
        if !resp.success {
            return None;
        }
        FixSuggestion::parse(&resp.content, self.language)
    }

    async fn split_fallback(&self, task: &mut Task, requirements: &Requirements) -> Result<SplitOutcome, String> {
        let split = self
            .split
            .get()
            .ok_or_else(|| "no split executor attached".to_string())?;
        let outcome = split
            .run(SplitRequest {
                description: task.description.clone(),
                features: requirements.features.clone(),
                preferred: Some(self.language.to_string()),
                excluded: self.deps.split.exclude_origin.then(|| self.language.to_string()),
                depth: fallback_depth(task),
            })
            .await
            .map_err(|e| e.to_string())?;
        task.metadata.insert("fallback_depth".into(), json!(outcome.depth));
        let parts: Vec<Value> = outcome
            .parts
            .iter()
            .map(|p| json!({ "index": p.index, "language": p.language, "success": p.success }))
            .collect();
        task.metadata.insert("split_parts".into(), Value::Array(parts));
        Ok(outcome)
    }

    // -- collaborators ------------------------------------------------------

    async fn available_sandbox(&self) -> Option<Arc<SandboxOrchestrator>> {
        let sandbox = self.deps.sandbox.as_ref()?;
        sandbox.docker_available().await.then(|| Arc::clone(sandbox))
    }

    async fn retrieval_context(&self, query: &str) -> String {
        let Some(index) = &self.deps.retrieval else {
            return String::new();
        };
        let lang_index = match index.for_language(self.language).await {
            Ok(i) => i,
            Err(err) => {
                warn!(error = %err, "retrieval unavailable");
                return String::new();
            }
        };
        lang_index.context_for_prompt(query, 3).await.unwrap_or_else(|err| {
            warn!(error = %err, "retrieval query failed");
            String::new()
        })
    }

    async fn index_success(&self, task: &Task) {
        let Some(index) = &self.deps.retrieval else { return };
        if task.code.trim().is_empty() {
            return;
        }
        let mut meta = Map::new();
        meta.insert("task_id".into(), Value::String(task.id.to_string()));
        meta.insert("iterations".into(), json!(task.iterations));
        let result = match index.for_language(self.language).await {
            Ok(li) => li
                .index_code(&task.code, &task.description, Some(&task.id.to_string()), Some(meta))
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(error = %err, "could not index generated code");
        }
    }

    fn decision_context(&self, kind: &str, message: &str) -> DecisionContext {
        DecisionContext::new(DECISION_APP, &self.name, kind, truncate(message, 500))
    }

    async fn known_fixes(&self, error: &str) -> Vec<String> {
        let Some(memory) = &self.deps.memory else {
            return Vec::new();
        };
        match memory.recommend(&self.decision_context("test_failure", error), 3).await {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.outcome == Outcome::Success && !r.decision.is_empty())
                .map(|r| r.decision)
                .collect(),
            Err(err) => {
                warn!(error = %err, "decision recall failed");
                Vec::new()
            }
        }
    }

    async fn record_fix(&self, task: &Task, error: &str, fix: &FixSuggestion) -> Option<i64> {
        let memory = self.deps.memory.as_ref()?;
        let decision = if fix.fix_suggestion.is_empty() {
            fix.cause.clone()
        } else {
            fix.fix_suggestion.clone()
        };
        let record = NewDecision::new(self.decision_context("test_failure", error), "code_fix", decision)
            .reasoning(fix.cause.clone())
            .confidence(0.5)
            .context_data(json!({ "task_id": task.id.to_string(), "iteration": task.iterations }));
        memory
            .record(record)
            .await
            .map_err(|err| warn!(error = %err, "could not record fix decision"))
            .ok()
    }

    async fn settle_fixes(&self, ids: &[i64], completed: bool) {
        let Some(memory) = &self.deps.memory else { return };
        // only the last fix made the tests pass
        for (i, id) in ids.iter().enumerate() {
            let success = completed && i + 1 == ids.len();
            let outcome = if success { Outcome::Success } else { Outcome::Failure };
            if let Err(err) = memory.patch_outcome(*id, outcome, None, None).await {
                warn!(id, error = %err, "could not patch fix decision");
            }
            let record = match memory.get(*id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(id, error = %err, "could not load fix decision");
                    continue;
                }
            };
            let pattern = json!({
                "language": self.language,
                "error_signature": record.error_signature,
                "decision": record.decision,
            });
            if let Err(err) = memory.learn_pattern("code_fix", &pattern, success).await {
                warn!(id, error = %err, "could not update fix pattern");
            }
        }
    }

    async fn record_failure(&self, task: &Task) {
        let Some(memory) = &self.deps.memory else { return };
        let last = task.last_error().unwrap_or("unknown error");
        let record = NewDecision::new(self.decision_context("task_failed", last), "task_failed", "give_up")
            .reasoning(format!("failed after {} iterations", task.iterations))
            .confidence(1.0)
            .context_data(json!({
                "task_id": task.id.to_string(),
                "description": truncate(&task.description, 500),
                "errors": task.errors.len(),
            }));
        match memory.record(record).await {
            Ok(id) => {
                if let Err(err) = memory.patch_outcome(id, Outcome::Failure, None, None).await {
                    warn!(error = %err, "could not patch failure decision");
                }
            }
            Err(err) => warn!(error = %err, "could not record failure decision"),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("tasks", &self.tasks.read().map(|t| t.len()).unwrap_or(0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python() -> &'static LanguageTemplate {
        language::template("python").unwrap()
    }

    #[test]
    fn requirements_parse_tolerates_prose_and_gaps() {
        let resp = "Sure!\n{\"project_name\": \"calc\", \"features\": [\"add\"]}\nDone.";
        let req = Requirements::parse(resp, python()).unwrap();
        assert_eq!(req.project_name, "calc");
        assert_eq!(req.features, vec!["add"]);
        assert_eq!(req.files_needed, vec!["main.py"]);
        assert_eq!(req.estimated_complexity, "medium");
    }

    #[test]
    fn requirements_parse_rejects_garbage() {
        assert!(Requirements::parse("no json here", python()).is_none());
        assert!(Requirements::parse("{\"features\": 3}", python()).is_none());
        let fallback = Requirements::fallback(python());
        assert_eq!(fallback.project_name, "project");
        assert!(fallback.dependencies.is_empty());
    }

    #[test]
    fn fix_parse_accepts_json_or_bare_code() {
        let fix = FixSuggestion::parse(
            r#"{"cause": "typo", "fix_suggestion": "rename", "corrected_code": "```python\nx = 1\n```"}"#,
            "python",
        )
        .unwrap();
        assert_eq!(fix.cause, "typo");
        assert_eq!(fix.corrected_code, "x = 1");

        let fix = FixSuggestion::parse("```python\ndef f():\n    return 2\n```", "python").unwrap();
        assert!(fix.corrected_code.starts_with("def f"));
        assert!(FixSuggestion::parse("   ", "python").is_none());
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn unknown_language_is_rejected() {
        let deps = WorkerDeps::new(
            LlmClient::new(Arc::new(cs_intelligence::MockProvider::new())),
            EventBus::new(),
        );
        assert!(matches!(Worker::new("cobol", deps.clone()), Err(WorkerError::UnsupportedLanguage(_))));
        assert_eq!(Worker::new("py", deps).unwrap().name(), "python_agent");
    }
}
