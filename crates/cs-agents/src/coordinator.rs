//! Autonomous retry loop above the registry.
//!
//! A failed run is retried with progressively richer context: web research
//! first, then a simulated user clarification. When retries are exhausted
//! a terminal-looking failure is sent to a peer fix service, and finally a
//! human is notified out of band.
//!
//! Each escalation step that leads to a rerun is filed in decision memory
//! as an `escalation` decision; its outcome is the rerun's success, and the
//! `(step, language)` pair feeds the learned `escalation` patterns.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use cs_api_types::DevelopResponse;
use cs_core::config::{Config, CoordinatorConfig};
use cs_core::decision_memory::{DecisionContext, NewDecision, Outcome};
use cs_intelligence::research::{format_for_prompt, save_to_index};
use cs_intelligence::{DuckDuckGo, LlmMessage, WebSearch};
use cs_telemetry::metrics::PlatformMetrics;
use cs_telemetry::tracing_setup::coordinator_span;

use crate::escalation::{
    is_trivial_reply, latest_errors_are_terminal, notifier_from_config, wait_for_reply, Notifier,
    PeerFixClient, ReplyTrainer,
};
use crate::prompts::{self, Persona};
use crate::registry::{AgentRegistry, DevelopResult, RegistryError};
use crate::worker::{ExecuteOptions, DECISION_APP};

/// Final outcome of a coordinated run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorResult {
    pub success: bool,
    pub task_id: Option<Uuid>,
    pub code: String,
    pub tests: String,
    pub iterations: u32,
    pub errors: Vec<String>,
    pub attempts: u32,
    pub requires_user: bool,
    pub research: Vec<String>,
    pub simulated_user_response: Option<String>,
    pub peer_suggestion: Option<String>,
    pub notify_result: Option<Value>,
}

impl CoordinatorResult {
    fn absorb(&mut self, run: &DevelopResult) {
        self.attempts += 1;
        self.success = run.success;
        self.task_id = Some(run.task_id);
        self.code = run.code.clone();
        self.tests = run.tests.clone();
        self.iterations = run.iterations;
        self.errors = run.errors.clone();
    }

    pub fn to_response(&self) -> DevelopResponse {
        DevelopResponse {
            task_id: self.task_id.map(|id| id.to_string()),
            status: if self.success { "completed" } else { "failed" }.to_string(),
            code: self.code.clone(),
            tests: self.tests.clone(),
            iterations: self.iterations,
            errors: self.errors.clone(),
            success: self.success,
            attempts: self.attempts,
            requires_user: self.requires_user,
            research: self.research.clone(),
            simulated_user_response: self.simulated_user_response.clone(),
            notify_result: self.notify_result.clone(),
        }
    }
}

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    config: CoordinatorConfig,
    search: Option<Arc<dyn WebSearch>>,
    max_search_results: usize,
    notifier: Option<Arc<dyn Notifier>>,
    peer: Option<PeerFixClient>,
    trainer: Option<ReplyTrainer>,
    simulator_model: Option<String>,
    backoff: Duration,
}

impl Coordinator {
    pub fn new(registry: Arc<AgentRegistry>, config: CoordinatorConfig) -> Self {
        Self {
            registry,
            config,
            search: None,
            max_search_results: 5,
            notifier: None,
            peer: None,
            trainer: None,
            simulator_model: None,
            backoff: Duration::ZERO,
        }
    }

    /// Wire every collaborator the configuration enables.
    pub fn from_config(registry: Arc<AgentRegistry>, cfg: &Config) -> Self {
        let mut trainer = ReplyTrainer::new(&cfg.escalation.train_file);
        if let Some(retrieval) = registry.deps().retrieval.clone() {
            trainer = trainer.with_retrieval(retrieval);
        }
        let mut coordinator = Self::new(registry, cfg.coordinator.clone())
            .with_search(Arc::new(DuckDuckGo::from_config(&cfg.research)), cfg.research.max_results)
            .with_trainer(trainer)
            .with_user_simulator_model(cfg.escalation.user_simulator_model.clone())
            .with_backoff(Duration::from_secs(1));
        if let Some(notifier) = notifier_from_config(&cfg.escalation) {
            coordinator = coordinator.with_notifier(notifier);
        }
        if let Some(peer) = PeerFixClient::from_config(&cfg.escalation) {
            coordinator = coordinator.with_peer_fix(peer);
        }
        coordinator
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>, max_results: usize) -> Self {
        self.search = Some(search);
        self.max_search_results = max_results.max(1);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_peer_fix(mut self, peer: PeerFixClient) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_trainer(mut self, trainer: ReplyTrainer) -> Self {
        self.trainer = Some(trainer);
        self
    }

    pub fn with_user_simulator_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.simulator_model = (!model.trim().is_empty()).then_some(model);
        self
    }

    /// Linear delay between attempts (`backoff * retry_number`).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run `description` to completion or escalation. Only invalid input
    /// (an unsupported language) is returned as `Err`.
    pub async fn develop(
        &self,
        description: &str,
        language: &str,
        options: ExecuteOptions,
    ) -> Result<CoordinatorResult, RegistryError> {
        // reject bad input before any side effect
        self.registry.worker(language)?;
        let span = coordinator_span(language);
        self.run(description, language, options).instrument(span).await
    }

    async fn run(
        &self,
        description: &str,
        language: &str,
        options: ExecuteOptions,
    ) -> Result<CoordinatorResult, RegistryError> {
        let bus = &self.registry.deps().bus;
        let max_attempts = self.config.max_retries + 1;
        let mut result = CoordinatorResult::default();

        bus.log_coordinator(
            "start",
            json!({ "language": language, "max_attempts": max_attempts }),
        );
        let first = self.attempt(description, language, options, 1).await?;
        result.absorb(&first);

        while !result.success && result.attempts < max_attempts {
            let retry = result.attempts;
            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff * retry).await;
            }
            let (step, augmentation) = if retry == 1 {
                ("research", self.research(description, language, &mut result).await)
            } else {
                ("simulate_user", self.simulate_user(description, language, &mut result).await)
            };
            let augmented = format!("{description}\n\n{augmentation}");
            self.escalated_attempt(step, &augmented, language, options, &mut result)
                .await?;
        }

        if !result.success && latest_errors_are_terminal(&result.errors) {
            if let Some(suggestion) = self.peer_fix(language, &result.errors).await {
                result.peer_suggestion = Some(suggestion.clone());
                let augmented = format!("{description}\n\nSuggested fix from a peer agent:\n{suggestion}");
                self.escalated_attempt("peer_fix", &augmented, language, options, &mut result)
                    .await?;
            }
        }

        if !result.success {
            self.notify_user(description, language, options, &mut result).await?;
        }

        result.requires_user = !result.success;
        bus.log_coordinator(
            "finish",
            json!({
                "success": result.success,
                "attempts": result.attempts,
                "requires_user": result.requires_user,
            }),
        );
        info!(
            success = result.success,
            attempts = result.attempts,
            requires_user = result.requires_user,
            "coordinated run finished"
        );
        Ok(result)
    }

    async fn attempt(
        &self,
        description: &str,
        language: &str,
        options: ExecuteOptions,
        number: u32,
    ) -> Result<DevelopResult, RegistryError> {
        let mut metadata = Map::new();
        metadata.insert("attempt".into(), Value::from(number));
        let run = self
            .registry
            .develop(description, language, options, metadata)
            .await?;
        self.registry.deps().bus.log_coordinator(
            "attempt",
            json!({
                "attempt": number,
                "task_id": run.task_id.to_string(),
                "success": run.success,
                "errors": run.errors.len(),
            }),
        );
        Ok(run)
    }

    async fn research(&self, description: &str, language: &str, result: &mut CoordinatorResult) -> String {
        let Some(search) = &self.search else {
            return error_context(&result.errors);
        };
        PlatformMetrics::escalation("research");
        let top: Vec<&str> = result.errors.iter().rev().take(3).map(String::as_str).collect();
        let query = format!("{description}\nErrors: {}", top.join("; "));
        let hits = match search.search(&query, self.max_search_results).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "web research failed");
                Vec::new()
            }
        };
        self.registry.deps().bus.log_coordinator(
            "research",
            json!({ "query": query, "results": hits.len() }),
        );
        if hits.is_empty() {
            return error_context(&result.errors);
        }

        if let Some(retrieval) = &self.registry.deps().retrieval {
            let indexed = match retrieval.for_language(language).await {
                Ok(index) => save_to_index(&index, &hits, &query).await,
                Err(err) => Err(err),
            };
            if let Err(err) = indexed {
                warn!(error = %err, "could not index research results");
            }
        }
        result.research = hits.iter().map(|h| h.summary()).collect();
        format_for_prompt(&hits, &query)
    }

    async fn simulate_user(&self, description: &str, language: &str, result: &mut CoordinatorResult) -> String {
        PlatformMetrics::escalation("simulate_user");
        let prompt = prompts::simulate_user(description, &result.errors);
        let reply = self
            .registry
            .deps()
            .llm
            .chat(
                &[LlmMessage::user(prompt.clone())],
                Some(Persona::UserSimulator.system_prompt()),
                self.simulator_model.as_deref(),
            )
            .await;
        let text = reply.content.trim().to_string();
        self.registry.deps().bus.log_coordinator(
            "simulate_user",
            json!({ "success": reply.success, "reply_chars": text.len() }),
        );
        if !reply.success || is_trivial_reply(&text) {
            return error_context(&result.errors);
        }
        if let Some(trainer) = &self.trainer {
            trainer.remember(language, &prompt, &text, "user_simulator").await;
        }
        result.simulated_user_response = Some(text.clone());
        format!("Clarification from the user:\n{text}")
    }

    async fn peer_fix(&self, language: &str, errors: &[String]) -> Option<String> {
        let peer = self.peer.as_ref()?;
        PlatformMetrics::escalation("peer_fix");
        let recent: Vec<String> = errors.iter().rev().take(3).rev().cloned().collect();
        let outcome = peer.request_fix(&recent, language).await;
        self.registry.deps().bus.log_coordinator(
            "peer_fix",
            json!({ "success": outcome.is_ok() }),
        );
        match outcome {
            Ok(suggestion) => Some(suggestion),
            Err(err) => {
                warn!(error = %err, "peer fix unavailable");
                None
            }
        }
    }

    async fn notify_user(
        &self,
        description: &str,
        language: &str,
        options: ExecuteOptions,
        result: &mut CoordinatorResult,
    ) -> Result<(), RegistryError> {
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };
        PlatformMetrics::escalation("notify");
        let message = prompts::escalation_message(description, &result.errors);
        if let Err(err) = notifier.send(&message).await {
            warn!(channel = notifier.channel(), error = %err, "escalation notice failed");
            result.notify_result = Some(json!({
                "channel": notifier.channel(),
                "sent": false,
                "error": err.to_string(),
            }));
            return Ok(());
        }

        let reply = wait_for_reply(
            notifier.as_ref(),
            Duration::from_secs(self.config.user_reply_timeout_secs),
            Duration::from_secs(self.config.reply_poll_interval_secs.max(1)),
        )
        .await;
        self.registry.deps().bus.log_coordinator(
            "notify",
            json!({ "channel": notifier.channel(), "replied": reply.is_some() }),
        );
        result.notify_result = Some(json!({
            "channel": notifier.channel(),
            "sent": true,
            "reply": reply,
        }));

        let Some(reply) = reply.filter(|r| !is_trivial_reply(r)) else {
            return Ok(());
        };
        if let Some(trainer) = &self.trainer {
            let prompt = prompts::simulate_user(description, &result.errors);
            if let Err(err) = trainer.record(language, &prompt, &reply).await {
                warn!(error = %err, "could not store reply for training");
            }
        }
        let augmented = format!("{description}\n\nClarification from the user:\n{reply}");
        self.escalated_attempt("notify", &augmented, language, options, result)
            .await
    }

    // -- decision memory ----------------------------------------------------

    /// Rerun with `augmented` and settle the decision to take `step`.
    async fn escalated_attempt(
        &self,
        step: &str,
        augmented: &str,
        language: &str,
        options: ExecuteOptions,
        result: &mut CoordinatorResult,
    ) -> Result<(), RegistryError> {
        let decision = self.record_step(step, language, result).await;
        let run = self
            .attempt(augmented, language, options, result.attempts + 1)
            .await?;
        result.absorb(&run);
        self.settle_step(decision, step, language, run.success).await;
        Ok(())
    }

    async fn record_step(&self, step: &str, language: &str, result: &CoordinatorResult) -> Option<i64> {
        let memory = self.registry.deps().memory.as_ref()?;
        let last = result.errors.last().map(String::as_str).unwrap_or("unknown error");
        let message: String = last.chars().take(500).collect();
        let context = DecisionContext::new(DECISION_APP, "coordinator", "task_failed", message);
        let record = NewDecision::new(context, "escalation", step)
            .reasoning(format!("attempt {} failed", result.attempts))
            .confidence(0.5)
            .context_data(json!({
                "language": language,
                "attempt": result.attempts + 1,
                "task_id": result.task_id.map(|id| id.to_string()),
            }));
        memory
            .record(record)
            .await
            .map_err(|err| warn!(step, error = %err, "could not record escalation decision"))
            .ok()
    }

    async fn settle_step(&self, decision: Option<i64>, step: &str, language: &str, success: bool) {
        let Some(memory) = &self.registry.deps().memory else { return };
        if let Some(id) = decision {
            let outcome = if success { Outcome::Success } else { Outcome::Failure };
            if let Err(err) = memory.patch_outcome(id, outcome, None, None).await {
                warn!(id, error = %err, "could not patch escalation decision");
            }
        }
        let pattern = json!({ "step": step, "language": language });
        if let Err(err) = memory.learn_pattern("escalation", &pattern, success).await {
            warn!(step, error = %err, "could not update escalation pattern");
        }
    }
}

fn error_context(errors: &[String]) -> String {
    if errors.is_empty() {
        return "A previous attempt failed without error output.".to_string();
    }
    let recent: Vec<&str> = errors.iter().rev().take(3).map(String::as_str).collect();
    format!("A previous attempt failed with:\n- {}", recent.join("\n- "))
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("search", &self.search.is_some())
            .field("notifier", &self.notifier.as_ref().map(|n| n.channel()))
            .field("peer", &self.peer.is_some())
            .finish()
    }
}
