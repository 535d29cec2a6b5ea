//! LLM provider abstraction.
//!
//! [`LlmProvider`] is the transport seam (Ollama-compatible HTTP in
//! production, [`MockProvider`] in tests). [`LlmClient`] sits on top and
//! never fails: every call returns an [`LlmResponse`] envelope with
//! `success = false` and the error text when the provider errors, leaving
//! policy to the caller.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use cs_harness::retry::{with_retry, RetryPolicy, Retryable};
use cs_telemetry::metrics::PlatformMetrics;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Connection failure, DNS, TLS, etc.
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::HttpError(_) | LlmError::Timeout | LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => *status >= 500,
            LlmError::ParseError(_) | LlmError::Unsupported(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }
}

/// Sampling parameters sent as Ollama `options`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 8192,
            top_p: 0.9,
            repeat_penalty: 1.1,
        }
    }
}

impl From<&cs_core::config::LlmConfig> for SamplingOptions {
    fn from(cfg: &cs_core::config::LlmConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            top_p: cfg.top_p,
            repeat_penalty: cfg.repeat_penalty,
        }
    }
}

/// One generation request. Unset fields fall back to provider defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Use this model instead of the provider's configured one.
    pub model: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Raw provider output.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
}

/// Result envelope handed to callers of [`LlmClient`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl LlmResponse {
    /// Successful but blank output.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, LlmError>;

    async fn chat(
        &self,
        messages: &[LlmMessage],
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<Completion, LlmError>;

    async fn list_models(&self) -> Result<Vec<String>, LlmError>;

    /// The configured default model name.
    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OllamaProvider
// ---------------------------------------------------------------------------

/// Provider for an Ollama-compatible server (`/api/generate`, `/api/chat`,
/// `/api/tags`).
///
/// On an HTTP error status the request is repeated once against the
/// fallback model, when one is configured.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    fallback_model: Option<String>,
    options: SamplingOptions,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            fallback_model: None,
            options: SamplingOptions::default(),
        }
    }

    pub fn from_config(cfg: &cs_core::config::LlmConfig) -> Self {
        let mut provider = Self::new(
            cfg.base_url.clone(),
            cfg.model.clone(),
            Duration::from_secs(cfg.timeout_secs.max(1)),
        );
        provider.fallback_model = cfg.fallback_model.clone().filter(|m| !m.is_empty());
        provider.options = SamplingOptions::from(cfg);
        provider
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: SamplingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn build_generate_body(&self, request: &GenerateRequest, model: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature.unwrap_or(self.options.temperature),
                "num_predict": request.max_tokens.unwrap_or(self.options.max_tokens),
                "top_p": self.options.top_p,
                "repeat_penalty": self.options.repeat_penalty,
            },
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::Value::String(system.clone());
        }
        body
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else if e.is_connect() {
                LlmError::HttpError(format!(
                    "cannot connect to LLM server at {}: {}",
                    self.base_url, e
                ))
            } else {
                LlmError::HttpError(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status,
                message: text,
            });
        }
        resp.json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))
    }

    async fn generate_with_model(
        &self,
        request: &GenerateRequest,
        model: &str,
    ) -> Result<Completion, LlmError> {
        let body = self.build_generate_body(request, model);
        let json: OllamaGenerateResponse = serde_json::from_value(
            self.post_json("/api/generate", &body).await?,
        )
        .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(Completion {
            content: json.response,
            model: json.model.unwrap_or_else(|| model.to_string()),
            tokens_used: json.eval_count.unwrap_or(0),
        })
    }

    async fn chat_with_model(
        &self,
        messages: &[LlmMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<Completion, LlmError> {
        let mut api_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            api_messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for msg in messages {
            api_messages.push(serde_json::json!({
                "role": msg.role.to_string(),
                "content": msg.content,
            }));
        }
        let body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": false,
            "options": {
                "temperature": self.options.temperature,
                "num_predict": self.options.max_tokens,
            },
        });
        let json: OllamaChatResponse =
            serde_json::from_value(self.post_json("/api/chat", &body).await?)
                .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(Completion {
            content: json.message.map(|m| m.content).unwrap_or_default(),
            model: json.model.unwrap_or_else(|| model.to_string()),
            tokens_used: json.eval_count.unwrap_or(0),
        })
    }

    fn fallback_for(&self, err: &LlmError, used: &str) -> Option<&str> {
        match (err, self.fallback_model.as_deref()) {
            (LlmError::ApiError { .. }, Some(fallback)) if fallback != used => Some(fallback),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    model: Option<String>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaChatMessage>,
    model: Option<String>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Deserialize)]
struct OllamaTag {
    name: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        match self.generate_with_model(request, model).await {
            Ok(c) => Ok(c),
            Err(err) => match self.fallback_for(&err, model) {
                Some(fallback) => {
                    warn!(model, fallback, error = %err, "primary model failed, using fallback");
                    self.generate_with_model(request, fallback).await
                }
                None => Err(err),
            },
        }
    }

    async fn chat(
        &self,
        messages: &[LlmMessage],
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<Completion, LlmError> {
        let model = model.unwrap_or(&self.model);
        match self.chat_with_model(messages, system, model).await {
            Ok(c) => Ok(c),
            Err(err) => match self.fallback_for(&err, model) {
                Some(fallback) => {
                    warn!(model, fallback, error = %err, "primary model failed, using fallback");
                    self.chat_with_model(messages, system, fallback).await
                }
                None => Err(err),
            },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(LlmError::ApiError {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let tags: OllamaTags = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&CapturedCall) -> String + Send + Sync>;

struct MockReply {
    delay: Option<Duration>,
    result: Result<String, LlmError>,
}

/// One request seen by [`MockProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCall {
    pub prompt: String,
    pub system: Option<String>,
    pub model: String,
}

/// A mock LLM provider for testing.
///
/// Each call pops the next queued reply (optionally delayed). Once the queue
/// is empty the responder closure, or a fixed default, answers.
pub struct MockProvider {
    model: String,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    responder: Option<Responder>,
    default_reply: String,
    captured: Arc<Mutex<Vec<CapturedCall>>>,
    models: Vec<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            responder: None,
            default_reply: "Mock response".to_string(),
            captured: Arc::new(Mutex::new(Vec::new())),
            models: vec!["mock-model".to_string()],
        }
    }

    pub fn with_response(self, content: impl Into<String>) -> Self {
        self.push(None, Ok(content.into()));
        self
    }

    /// Queue a reply that is returned after `delay`.
    pub fn with_delayed_response(self, delay: Duration, content: impl Into<String>) -> Self {
        self.push(Some(delay), Ok(content.into()));
        self
    }

    pub fn with_error(self, error: LlmError) -> Self {
        self.push(None, Err(error));
        self
    }

    pub fn with_default(mut self, content: impl Into<String>) -> Self {
        self.default_reply = content.into();
        self
    }

    /// Answer unqueued calls by inspecting the request.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&CapturedCall) -> String + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    fn push(&self, delay: Option<Duration>, result: Result<String, LlmError>) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(MockReply { delay, result });
    }

    pub fn captured_requests(&self) -> Vec<CapturedCall> {
        self.captured
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn answer(&self, call: CapturedCall) -> Result<Completion, LlmError> {
        self.captured
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call.clone());
        let queued = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        let result = match queued {
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    tokio::time::sleep(delay).await;
                }
                reply.result
            }
            None => Ok(match &self.responder {
                Some(f) => f(&call),
                None => self.default_reply.clone(),
            }),
        };
        result.map(|content| Completion {
            tokens_used: content.split_whitespace().count() as u64,
            content,
            model: call.model,
        })
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, LlmError> {
        self.answer(CapturedCall {
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
        })
        .await
    }

    async fn chat(
        &self,
        messages: &[LlmMessage],
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<Completion, LlmError> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.answer(CapturedCall {
            prompt,
            system: system.map(str::to_string),
            model: model.unwrap_or(&self.model).to_string(),
        })
        .await
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.models.clone())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// Envelope-returning wrapper used by workers and the coordinator.
///
/// Transient provider errors are retried per the client's [`RetryPolicy`]
/// (one retry by default) before the failure is reported.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default().with_max_retries(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_config(cfg: &cs_core::config::LlmConfig) -> Self {
        Self::new(Arc::new(OllamaProvider::from_config(cfg)))
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub async fn generate(&self, request: GenerateRequest) -> LlmResponse {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.provider.model().to_string());
        debug!(model = %model, prompt_chars = request.prompt.len(), "llm generate");
        let started = Instant::now();
        let provider = &self.provider;
        let request = &request;
        let result = with_retry(&self.retry, "llm.generate", || provider.generate(request)).await;
        Self::envelope(result, model, started)
    }

    pub async fn chat(
        &self,
        messages: &[LlmMessage],
        system: Option<&str>,
        model: Option<&str>,
    ) -> LlmResponse {
        let model_name = model.unwrap_or(self.provider.model()).to_string();
        let started = Instant::now();
        let provider = &self.provider;
        let result = with_retry(&self.retry, "llm.chat", || {
            provider.chat(messages, system, model)
        })
        .await;
        Self::envelope(result, model_name, started)
    }

    fn envelope(
        result: Result<Completion, LlmError>,
        requested_model: String,
        started: Instant,
    ) -> LlmResponse {
        let elapsed = started.elapsed();
        match result {
            Ok(c) => {
                PlatformMetrics::llm_call(&c.model, true, elapsed.as_secs_f64(), c.tokens_used);
                LlmResponse {
                    content: c.content,
                    model: c.model,
                    tokens_used: c.tokens_used,
                    success: true,
                    error: None,
                    elapsed_ms: elapsed.as_millis() as u64,
                }
            }
            Err(err) => {
                warn!(model = %requested_model, error = %err, "llm call failed");
                PlatformMetrics::llm_call(&requested_model, false, elapsed.as_secs_f64(), 0);
                LlmResponse {
                    content: String::new(),
                    model: requested_model,
                    tokens_used: 0,
                    success: false,
                    error: Some(err.to_string()),
                    elapsed_ms: elapsed.as_millis() as u64,
                }
            }
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        self.provider.list_models().await
    }

    /// True when the server answers `/api/tags`.
    pub async fn check_connection(&self) -> bool {
        self.provider.list_models().await.is_ok()
    }
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("model", &self.provider.model())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
