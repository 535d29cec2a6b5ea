//! Escalation collaborators used by the coordinator once automated retries
//! are exhausted: the peer fix service, out-of-band notification with reply
//! polling, and persistence of replies as training data.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use cs_core::config::EscalationConfig;
use cs_intelligence::RetrievalIndex;

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("http error: {0}")]
    Http(String),
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("unexpected response from {0}")]
    Malformed(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for EscalationError {
    fn from(err: reqwest::Error) -> Self {
        EscalationError::Http(err.to_string())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

async fn check_status(service: &'static str, resp: reqwest::Response) -> Result<reqwest::Response, EscalationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(EscalationError::Status {
        service,
        status: status.as_u16(),
        body: body.chars().take(300).collect(),
    })
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

const TERMINAL_SUBSTRINGS: &[&str] = &[
    "modulenotfounderror",
    "importerror",
    "permission denied",
    "command not found",
    "no such file or directory",
    "connection refused",
    "traceback",
    "segmentation fault",
    "out of memory",
    "killed",
];

fn terminal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"exit code \d+|exited with (code|status) \d+|errno \d+")
            .expect("terminal error regex is valid")
    })
}

/// True when `text` looks like a failure the sandbox cannot recover from
/// on its own.
pub fn is_terminal_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    TERMINAL_SUBSTRINGS.iter().any(|s| lower.contains(s)) || terminal_re().is_match(&lower)
}

/// Only the most recent errors are considered.
pub fn latest_errors_are_terminal(errors: &[String]) -> bool {
    errors.iter().rev().take(3).any(|e| is_terminal_error(e))
}

/// Replies that carry no information.
pub fn is_trivial_reply(reply: &str) -> bool {
    let normalized = reply.trim().trim_end_matches(['.', '!']).to_lowercase();
    normalized.chars().count() < 3
        || matches!(
            normalized.as_str(),
            "nao sei" | "não sei" | "i don't know" | "i dont know" | "don't know"
        )
}

// ---------------------------------------------------------------------------
// Peer fix
// ---------------------------------------------------------------------------

/// Client for another agent deployment's `POST /agent/fix`.
#[derive(Debug, Clone)]
pub struct PeerFixClient {
    client: reqwest::Client,
    base_url: String,
}

impl PeerFixClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &EscalationConfig) -> Option<Self> {
        cfg.agents_api
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(|url| Self::new(url, Duration::from_secs(cfg.http_timeout_secs)))
    }

    /// Returns the peer's suggestion text.
    pub async fn request_fix(&self, errors: &[String], context: &str) -> Result<String, EscalationError> {
        let url = format!("{}/agent/fix", self.base_url);
        let body = json!({ "type": "terminal_error", "errors": errors, "context": context });
        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = check_status("peer fix", resp).await?;
        let value: Value = resp.json().await?;
        value
            .get("suggestion")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .ok_or(EscalationError::Malformed("peer fix"))
    }
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn send(&self, message: &str) -> Result<(), EscalationError>;

    /// A reply received since the last `send`, if any.
    async fn poll_reply(&self) -> Result<Option<String>, EscalationError>;
}

/// Poll `notifier` every `interval` until a reply arrives or `timeout`
/// elapses. Poll errors are logged and polling continues.
pub async fn wait_for_reply(notifier: &dyn Notifier, timeout: Duration, interval: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        match notifier.poll_reply().await {
            Ok(Some(reply)) => return Some(reply),
            Ok(None) => {}
            Err(err) => warn!(channel = notifier.channel(), error = %err, "reply poll failed"),
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Telegram bot API: `sendMessage` and `getUpdates` polling filtered by
/// the admin chat.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
    offset: Mutex<Option<i64>>,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_base: "https://api.telegram.org".into(),
            token: token.into(),
            chat_id: chat_id.into(),
            offset: Mutex::new(None),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn offset(&self) -> Option<i64> {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_offset(&self, next: i64) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        if offset.map_or(true, |o| next > o) {
            *offset = Some(next);
        }
    }

    async fn updates(&self) -> Result<Vec<Value>, EscalationError> {
        let mut req = self.client.get(self.url("getUpdates")).query(&[("timeout", "0")]);
        if let Some(offset) = self.offset() {
            req = req.query(&[("offset", offset.to_string())]);
        }
        let resp = check_status("telegram", req.send().await?).await?;
        let body: Value = resp.json().await?;
        Ok(body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, message: &str) -> Result<(), EscalationError> {
        // skip anything sent before this escalation
        for update in self.updates().await? {
            if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                self.set_offset(id + 1);
            }
        }
        let body = json!({ "chat_id": self.chat_id, "text": message });
        let resp = self.client.post(self.url("sendMessage")).json(&body).send().await?;
        check_status("telegram", resp).await?;
        info!(chat = %self.chat_id, "escalation sent via telegram");
        Ok(())
    }

    async fn poll_reply(&self) -> Result<Option<String>, EscalationError> {
        let mut reply = None;
        for update in self.updates().await? {
            if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                self.set_offset(id + 1);
            }
            let Some(message) = update.get("message") else { continue };
            let chat = message
                .pointer("/chat/id")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            if chat != self.chat_id {
                continue;
            }
            if let Some(text) = message.get("text").and_then(Value::as_str) {
                if reply.is_none() {
                    reply = Some(text.to_string());
                }
            }
        }
        Ok(reply)
    }
}

/// WhatsApp through a WAHA gateway (`/api/sendText`, `/api/messages`).
pub struct WahaNotifier {
    client: reqwest::Client,
    base_url: String,
    session: String,
    chat_id: String,
    sent_at: Mutex<i64>,
}

impl WahaNotifier {
    pub fn new(base_url: impl Into<String>, session: impl Into<String>, phone: &str, timeout: Duration) -> Self {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        Self {
            client: http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: session.into(),
            chat_id: format!("{digits}@c.us"),
            sent_at: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Notifier for WahaNotifier {
    fn channel(&self) -> &'static str {
        "whatsapp"
    }

    async fn send(&self, message: &str) -> Result<(), EscalationError> {
        let url = format!("{}/api/sendText", self.base_url);
        let body = json!({ "session": self.session, "chatId": self.chat_id, "text": message });
        let resp = self.client.post(&url).json(&body).send().await?;
        check_status("waha", resp).await?;
        *self.sent_at.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now().timestamp();
        info!(chat = %self.chat_id, "escalation sent via whatsapp");
        Ok(())
    }

    async fn poll_reply(&self) -> Result<Option<String>, EscalationError> {
        let url = format!("{}/api/messages", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("session", self.session.as_str()),
                ("chatId", self.chat_id.as_str()),
                ("limit", "10"),
            ])
            .send()
            .await?;
        let resp = check_status("waha", resp).await?;
        let messages: Value = resp.json().await?;
        let since = *self.sent_at.lock().unwrap_or_else(|p| p.into_inner());
        let reply = messages.as_array().and_then(|list| {
            list.iter().find_map(|m| {
                let from_me = m.get("fromMe").and_then(Value::as_bool).unwrap_or(false);
                let ts = m.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
                if from_me || ts < since {
                    return None;
                }
                m.get("body").and_then(Value::as_str).map(str::to_string)
            })
        });
        Ok(reply)
    }
}

/// Telegram when a bot token and admin chat are set, WhatsApp when a WAHA
/// gateway and phone are set, otherwise nothing.
pub fn notifier_from_config(cfg: &EscalationConfig) -> Option<Arc<dyn Notifier>> {
    let timeout = Duration::from_secs(cfg.http_timeout_secs);
    if cfg.telegram_configured() {
        let token = cfg.telegram_bot_token.clone().unwrap_or_default();
        let chat = cfg.admin_chat_id.clone().unwrap_or_default();
        return Some(Arc::new(TelegramNotifier::new(token, chat, timeout)));
    }
    if cfg.whatsapp_configured() {
        let url = cfg.waha_url.clone().unwrap_or_default();
        let phone = cfg.whatsapp_phone.clone().unwrap_or_default();
        return Some(Arc::new(WahaNotifier::new(url, cfg.waha_session.clone(), &phone, timeout)));
    }
    None
}

/// In-memory notifier for tests: records what was sent and hands out
/// scripted replies.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(reply.into());
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &str) -> Result<(), EscalationError> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.to_string());
        Ok(())
    }

    async fn poll_reply(&self) -> Result<Option<String>, EscalationError> {
        Ok(self.replies.lock().unwrap_or_else(|p| p.into_inner()).pop_front())
    }
}

// ---------------------------------------------------------------------------
// Reply training
// ---------------------------------------------------------------------------

/// Persists user replies as labelled examples for the user-simulator model:
/// one JSONL line per reply plus a conversation entry in retrieval.
#[derive(Clone)]
pub struct ReplyTrainer {
    train_file: PathBuf,
    retrieval: Option<Arc<RetrievalIndex>>,
}

impl ReplyTrainer {
    pub fn new(train_file: impl Into<PathBuf>) -> Self {
        Self {
            train_file: train_file.into(),
            retrieval: None,
        }
    }

    pub fn with_retrieval(mut self, retrieval: Arc<RetrievalIndex>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn train_file(&self) -> &PathBuf {
        &self.train_file
    }

    /// Index the exchange as a conversation for `language`. Failures are
    /// logged only.
    pub async fn remember(&self, language: &str, prompt: &str, reply: &str, source: &str) {
        let Some(retrieval) = &self.retrieval else { return };
        let mut meta = Map::new();
        meta.insert("source".into(), Value::String(source.to_string()));
        let result = match retrieval.for_language(language).await {
            Ok(index) => index
                .index_conversation(prompt, reply, None, Some(meta))
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(error = %err, "could not index reply");
        }
    }

    /// Index the reply, then append it to the training file. The retrieval
    /// entry is kept even when the file write fails.
    pub async fn record(&self, language: &str, prompt: &str, reply: &str) -> Result<(), EscalationError> {
        self.remember(language, prompt, reply, "user_reply").await;
        if let Some(dir) = self.train_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let line = json!({
            "prompt": prompt,
            "response": reply,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.train_file)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        debug!(file = %self.train_file.display(), "training example appended");
        Ok(())
    }
}

impl std::fmt::Debug for ReplyTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyTrainer")
            .field("train_file", &self.train_file)
            .field("retrieval", &self.retrieval.is_some())
            .finish()
    }
}
