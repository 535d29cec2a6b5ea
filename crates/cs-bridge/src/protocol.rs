use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BusKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusKind {
    Coordinator,
    Request,
    Response,
    TaskStart,
    TaskEnd,
    DockerOp,
    GithubOp,
    LlmCall,
    LlmResponse,
    CodeGen,
    Execution,
    Error,
}

impl BusKind {
    pub const ALL: [BusKind; 12] = [
        BusKind::Coordinator,
        BusKind::Request,
        BusKind::Response,
        BusKind::TaskStart,
        BusKind::TaskEnd,
        BusKind::DockerOp,
        BusKind::GithubOp,
        BusKind::LlmCall,
        BusKind::LlmResponse,
        BusKind::CodeGen,
        BusKind::Execution,
        BusKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::Coordinator => "coordinator",
            BusKind::Request => "request",
            BusKind::Response => "response",
            BusKind::TaskStart => "task-start",
            BusKind::TaskEnd => "task-end",
            BusKind::DockerOp => "docker-op",
            BusKind::GithubOp => "github-op",
            BusKind::LlmCall => "llm-call",
            BusKind::LlmResponse => "llm-response",
            BusKind::CodeGen => "code-gen",
            BusKind::Execution => "execution",
            BusKind::Error => "error",
        }
    }
}

impl std::fmt::Display for BusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown bus message kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for BusKind {
    type Err = UnknownKind;

    /// Accepts both `task-start` and `task_start` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        BusKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// BusMessage
// ---------------------------------------------------------------------------

/// One entry in the communication bus ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: BusKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl BusMessage {
    /// Single-line rendering for terminal monitors.
    pub fn to_log_line(&self) -> String {
        let route = match &self.target {
            Some(target) => format!("{} -> {}", self.source, target),
            None => self.source.clone(),
        };
        let mut body = match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        if body.chars().count() > 160 {
            body = body.chars().take(157).collect::<String>() + "...";
        }
        format!(
            "[{}] #{} {:<12} {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.seq,
            self.kind.as_str(),
            route,
            body.replace('\n', " ")
        )
    }
}

// ---------------------------------------------------------------------------
// BusFilter
// ---------------------------------------------------------------------------

/// Match criteria for subscriptions and history queries. Empty fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFilter {
    #[serde(default)]
    pub kinds: Vec<BusKind>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

impl BusFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: BusKind) -> Self {
        Self {
            kinds: vec![kind],
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: BusKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn matches(&self, msg: &BusMessage) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&msg.kind) {
            return false;
        }
        if let Some(source) = &self.source {
            if &msg.source != source {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if msg.target.as_ref() != Some(target) {
                return false;
            }
        }
        true
    }
}
