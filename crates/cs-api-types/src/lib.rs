//! Request and response envelopes shared by the HTTP API and the CLI.
//!
//! Field names are camelCase on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_language() -> String {
    "python".to_string()
}

fn default_true() -> bool {
    true
}

// ── Task development ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevelopRequest {
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Augment generation with retrieval context.
    #[serde(default = "default_true", alias = "rag")]
    pub use_rag: bool,
    /// Build and test in the sandbox; false runs generation only.
    #[serde(default = "default_true", alias = "test")]
    pub run_tests: bool,
    /// Route through the coordinator (retries + escalation) instead of a
    /// single registry attempt.
    #[serde(default = "default_true")]
    pub coordinated: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl DevelopRequest {
    pub fn new(description: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            language: language.into(),
            use_rag: true,
            run_tests: true,
            coordinated: true,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevelopResponse {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub tests: String,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub requires_user: bool,
    #[serde(default)]
    pub research: Vec<String>,
    #[serde(default)]
    pub simulated_user_response: Option<String>,
    #[serde(default)]
    pub notify_result: Option<serde_json::Value>,
}

// ── Ad-hoc execution ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickRunRequest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickRunResponse {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

// ── Error analysis / peer fix ──

/// Body of `POST /tasks/fix`, also accepted as a peer-fix request
/// (`{type: "terminal_error", errors, context}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "error")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResponse {
    pub success: bool,
    #[serde(default)]
    pub cause: String,
    /// Human-readable advice; this is what peer-fix callers consume.
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub corrected_code: Option<String>,
}

// ── Status ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub language: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub active_tasks: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub running: usize,
    pub stopped: usize,
    pub total: usize,
    #[serde(default)]
    pub runtime_available: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SquadStatus {
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerStatus {
    pub enabled: bool,
    pub live: usize,
    pub stopped: usize,
    pub min: usize,
    pub max: usize,
    #[serde(default)]
    pub avg_cpu: Option<f64>,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub cooldown_remaining_secs: u64,
    pub recommended_parallelism: usize,
    #[serde(default)]
    pub ticks: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub total_published: u64,
    pub buffered: usize,
    pub capacity: usize,
    pub subscribers: usize,
    pub dropped: u64,
    pub paused: bool,
    #[serde(default)]
    pub by_kind: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub version: String,
    pub uptime_secs: u64,
    #[serde(default)]
    pub workers: Vec<WorkerStatus>,
    #[serde(default)]
    pub containers: ContainerSummary,
    #[serde(default)]
    pub squad: SquadStatus,
    #[serde(default)]
    pub autoscaler: Option<AutoscalerStatus>,
    #[serde(default)]
    pub bus: BusStats,
    #[serde(default)]
    pub llm_available: bool,
    #[serde(default)]
    pub remote_enabled: bool,
}

// ── Errors ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
