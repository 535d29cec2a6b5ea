use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Platform configuration snapshot.
///
/// Built once at startup from defaults, an optional TOML file
/// (`~/.code-squad/config.toml` or `$CS_CONFIG`) and the process
/// environment, in that order. After loading, the snapshot is shared
/// read-only (usually behind an `Arc`).
///
/// Tokens for messaging channels are only ever read from the environment
/// and are skipped when the config is serialized back to TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub squad: SquadConfig,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub research: ResearchConfig,
}

impl Config {
    /// Load the full snapshot: file (if present) plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        let mut cfg = if path.exists() {
            Self::read_file(&path)?
        } else {
            Config::default()
        };
        cfg.apply_lookup(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides, ignoring any config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults plus overrides resolved through `lookup`.
    ///
    /// Tests pass a closure over a `HashMap` instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        cfg.apply_lookup(lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific TOML file, without environment overrides.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let cfg = Self::read_file(&path.into())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.squad.validate()?;
        self.autoscale.validate()?;
        self.docker.validate()?;
        if self.split.max_workers == 0 {
            return Err(ConfigError::Validation(
                "SPLIT_MAX_WORKERS must be at least 1".into(),
            ));
        }
        if self.bus.ring_capacity == 0 {
            return Err(ConfigError::Validation(
                "BUS_RING_CAPACITY must be at least 1".into(),
            ));
        }
        if self.worker.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "WORKER_MAX_ITERATIONS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn read_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".code-squad")
            .join("config.toml")
    }

    /// Apply every recognised environment variable on top of `self`.
    pub fn apply_lookup<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        // LLM
        env.string("LLM_BASE_URL", &mut self.llm.base_url);
        env.string("LLM_MODEL", &mut self.llm.model);
        env.opt_string("LLM_FALLBACK_MODEL", &mut self.llm.fallback_model);
        env.parse("LLM_TIMEOUT_SEC", &mut self.llm.timeout_secs)?;
        env.parse("LLM_TEMPERATURE", &mut self.llm.temperature)?;
        env.parse("LLM_MAX_TOKENS", &mut self.llm.max_tokens)?;
        env.parse("LLM_TOP_P", &mut self.llm.top_p)?;
        env.parse("LLM_REPEAT_PENALTY", &mut self.llm.repeat_penalty)?;
        env.opt_string("EMBEDDING_MODEL", &mut self.llm.embedding_model);

        // Sandbox + paths
        env.string("SANDBOX_NETWORK_NAME", &mut self.sandbox.network_name);
        env.string("SANDBOX_BASE_DIR", &mut self.sandbox.base_dir);
        env.string("SANDBOX_RUNTIME", &mut self.sandbox.runtime_binary);
        env.string("PROJECTS_DIR", &mut self.paths.projects_dir);
        env.string("BACKUP_DIR", &mut self.paths.backup_dir);
        env.string("RETRIEVAL_DIR", &mut self.paths.retrieval_dir);
        env.string("DECISION_DB_PATH", &mut self.paths.decision_db);

        // Squad slots
        env.parse("SQUAD_MIN", &mut self.squad.min)?;
        env.parse("SQUAD_MAX", &mut self.squad.max)?;

        // Autoscaler
        let a = &mut self.autoscale;
        env.flag("AUTOSCALE_ENABLED", &mut a.enabled)?;
        env.parse("AUTOSCALE_CHECK_INTERVAL_SEC", &mut a.check_interval_secs)?;
        env.parse("AUTOSCALE_CPU_UP_PCT", &mut a.cpu_up_pct)?;
        env.parse("AUTOSCALE_CPU_DOWN_PCT", &mut a.cpu_down_pct)?;
        env.parse("AUTOSCALE_COOLDOWN_SEC", &mut a.cooldown_secs)?;
        env.parse("AUTOSCALE_UP_STEP", &mut a.up_step)?;
        env.parse("AUTOSCALE_DOWN_STEP", &mut a.down_step)?;
        env.parse("AUTOSCALE_MIN_AGENTS", &mut a.min_agents)?;
        env.parse("AUTOSCALE_MAX_AGENTS", &mut a.max_agents)?;
        env.parse(
            "MAX_PARALLEL_TASKS_PER_AGENT",
            &mut a.max_parallel_tasks_per_agent,
        )?;

        // Container resources
        let d = &mut self.docker;
        env.flag("DOCKER_ELASTIC", &mut d.elastic)?;
        env.parse("DOCKER_CPU_MIN", &mut d.cpu_min)?;
        env.parse("DOCKER_CPU_MAX", &mut d.cpu_max)?;
        env.parse("DOCKER_CPU_FRACTION_PER_CONTAINER", &mut d.cpu_fraction)?;
        env.parse("DOCKER_MEM_MIN_MB", &mut d.mem_min_mb)?;
        env.parse("DOCKER_MEM_MAX_MB", &mut d.mem_max_mb)?;
        env.parse("DOCKER_MEM_FRACTION_PER_CONTAINER", &mut d.mem_fraction)?;
        env.parse(
            "DOCKER_MEM_RESERVATION_FRACTION",
            &mut d.mem_reservation_fraction,
        )?;
        env.parse("DOCKER_MEMORY_SWAP_RATIO", &mut d.memory_swap_ratio)?;
        env.parse("DOCKER_PIDS_LIMIT", &mut d.pids_limit)?;

        // Split executor
        let s = &mut self.split;
        env.parse("SPLIT_MAX_WORKERS", &mut s.max_workers)?;
        env.parse("SPLIT_SUBTASK_TIMEOUT_SEC", &mut s.subtask_timeout_secs)?;
        env.parse("SPLIT_MAX_FALLBACK_DEPTH", &mut s.max_fallback_depth)?;
        env.flag("SPLIT_GENERATE_ONLY", &mut s.generate_only)?;
        env.flag("SPLIT_EXCLUDE_ORIGIN", &mut s.exclude_origin)?;

        // Worker
        env.parse(
            "GENERATION_TIMEOUT_SEC",
            &mut self.worker.generation_timeout_secs,
        )?;
        env.parse("WORKER_MAX_ITERATIONS", &mut self.worker.max_iterations)?;
        env.flag("WORKER_DEGRADED_MODE", &mut self.worker.degraded_mode)?;

        // Coordinator
        env.parse("COORDINATOR_MAX_RETRIES", &mut self.coordinator.max_retries)?;
        env.parse(
            "COORDINATOR_USER_REPLY_TIMEOUT_SEC",
            &mut self.coordinator.user_reply_timeout_secs,
        )?;

        // Remote orchestration
        env.flag("REMOTE_ORCHESTRATOR_ENABLED", &mut self.remote.enabled)?;
        env.opt_string("REMOTE_HOST", &mut self.remote.host);
        env.opt_string("REMOTE_USER", &mut self.remote.user);
        env.opt_string("REMOTE_SSH_KEY", &mut self.remote.ssh_key);
        env.string("REMOTE_BASE_DIR", &mut self.remote.base_dir);

        // Bus + HTTP
        env.parse("BUS_RING_CAPACITY", &mut self.bus.ring_capacity)?;
        env.string("HTTP_HOST", &mut self.daemon.host);
        env.parse("HTTP_PORT", &mut self.daemon.port)?;
        if let Some(port) = env.get("METRICS_PORT") {
            let port = port
                .parse()
                .map_err(|_| ConfigError::Validation(format!("METRICS_PORT: invalid value {port:?}")))?;
            self.daemon.metrics_port = Some(port);
        }
        env.string("LOG_FORMAT", &mut self.daemon.log_format);

        // Escalation channels
        let e = &mut self.escalation;
        env.opt_string("TELEGRAM_BOT_TOKEN", &mut e.telegram_bot_token);
        env.opt_string("ADMIN_CHAT_ID", &mut e.admin_chat_id);
        env.opt_string("WAHA_URL", &mut e.waha_url);
        env.string("WAHA_SESSION", &mut e.waha_session);
        env.opt_string("WHATSAPP_PHONE", &mut e.whatsapp_phone);
        env.opt_string("AGENTS_API", &mut e.agents_api);
        env.string("USER_SIMULATOR_MODEL", &mut e.user_simulator_model);
        env.string("USER_REPLY_TRAIN_FILE", &mut e.train_file);

        env.string("SEARCH_URL", &mut self.research.search_url);

        Ok(())
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(v) = self.get(key) {
            *target = v;
        }
    }

    fn opt_string(&self, key: &str, target: &mut Option<String>) {
        if let Some(v) = self.get(key) {
            *target = Some(v);
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(v) = self.get(key) {
            *target = v
                .parse()
                .map_err(|_| ConfigError::Validation(format!("{key}: invalid value {v:?}")))?;
        }
        Ok(())
    }

    fn flag(&self, key: &str, target: &mut bool) -> Result<(), ConfigError> {
        if let Some(v) = self.get(key) {
            *target = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "{key}: expected a boolean, got {v:?}"
                    )))
                }
            };
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// Enables vector scoring in the retrieval index when set.
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            fallback_model: None,
            timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            embedding_model: None,
        }
    }
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_llm_model() -> String {
    "qwen2.5-coder:7b".into()
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.1
}

// ---------------------------------------------------------------------------
// Sandbox + filesystem layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_network_name")]
    pub network_name: String,
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Name or path of the docker-compatible CLI.
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_name: default_network_name(),
            base_dir: default_base_dir(),
            runtime_binary: default_runtime_binary(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_network_name() -> String {
    "specialized_agents_network".into()
}
fn default_base_dir() -> String {
    "~/.code-squad".into()
}
fn default_runtime_binary() -> String {
    "docker".into()
}
fn default_command_timeout() -> u64 {
    300
}

/// Directory layout. Empty entries resolve under `sandbox.base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    #[serde(default)]
    pub projects_dir: String,
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub retrieval_dir: String,
    #[serde(default)]
    pub decision_db: String,
}

impl Config {
    fn under_base(&self, explicit: &str, leaf: &str) -> PathBuf {
        if explicit.is_empty() {
            expand_home(&self.sandbox.base_dir).join(leaf)
        } else {
            expand_home(explicit)
        }
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.under_base(&self.paths.projects_dir, "projects")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.under_base(&self.paths.backup_dir, "backups")
    }

    pub fn retrieval_dir(&self) -> PathBuf {
        self.under_base(&self.paths.retrieval_dir, "retrieval")
    }

    pub fn decision_db_path(&self) -> PathBuf {
        self.under_base(&self.paths.decision_db, "decisions.db")
    }
}

// ---------------------------------------------------------------------------
// Squad slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadConfig {
    #[serde(default = "default_squad_min")]
    pub min: usize,
    #[serde(default = "default_squad_max")]
    pub max: usize,
}

impl Default for SquadConfig {
    fn default() -> Self {
        Self {
            min: default_squad_min(),
            max: default_squad_max(),
        }
    }
}

impl SquadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min < 1 {
            return Err(ConfigError::Validation("SQUAD_MIN must be >= 1".into()));
        }
        if self.max < self.min {
            return Err(ConfigError::Validation(format!(
                "SQUAD_MAX ({}) must be >= SQUAD_MIN ({})",
                self.max, self.min
            )));
        }
        Ok(())
    }

    /// Clamp a requested slot count into `[min, max]`.
    pub fn clamp(&self, requested: usize) -> usize {
        requested.clamp(self.min, self.max)
    }
}

fn default_squad_min() -> usize {
    1
}
fn default_squad_max() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Autoscaler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Scale up while average CPU is below this percentage.
    #[serde(default = "default_cpu_up")]
    pub cpu_up_pct: f64,
    /// Scale down while average CPU is above this percentage.
    #[serde(default = "default_cpu_down")]
    pub cpu_down_pct: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_up_step")]
    pub up_step: usize,
    #[serde(default = "default_down_step")]
    pub down_step: usize,
    #[serde(default = "default_min_agents")]
    pub min_agents: usize,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    #[serde(default = "default_parallel_per_agent")]
    pub max_parallel_tasks_per_agent: usize,
    #[serde(default = "default_metrics_window")]
    pub metrics_window_secs: u64,
    #[serde(default = "default_average_window")]
    pub average_window_secs: u64,
    #[serde(default = "default_orphan_sweep_ticks")]
    pub orphan_sweep_ticks: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            cpu_up_pct: default_cpu_up(),
            cpu_down_pct: default_cpu_down(),
            cooldown_secs: default_cooldown(),
            up_step: default_up_step(),
            down_step: default_down_step(),
            min_agents: default_min_agents(),
            max_agents: default_max_agents(),
            max_parallel_tasks_per_agent: default_parallel_per_agent(),
            metrics_window_secs: default_metrics_window(),
            average_window_secs: default_average_window(),
            orphan_sweep_ticks: default_orphan_sweep_ticks(),
        }
    }
}

impl AutoscaleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_agents > self.max_agents {
            return Err(ConfigError::Validation(format!(
                "AUTOSCALE_MIN_AGENTS ({}) must be <= AUTOSCALE_MAX_AGENTS ({})",
                self.min_agents, self.max_agents
            )));
        }
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "AUTOSCALE_CHECK_INTERVAL_SEC must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    15
}
fn default_cpu_up() -> f64 {
    50.0
}
fn default_cpu_down() -> f64 {
    80.0
}
fn default_cooldown() -> u64 {
    30
}
fn default_up_step() -> usize {
    4
}
fn default_down_step() -> usize {
    1
}
fn default_min_agents() -> usize {
    2
}
fn default_max_agents() -> usize {
    16
}
fn default_parallel_per_agent() -> usize {
    2
}
fn default_metrics_window() -> u64 {
    600
}
fn default_average_window() -> u64 {
    60
}
fn default_orphan_sweep_ticks() -> u64 {
    20
}

// ---------------------------------------------------------------------------
// Container resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Derive limits from host capacity. When false the max values are used.
    #[serde(default = "default_true")]
    pub elastic: bool,
    #[serde(default = "default_cpu_min")]
    pub cpu_min: f64,
    #[serde(default = "default_cpu_max")]
    pub cpu_max: f64,
    #[serde(default = "default_cpu_fraction")]
    pub cpu_fraction: f64,
    #[serde(default = "default_mem_min")]
    pub mem_min_mb: u64,
    #[serde(default = "default_mem_max")]
    pub mem_max_mb: u64,
    #[serde(default = "default_mem_fraction")]
    pub mem_fraction: f64,
    #[serde(default = "default_mem_reservation_fraction")]
    pub mem_reservation_fraction: f64,
    #[serde(default = "default_swap_ratio")]
    pub memory_swap_ratio: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            elastic: true,
            cpu_min: default_cpu_min(),
            cpu_max: default_cpu_max(),
            cpu_fraction: default_cpu_fraction(),
            mem_min_mb: default_mem_min(),
            mem_max_mb: default_mem_max(),
            mem_fraction: default_mem_fraction(),
            mem_reservation_fraction: default_mem_reservation_fraction(),
            memory_swap_ratio: default_swap_ratio(),
            pids_limit: default_pids_limit(),
            cpu_shares: default_cpu_shares(),
        }
    }
}

impl DockerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_min > self.cpu_max {
            return Err(ConfigError::Validation(
                "DOCKER_CPU_MIN must be <= DOCKER_CPU_MAX".into(),
            ));
        }
        if self.mem_min_mb > self.mem_max_mb {
            return Err(ConfigError::Validation(
                "DOCKER_MEM_MIN_MB must be <= DOCKER_MEM_MAX_MB".into(),
            ));
        }
        for (name, value) in [
            ("DOCKER_CPU_FRACTION_PER_CONTAINER", self.cpu_fraction),
            ("DOCKER_MEM_FRACTION_PER_CONTAINER", self.mem_fraction),
            (
                "DOCKER_MEM_RESERVATION_FRACTION",
                self.mem_reservation_fraction,
            ),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.memory_swap_ratio < 1.0 {
            return Err(ConfigError::Validation(
                "DOCKER_MEMORY_SWAP_RATIO must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn default_cpu_min() -> f64 {
    0.5
}
fn default_cpu_max() -> f64 {
    2.0
}
fn default_cpu_fraction() -> f64 {
    0.5
}
fn default_mem_min() -> u64 {
    512
}
fn default_mem_max() -> u64 {
    4096
}
fn default_mem_fraction() -> f64 {
    0.10
}
fn default_mem_reservation_fraction() -> f64 {
    0.05
}
fn default_swap_ratio() -> f64 {
    1.5
}
fn default_pids_limit() -> u32 {
    512
}
fn default_cpu_shares() -> u32 {
    512
}

// ---------------------------------------------------------------------------
// Split executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_split_workers")]
    pub max_workers: usize,
    #[serde(default = "default_subtask_timeout")]
    pub subtask_timeout_secs: u64,
    #[serde(default = "default_max_depth")]
    pub max_fallback_depth: u32,
    #[serde(default = "default_true")]
    pub generate_only: bool,
    #[serde(default = "default_true")]
    pub exclude_origin: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_workers: default_split_workers(),
            subtask_timeout_secs: default_subtask_timeout(),
            max_fallback_depth: default_max_depth(),
            generate_only: true,
            exclude_origin: true,
        }
    }
}

fn default_split_workers() -> usize {
    6
}
fn default_subtask_timeout() -> u64 {
    40
}
fn default_max_depth() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Complete tasks without build/test when the sandbox is unavailable.
    #[serde(default)]
    pub degraded_mode: bool,
    #[serde(default = "default_min_output_chars")]
    pub min_output_chars: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout(),
            max_iterations: default_max_iterations(),
            degraded_mode: false,
            min_output_chars: default_min_output_chars(),
        }
    }
}

fn default_generation_timeout() -> u64 {
    30
}
fn default_max_iterations() -> u32 {
    5
}
fn default_min_output_chars() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reply_timeout")]
    pub user_reply_timeout_secs: u64,
    #[serde(default = "default_reply_poll")]
    pub reply_poll_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            user_reply_timeout_secs: default_reply_timeout(),
            reply_poll_interval_secs: default_reply_poll(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_reply_timeout() -> u64 {
    300
}
fn default_reply_poll() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Remote orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default = "default_remote_base_dir")]
    pub base_dir: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            user: None,
            ssh_key: None,
            base_dir: default_remote_base_dir(),
        }
    }
}

fn default_remote_base_dir() -> String {
    "/srv/code-squad".into()
}

// ---------------------------------------------------------------------------
// Bus + daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
        }
    }
}

fn default_ring_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    /// Dedicated `/metrics` listener. Unset means metrics share `port`.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Leave managed containers running on shutdown.
    #[serde(default = "default_true")]
    pub retain_containers: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            metrics_port: None,
            log_format: default_log_format(),
            drain_timeout_secs: default_drain_timeout(),
            retain_containers: true,
        }
    }
}

fn default_daemon_host() -> String {
    "0.0.0.0".into()
}
fn default_daemon_port() -> u16 {
    8503
}
fn default_log_format() -> String {
    "text".into()
}
fn default_drain_timeout() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Escalation + research
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default, skip_serializing)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub admin_chat_id: Option<String>,
    #[serde(default)]
    pub waha_url: Option<String>,
    #[serde(default = "default_waha_session")]
    pub waha_session: String,
    #[serde(default)]
    pub whatsapp_phone: Option<String>,
    /// Base URL of the peer fix service (`POST {agents_api}/agent/fix`).
    #[serde(default)]
    pub agents_api: Option<String>,
    #[serde(default = "default_simulator_model")]
    pub user_simulator_model: String,
    #[serde(default = "default_train_file")]
    pub train_file: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            admin_chat_id: None,
            waha_url: None,
            waha_session: default_waha_session(),
            whatsapp_phone: None,
            agents_api: None,
            user_simulator_model: default_simulator_model(),
            train_file: default_train_file(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl EscalationConfig {
    pub fn telegram_configured(&self) -> bool {
        self.telegram_bot_token.is_some() && self.admin_chat_id.is_some()
    }

    pub fn whatsapp_configured(&self) -> bool {
        self.waha_url.is_some() && self.whatsapp_phone.is_some()
    }
}

fn default_waha_session() -> String {
    "default".into()
}
fn default_simulator_model() -> String {
    "eddie-assistant".into()
}
fn default_train_file() -> String {
    "~/.code-squad/user_replies.jsonl".into()
}
fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_research_results")]
    pub max_results: usize,
    #[serde(default = "default_research_timeout")]
    pub timeout_secs: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            max_results: default_research_results(),
            timeout_secs: default_research_timeout(),
        }
    }
}

fn default_search_url() -> String {
    "https://api.duckduckgo.com".into()
}
fn default_research_results() -> usize {
    5
}
fn default_research_timeout() -> u64 {
    15
}
