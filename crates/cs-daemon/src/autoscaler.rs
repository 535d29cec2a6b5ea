//! CPU-driven resize of the live container set.
//!
//! Each tick compares the recent host CPU average with the configured
//! thresholds and starts stopped managed containers or stops running ones.
//! Containers are never created or removed here, apart from the periodic
//! sweep of orphans that never left the `created` state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use cs_agents::SquadSlots;
use cs_api_types::AutoscalerStatus;
use cs_bridge::{BusKind, EventBus};
use cs_core::clock::Clock;
use cs_core::config::AutoscaleConfig;
use cs_harness::shutdown::ShutdownSignal;
use cs_sandbox::docker::PsEntry;
use cs_sandbox::{CpuSampler, SandboxOrchestrator, SandboxError};
use cs_telemetry::metrics::PlatformMetrics;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "count", rename_all = "snake_case")]
pub enum ScaleDecision {
    Up(usize),
    Down(usize),
    Hold,
}

impl ScaleDecision {
    pub fn label(&self) -> &'static str {
        match self {
            ScaleDecision::Up(_) => "scale_up",
            ScaleDecision::Down(_) => "scale_down",
            ScaleDecision::Hold => "hold",
        }
    }
}

/// Target capacity for one tick, ignoring cooldown.
pub fn decide(running: usize, stopped: usize, avg_cpu: f64, cfg: &AutoscaleConfig) -> ScaleDecision {
    if avg_cpu < cfg.cpu_up_pct && stopped > 0 && running < cfg.max_agents {
        let n = cfg.up_step.min(stopped).min(cfg.max_agents - running);
        if n > 0 {
            return ScaleDecision::Up(n);
        }
    } else if avg_cpu > cfg.cpu_down_pct && running > cfg.min_agents {
        let n = cfg.down_step.min(running - cfg.min_agents);
        if n > 0 {
            return ScaleDecision::Down(n);
        }
    }
    ScaleDecision::Hold
}

/// Outcome of a single autoscaler tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub running: usize,
    pub stopped: usize,
    pub avg_cpu: Option<f64>,
    pub decision: ScaleDecision,
    /// Containers actually started or stopped.
    pub applied: Vec<String>,
    pub cooldown_blocked: bool,
    pub orphans_removed: Vec<String>,
    /// Running containers after the tick.
    pub live: usize,
}

// ---------------------------------------------------------------------------
// Autoscaler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ScaleState {
    /// (monotonic time, cpu percent)
    samples: VecDeque<(Duration, f64)>,
    last_change: Option<Duration>,
    last_action: Option<&'static str>,
    avg_cpu: Option<f64>,
    live: usize,
    stopped: usize,
    ticks: u64,
}

pub struct Autoscaler {
    sandbox: Arc<SandboxOrchestrator>,
    sampler: Arc<dyn CpuSampler>,
    clock: Arc<dyn Clock>,
    config: AutoscaleConfig,
    squad: Option<SquadSlots>,
    bus: Option<EventBus>,
    state: Mutex<ScaleState>,
}

impl Autoscaler {
    pub fn new(
        sandbox: Arc<SandboxOrchestrator>,
        sampler: Arc<dyn CpuSampler>,
        clock: Arc<dyn Clock>,
        config: AutoscaleConfig,
    ) -> Self {
        Self {
            sandbox,
            sampler,
            clock,
            config,
            squad: None,
            bus: None,
            state: Mutex::new(ScaleState::default()),
        }
    }

    /// Recalibrate these slots after every applied change.
    pub fn with_squad(mut self, squad: SquadSlots) -> Self {
        self.squad = Some(squad);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScaleState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn live_count(&self) -> usize {
        self.lock().live
    }

    /// `max(live, 1) × max_parallel_tasks_per_agent`
    pub fn recommended_parallelism(&self) -> usize {
        self.live_count().max(1) * self.config.max_parallel_tasks_per_agent.max(1)
    }

    pub fn status(&self) -> AutoscalerStatus {
        let now = self.clock.monotonic();
        let state = self.lock();
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let cooldown_remaining_secs = state
            .last_change
            .map(|t| cooldown.saturating_sub(now.saturating_sub(t)).as_secs())
            .unwrap_or(0);
        AutoscalerStatus {
            enabled: self.config.enabled,
            live: state.live,
            stopped: state.stopped,
            min: self.config.min_agents,
            max: self.config.max_agents,
            avg_cpu: state.avg_cpu,
            last_action: state.last_action.map(str::to_string),
            cooldown_remaining_secs,
            recommended_parallelism: state.live.max(1) * self.config.max_parallel_tasks_per_agent.max(1),
            ticks: state.ticks,
        }
    }

    /// Record a sample and return the average over the averaging window.
    fn observe(&self, now: Duration, sample: Option<f64>) -> Option<f64> {
        let window = Duration::from_secs(self.config.metrics_window_secs);
        let avg_window = Duration::from_secs(self.config.average_window_secs);
        let mut state = self.lock();
        if let Some(cpu) = sample {
            state.samples.push_back((now, cpu));
        }
        while let Some(&(t, _)) = state.samples.front() {
            if now.saturating_sub(t) > window {
                state.samples.pop_front();
            } else {
                break;
            }
        }
        let recent: Vec<f64> = state
            .samples
            .iter()
            .filter(|(t, _)| now.saturating_sub(*t) <= avg_window)
            .map(|(_, cpu)| *cpu)
            .collect();
        let avg = (!recent.is_empty()).then(|| recent.iter().sum::<f64>() / recent.len() as f64);
        state.avg_cpu = avg;
        avg
    }

    fn cooldown_elapsed(&self, now: Duration) -> bool {
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        self.lock()
            .last_change
            .map_or(true, |t| now.saturating_sub(t) >= cooldown)
    }

    async fn scale_up(&self, stopped: &[PsEntry], n: usize) -> Vec<String> {
        let mut names: Vec<&str> = stopped.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        let mut started = Vec::new();
        for name in names.into_iter().take(n) {
            match self.sandbox.start(name).await {
                Ok(true) => started.push(name.to_string()),
                Ok(false) => warn!(container = name, "start refused"),
                Err(e) => warn!(container = name, error = %e, "start failed"),
            }
        }
        started
    }

    /// Stops the `n` running containers with the lowest CPU usage.
    async fn scale_down(&self, running: &[PsEntry], n: usize) -> Vec<String> {
        let usage = self.sandbox.container_cpu().await.unwrap_or_else(|e| {
            warn!(error = %e, "container stats unavailable, stopping by name");
            Default::default()
        });
        let mut ranked: Vec<(f64, &str)> = running
            .iter()
            .map(|e| (usage.get(&e.name).copied().unwrap_or(0.0), e.name.as_str()))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        let mut stopped = Vec::new();
        for (_, name) in ranked.into_iter().take(n) {
            match self.sandbox.stop(name).await {
                Ok(true) => stopped.push(name.to_string()),
                Ok(false) => warn!(container = name, "stop refused"),
                Err(e) => warn!(container = name, error = %e, "stop failed"),
            }
        }
        stopped
    }

    /// Run one control step.
    pub async fn tick(&self) -> Result<TickReport, SandboxError> {
        let ticks = {
            let mut state = self.lock();
            state.ticks += 1;
            state.ticks
        };

        let entries = self.sandbox.managed(true).await?;
        let (running, rest): (Vec<PsEntry>, Vec<PsEntry>) = entries.into_iter().partition(PsEntry::is_running);
        let stopped: Vec<PsEntry> = rest.into_iter().filter(|e| e.state == "exited").collect();

        let sample = self.sampler.sample().await;
        let now = self.clock.monotonic();
        let avg_cpu = self.observe(now, sample);

        let decision = avg_cpu
            .map(|avg| decide(running.len(), stopped.len(), avg, &self.config))
            .unwrap_or(ScaleDecision::Hold);

        let mut applied = Vec::new();
        let mut cooldown_blocked = false;
        if decision != ScaleDecision::Hold {
            if self.cooldown_elapsed(now) {
                applied = match decision {
                    ScaleDecision::Up(n) => self.scale_up(&stopped, n).await,
                    ScaleDecision::Down(n) => self.scale_down(&running, n).await,
                    ScaleDecision::Hold => Vec::new(),
                };
            } else {
                cooldown_blocked = true;
                debug!(action = decision.label(), "autoscale change held by cooldown");
            }
        }

        let (live, stopped_after) = match decision {
            ScaleDecision::Up(_) => (running.len() + applied.len(), stopped.len() - applied.len()),
            ScaleDecision::Down(_) => (running.len() - applied.len(), stopped.len() + applied.len()),
            ScaleDecision::Hold => (running.len(), stopped.len()),
        };

        {
            let mut state = self.lock();
            state.live = live;
            state.stopped = stopped_after;
            if !applied.is_empty() {
                state.last_change = Some(now);
                state.last_action = Some(decision.label());
            }
        }
        PlatformMetrics::live_containers(live);

        if !applied.is_empty() {
            PlatformMetrics::autoscale_action(decision.label());
            let recommended = self.recommended_parallelism();
            let slots = self.squad.as_ref().map(|s| s.resize(recommended));
            info!(
                action = decision.label(),
                containers = ?applied,
                live,
                avg_cpu = avg_cpu.unwrap_or_default(),
                recommended,
                slots = ?slots,
                "autoscale change applied"
            );
            if let Some(bus) = &self.bus {
                bus.emit(
                    BusKind::DockerOp,
                    "autoscaler",
                    json!({
                        "operation": decision.label(),
                        "containers": applied,
                        "live": live,
                        "avg_cpu": avg_cpu,
                    }),
                );
            }
        }

        let mut orphans_removed = Vec::new();
        if self.config.orphan_sweep_ticks > 0 && ticks % self.config.orphan_sweep_ticks == 0 {
            match self.sandbox.sweep_orphans().await {
                Ok(removed) => orphans_removed = removed,
                Err(e) => warn!(error = %e, "orphan sweep failed"),
            }
        }

        Ok(TickReport {
            running: running.len(),
            stopped: stopped.len(),
            avg_cpu,
            decision,
            applied,
            cooldown_blocked,
            orphans_removed,
            live,
        })
    }

    /// Tick every `check_interval_secs` until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        if !self.config.enabled {
            info!("autoscaler disabled");
            return;
        }
        let mut shutdown_rx = shutdown.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.check_interval_secs,
            min = self.config.min_agents,
            max = self.config.max_agents,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(
                            live = report.live,
                            stopped = report.stopped,
                            avg_cpu = report.avg_cpu.unwrap_or_default(),
                            decision = report.decision.label(),
                            "autoscaler tick"
                        ),
                        Err(e) => warn!(error = %e, "autoscaler tick failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping autoscaler");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for Autoscaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autoscaler")
            .field("config", &self.config)
            .field("live", &self.live_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
