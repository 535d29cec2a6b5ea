use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

use cs_agents::{AgentPlatform, AgentRegistry, Coordinator, RegistryDeps};
use cs_api_types::{
    DevelopRequest, DevelopResponse, FixRequest, FixResponse, QuickRunRequest, QuickRunResponse,
    StatusSnapshot,
};
use cs_bridge::http_api::{api_router, metrics_router, ApiState};
use cs_bridge::{EventBus, Platform, PlatformError};
use cs_core::clock::SystemClock;
use cs_core::config::Config;
use cs_harness::shutdown::ShutdownSignal;
use cs_sandbox::ProcStatSampler;

use crate::autoscaler::Autoscaler;

// ---------------------------------------------------------------------------
// DaemonPlatform
// ---------------------------------------------------------------------------

/// [`AgentPlatform`] plus the autoscaler's view in `/status`.
pub struct DaemonPlatform {
    inner: AgentPlatform,
    autoscaler: Option<Arc<Autoscaler>>,
}

impl DaemonPlatform {
    pub fn new(inner: AgentPlatform, autoscaler: Option<Arc<Autoscaler>>) -> Self {
        Self { inner, autoscaler }
    }
}

#[async_trait]
impl Platform for DaemonPlatform {
    async fn develop(&self, request: DevelopRequest) -> Result<DevelopResponse, PlatformError> {
        self.inner.develop(request).await
    }

    async fn quick_run(&self, request: QuickRunRequest) -> Result<QuickRunResponse, PlatformError> {
        self.inner.quick_run(request).await
    }

    async fn fix(&self, request: FixRequest) -> Result<FixResponse, PlatformError> {
        self.inner.fix(request).await
    }

    async fn status(&self) -> StatusSnapshot {
        let mut snapshot = self.inner.status().await;
        snapshot.autoscaler = self.autoscaler.as_ref().map(|a| a.status());
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The code-squad service: HTTP API, autoscaler loop and graceful drain.
///
/// Shuts down when the [`ShutdownSignal`] fires (ctrl-c in `main`). New
/// task requests are refused from then on, in-flight tasks get
/// `drain_timeout_secs` to finish, and managed containers are stopped
/// unless `retain_containers` is set.
pub struct Daemon {
    config: Config,
    registry: Arc<AgentRegistry>,
    autoscaler: Option<Arc<Autoscaler>>,
    shutdown: ShutdownSignal,
    api_state: Arc<ApiState>,
}

impl Daemon {
    /// Assemble a daemon around an existing registry.
    pub fn with_registry(
        config: Config,
        registry: Arc<AgentRegistry>,
        coordinator: Arc<Coordinator>,
        autoscaler: Option<Arc<Autoscaler>>,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let bus = registry.deps().bus.clone();
        let platform = DaemonPlatform::new(AgentPlatform::new(registry.clone(), coordinator), autoscaler.clone());
        let api_state = Arc::new(ApiState::new(Arc::new(platform), bus).with_shutdown(shutdown.clone()));
        Self {
            config,
            registry,
            autoscaler,
            shutdown,
            api_state,
        }
    }

    /// Build every collaborator from config.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let bus = EventBus::new();
        let registry = AgentRegistry::new(RegistryDeps::from_config(&config, bus.clone()).await);
        let coordinator = Arc::new(Coordinator::from_config(registry.clone(), &config));

        let autoscaler = match registry.sandbox() {
            Some(sandbox) if config.autoscale.enabled => Some(Arc::new(
                Autoscaler::new(
                    sandbox.clone(),
                    Arc::new(ProcStatSampler::new()),
                    SystemClock::shared(),
                    config.autoscale.clone(),
                )
                .with_squad(registry.squad().clone())
                .with_bus(bus),
            )),
            _ => None,
        };
        Ok(Self::with_registry(config, registry, coordinator, autoscaler))
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn autoscaler(&self) -> Option<&Arc<Autoscaler>> {
        self.autoscaler.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn spawn_background_loops(&self) {
        if let Some(autoscaler) = &self.autoscaler {
            tokio::spawn(autoscaler.clone().run(self.shutdown.clone()));
        }
    }

    async fn spawn_metrics_listener(&self) -> Result<()> {
        let Some(port) = self.config.daemon.metrics_port else {
            return Ok(());
        };
        let addr = format!("{}:{}", self.config.daemon.host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, metrics_router())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "metrics server error");
            }
        });
        info!(%addr, "metrics server listening");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Embedded mode: tests and in-process hosts
    // ------------------------------------------------------------------

    /// Bind the API to `127.0.0.1:0`, spawn the background loops and
    /// return the bound port. Call [`shutdown`](Self::shutdown) to stop.
    pub async fn start_embedded(&self) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let router = api_router(self.api_state.clone());
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "API server error");
            }
        });
        info!(port, "embedded API server listening");
        self.spawn_background_loops();
        Ok(port)
    }

    // ------------------------------------------------------------------
    // Standalone mode
    // ------------------------------------------------------------------

    /// Serve on a pre-bound listener until shutdown, then drain.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let init = self.registry.initialize().await;
        if !init.llm {
            warn!(base_url = %self.config.llm.base_url, "LLM endpoint unreachable at startup");
        }
        if !init.sandbox {
            warn!("container runtime unavailable at startup");
        }

        self.spawn_metrics_listener().await?;
        self.spawn_background_loops();

        let bind_addr = listener.local_addr()?;
        let router = api_router(self.api_state.clone());
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(%bind_addr, "API server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("API server error")?;

        self.drain().await;
        info!("daemon stopped");
        Ok(())
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Wait for in-flight requests, then release containers.
    pub async fn drain(&self) {
        let timeout = Duration::from_secs(self.config.daemon.drain_timeout_secs);
        let result = self.shutdown.wait_idle(timeout).await;
        if !result.is_complete() {
            warn!(?result, "shutting down with work still in flight");
        }
        self.registry.shutdown(self.config.daemon.retain_containers).await;
    }
}
