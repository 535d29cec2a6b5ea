use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use cs_agents::{AgentRegistry, Coordinator, RegistryDeps, SquadSlots, WorkerDeps};
use cs_bridge::EventBus;
use cs_core::clock::ManualClock;
use cs_core::config::{AutoscaleConfig, Config, CoordinatorConfig, SquadConfig};
use cs_core::types::ExecOutput;
use cs_daemon::{Autoscaler, Daemon};
use cs_intelligence::{LlmClient, MockProvider};
use cs_sandbox::{FakeRuntime, FixedCpuSampler, HostCapacity, SandboxOrchestrator, SandboxSettings};

struct Fixture {
    _dir: TempDir,
    rt: Arc<FakeRuntime>,
    daemon: Daemon,
}

fn fixture(mut config: Config) -> Fixture {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    let sandbox = Arc::new(
        SandboxOrchestrator::new(rt.clone(), SandboxSettings::under(dir.path()))
            .with_host_capacity(HostCapacity { cpus: 4, mem_mb: 16_000 }),
    );
    let bus = EventBus::new();
    let deps = WorkerDeps::new(LlmClient::new(Arc::new(MockProvider::new())), bus.clone())
        .with_sandbox(sandbox.clone());
    let registry = AgentRegistry::new(RegistryDeps::new(deps, SquadSlots::new(SquadConfig { min: 1, max: 4 })));
    let coordinator = Arc::new(Coordinator::new(registry.clone(), CoordinatorConfig::default()));

    config.autoscale = AutoscaleConfig {
        min_agents: 1,
        max_agents: 3,
        check_interval_secs: 3600,
        ..Default::default()
    };
    let autoscaler = Arc::new(
        Autoscaler::new(
            sandbox,
            Arc::new(FixedCpuSampler::new([40.0])),
            Arc::new(ManualClock::default()),
            config.autoscale.clone(),
        )
        .with_squad(registry.squad().clone())
        .with_bus(bus),
    );
    let daemon = Daemon::with_registry(config, registry, coordinator, Some(autoscaler));
    Fixture { _dir: dir, rt, daemon }
}

#[tokio::test]
async fn embedded_api_reports_autoscaler_status() {
    let f = fixture(Config::default());
    f.rt.on("python main.py", ExecOutput::ok("5\n"));
    let port = f.daemon.start_embedded().await.unwrap();
    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(health.status().is_success());

    let quick: Value = client
        .post(format!("{base}/tasks/quick"))
        .json(&json!({ "code": "print(5)", "language": "python" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(quick["stdout"], "5\n");

    let status: Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let autoscaler = &status["autoscaler"];
    assert_eq!(autoscaler["enabled"], true);
    assert_eq!(autoscaler["min"], 1);
    assert_eq!(autoscaler["max"], 3);
    assert!(autoscaler["recommendedParallelism"].as_u64().unwrap() >= 2);

    f.daemon.shutdown();
}

#[tokio::test]
async fn drain_waits_for_work_then_stops_containers() {
    let mut config = Config::default();
    config.daemon.drain_timeout_secs = 5;
    config.daemon.retain_containers = false;
    let f = fixture(config);
    f.rt.on("python main.py", ExecOutput::ok("5\n"));

    f.daemon
        .registry()
        .execute_code("python", "print(5)", None)
        .await
        .unwrap();
    assert_eq!(f.rt.running_count(), 1);

    let shutdown = f.daemon.shutdown_handle();
    let guard = shutdown.begin_work().unwrap();
    f.daemon.shutdown();
    assert!(shutdown.begin_work().is_none());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
    });
    tokio::time::timeout(Duration::from_secs(3), f.daemon.drain())
        .await
        .unwrap();
    assert_eq!(shutdown.inflight(), 0);
    assert_eq!(f.rt.running_count(), 0);
}

#[tokio::test]
async fn retained_containers_survive_shutdown() {
    let f = fixture(Config::default());
    f.rt.on("python main.py", ExecOutput::ok("5\n"));
    f.daemon
        .registry()
        .execute_code("python", "print(5)", None)
        .await
        .unwrap();

    f.daemon.shutdown();
    f.daemon.drain().await;
    assert_eq!(f.rt.running_count(), 1);
}
