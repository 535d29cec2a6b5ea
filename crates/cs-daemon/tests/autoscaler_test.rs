use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cs_agents::SquadSlots;
use cs_bridge::{BusFilter, BusKind, EventBus};
use cs_core::clock::ManualClock;
use cs_core::config::{AutoscaleConfig, SquadConfig};
use cs_daemon::{Autoscaler, ScaleDecision};
use cs_sandbox::runtime::FakeState;
use cs_sandbox::{FakeRuntime, FixedCpuSampler, SandboxOrchestrator, SandboxSettings};

struct Fixture {
    _dir: TempDir,
    rt: Arc<FakeRuntime>,
    sampler: Arc<FixedCpuSampler>,
    clock: ManualClock,
    squad: SquadSlots,
    bus: EventBus,
    scaler: Autoscaler,
}

fn fixture(config: AutoscaleConfig, series: Vec<f64>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    let sandbox = Arc::new(SandboxOrchestrator::new(rt.clone(), SandboxSettings::under(dir.path())));
    let sampler = Arc::new(FixedCpuSampler::new(series));
    let clock = ManualClock::default();
    let squad = SquadSlots::new(SquadConfig { min: 1, max: 16 });
    let bus = EventBus::new();
    let scaler = Autoscaler::new(sandbox, sampler.clone(), Arc::new(clock.clone()), config)
        .with_squad(squad.clone())
        .with_bus(bus.clone());
    Fixture {
        _dir: dir,
        rt,
        sampler,
        clock,
        squad,
        bus,
        scaler,
    }
}

fn thresholds(min: usize, max: usize) -> AutoscaleConfig {
    AutoscaleConfig {
        cpu_up_pct: 50.0,
        cpu_down_pct: 80.0,
        cooldown_secs: 120,
        up_step: 1,
        down_step: 1,
        min_agents: min,
        max_agents: max,
        max_parallel_tasks_per_agent: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn scales_up_under_low_load_then_down_after_cooldown() {
    let f = fixture(thresholds(2, 4), vec![20.0, 20.0, 20.0]);
    f.rt.add_container("spec_agent_python_a", FakeState::Running, 12.0);
    f.rt.add_container("spec_agent_python_b", FakeState::Running, 30.0);
    f.rt.add_container("spec_agent_python_c", FakeState::Exited, 0.0);
    f.rt.add_container("spec_agent_python_d", FakeState::Exited, 0.0);

    let first = f.scaler.tick().await.unwrap();
    assert_eq!(first.decision, ScaleDecision::Up(1));
    assert_eq!(first.applied, vec!["spec_agent_python_c".to_string()]);
    assert_eq!(first.live, 3);
    assert_eq!(f.squad.capacity(), 6);

    // still cheap, but inside the cooldown
    for _ in 0..2 {
        let held = f.scaler.tick().await.unwrap();
        assert!(held.cooldown_blocked);
        assert!(held.applied.is_empty());
    }
    assert_eq!(f.rt.running_count(), 3);
    assert_eq!(f.scaler.status().live, 3);
    assert_eq!(f.rt.calls_matching("start ").len(), 1);

    f.clock.advance(Duration::from_secs(121));
    f.sampler.push([90.0, 90.0, 90.0]);
    let down = f.scaler.tick().await.unwrap();
    assert_eq!(down.avg_cpu, Some(90.0));
    assert_eq!(down.decision, ScaleDecision::Down(1));
    // the freshly started container is the idlest
    assert_eq!(down.applied, vec!["spec_agent_python_c".to_string()]);
    assert_eq!(down.live, 2);
    assert_eq!(f.rt.running_count(), 2);
    assert_eq!(f.squad.capacity(), 4);

    let status = f.scaler.status();
    assert_eq!(status.live, 2);
    assert_eq!(status.stopped, 2);
    assert_eq!(status.last_action.as_deref(), Some("scale_down"));
    assert_eq!(status.recommended_parallelism, 4);
    assert_eq!(status.ticks, 4);

    let events = f
        .bus
        .history(&BusFilter::kind(BusKind::DockerOp).with_source("autoscaler"), 10);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload["operation"], "scale_up");
    assert_eq!(events[1].payload["operation"], "scale_down");
}

#[tokio::test]
async fn pinned_bounds_never_change_capacity() {
    let f = fixture(thresholds(2, 2), vec![5.0, 99.0, 5.0, 99.0]);
    f.rt.add_container("spec_agent_go_a", FakeState::Running, 90.0);
    f.rt.add_container("spec_agent_go_b", FakeState::Running, 90.0);
    f.rt.add_container("spec_agent_go_c", FakeState::Exited, 0.0);

    for _ in 0..4 {
        let report = f.scaler.tick().await.unwrap();
        assert_eq!(report.decision, ScaleDecision::Hold);
        f.clock.advance(Duration::from_secs(300));
    }
    assert_eq!(f.rt.running_count(), 2);
    assert!(f.rt.calls_matching("start ").is_empty());
    assert!(f.rt.calls_matching("stop ").is_empty());
    assert_eq!(f.scaler.status().last_action, None);
}

#[tokio::test]
async fn no_samples_means_no_change() {
    let f = fixture(thresholds(1, 4), vec![]);
    f.rt.add_container("spec_agent_rust_a", FakeState::Exited, 0.0);

    let report = f.scaler.tick().await.unwrap();
    assert_eq!(report.avg_cpu, None);
    assert_eq!(report.decision, ScaleDecision::Hold);
    assert_eq!(f.rt.running_count(), 0);
    assert_eq!(f.scaler.recommended_parallelism(), 2);
}

#[tokio::test]
async fn unmanaged_containers_are_ignored() {
    let f = fixture(thresholds(1, 4), vec![10.0]);
    f.rt.add_container("postgres", FakeState::Exited, 0.0);
    f.rt.add_container("spec_agent_java_a", FakeState::Running, 3.0);

    let report = f.scaler.tick().await.unwrap();
    assert_eq!(report.running, 1);
    assert_eq!(report.stopped, 0);
    assert_eq!(report.decision, ScaleDecision::Hold);
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown() {
    let f = fixture(
        AutoscaleConfig {
            check_interval_secs: 5,
            ..thresholds(1, 4)
        },
        vec![10.0],
    );
    f.rt.add_container("spec_agent_python_a", FakeState::Exited, 0.0);
    let scaler = Arc::new(f.scaler);
    let shutdown = cs_harness::shutdown::ShutdownSignal::new();
    let handle = tokio::spawn(scaler.clone().run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(scaler.status().ticks >= 2);
    assert_eq!(f.rt.running_count(), 1);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
