use std::sync::Arc;
use std::time::Duration;

use cs_bridge::{BusFilter, BusKind, EventBus};
use cs_core::types::ExecOutput;
use cs_sandbox::archive::BACKUP_METADATA_FILE;
use cs_sandbox::runtime::FakeState;
use cs_sandbox::{
    ContainerState, FakeRuntime, HostCapacity, ProjectArchive, SandboxError, SandboxOrchestrator,
    SandboxSettings,
};
use tempfile::TempDir;

fn orchestrator(dir: &TempDir) -> (Arc<FakeRuntime>, SandboxOrchestrator) {
    let rt = Arc::new(FakeRuntime::new());
    let orch = SandboxOrchestrator::new(rt.clone(), SandboxSettings::under(dir.path()))
        .with_host_capacity(HostCapacity { cpus: 4, mem_mb: 16_000 });
    (rt, orch)
}

#[tokio::test]
async fn create_project_builds_and_starts_container() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    assert!(orch.init().await.unwrap());

    let info = orch
        .create_project("python", "print('hello')\n", &[], Some("Hello World"))
        .await
        .unwrap();

    assert_eq!(info.container_name, "spec_agent_python_hello_world");
    assert_eq!(info.image, "spec_agent_python:hello_world");
    assert_eq!(info.port, 8000);
    assert_eq!(info.container_id.len(), 12);
    assert_eq!(
        std::fs::read_to_string(info.project_path.join("main.py")).unwrap(),
        "print('hello')\n"
    );
    assert!(info.project_path.join("Dockerfile").exists());

    let handle = orch.get(&info.container_id).unwrap();
    assert_eq!(handle.state, ContainerState::Running);
    assert_eq!(handle.ports.get(&8000), Some(&8000));
    assert_eq!(orch.get(&info.container_name).unwrap().id, info.container_id);
    assert_eq!(orch.running_count(), 1);

    let run = rt.calls_matching("run -d");
    assert_eq!(run.len(), 1);
    assert!(run[0].contains("--memory 1600m"));
    assert!(run[0].contains("-p 8000:8000"));
    assert!(run[0].contains(":/app"));
}

#[tokio::test]
async fn ports_are_not_reused_within_a_language() {
    let dir = TempDir::new().unwrap();
    let (_rt, orch) = orchestrator(&dir);
    let a = orch.create_project("go", "package main", &[], Some("a")).await.unwrap();
    let b = orch.create_project("go", "package main", &[], Some("b")).await.unwrap();
    assert_eq!(a.port, 4000);
    assert_eq!(b.port, 4001);
    assert!(a.project_path.join("go.mod").exists());
}

#[tokio::test]
async fn build_failure_leaves_no_handle() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    rt.on("build -t", ExecOutput::failed(1, "pip: not found"));

    let err = orch
        .create_project("python", "x = 1", &[], Some("broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Build(ref m) if m.contains("pip")));
    assert!(orch.list(None).is_empty());
    assert!(rt.calls_matching("run -d").is_empty());
}

#[tokio::test]
async fn unsupported_language_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (_rt, orch) = orchestrator(&dir);
    let err = orch.create_project("cobol", "", &[], None).await.unwrap_err();
    assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
}

#[tokio::test]
async fn run_code_and_tests_use_template_commands() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    let info = orch.create_project("python", "print(1)", &[], Some("p")).await.unwrap();

    rt.on("python main.py", ExecOutput::ok("1\n"));
    let out = orch.run_code(&info.container_id, Some("print(2)"), None).await.unwrap();
    assert!(out.success);
    assert_eq!(
        std::fs::read_to_string(info.project_path.join("main.py")).unwrap(),
        "print(2)"
    );

    rt.on("pytest", ExecOutput::failed(1, "1 failed"));
    let out = orch
        .run_tests(&info.container_id, None, Some("def test_x(): assert False"))
        .await
        .unwrap();
    assert!(!out.success);
    assert!(info.project_path.join("test_main.py").exists());
    assert_eq!(rt.calls_matching("pytest -q test_main.py").len(), 1);
}

#[tokio::test]
async fn stop_start_track_state() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    let info = orch.create_project("python", "", &[], Some("s")).await.unwrap();

    assert!(orch.stop(&info.container_id).await.unwrap());
    assert_eq!(orch.get(&info.container_id).unwrap().state, ContainerState::Stopped);
    assert_eq!(rt.running_count(), 0);

    let exec = orch.run_code(&info.container_id, None, None).await.unwrap();
    assert!(!exec.success);

    assert!(orch.start(&info.container_name).await.unwrap());
    assert_eq!(orch.running_count(), 1);
}

#[tokio::test]
async fn remove_with_backup_round_trips_project() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    let info = orch
        .create_project("python", "print('keep me')\n", &[], Some("backed"))
        .await
        .unwrap();
    std::fs::write(info.project_path.join("data.bin"), [1u8, 2, 255]).unwrap();
    let exported = orch.export_project(&info.container_id).await.unwrap();

    let outcome = orch.remove(&info.container_id, true, true).await.unwrap();
    assert!(outcome.removed);
    let backup = outcome.backup_path.unwrap();
    assert!(backup.starts_with(dir.path().join("backups/containers")));
    assert!(backup.join(BACKUP_METADATA_FILE).exists());
    assert!(!info.project_path.exists());
    assert!(orch.get(&info.container_id).is_none());
    assert!(rt.containers().is_empty());
    assert_eq!(rt.calls_matching("rmi -f spec_agent_python:backed").len(), 1);

    let from_backup = ProjectArchive::from_dir(&backup, "python", "backed").unwrap();
    let original = ProjectArchive::from_bytes(&exported).unwrap();
    assert_eq!(from_backup.files, original.files);
}

#[tokio::test]
async fn failed_backup_keeps_project_and_container() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, "file").unwrap();
    let rt = Arc::new(FakeRuntime::new());
    let mut settings = SandboxSettings::under(dir.path());
    settings.backup_dir = blocker.join("backups");
    let orch = SandboxOrchestrator::new(rt.clone(), settings)
        .with_host_capacity(HostCapacity { cpus: 4, mem_mb: 16_000 });
    let info = orch
        .create_project("python", "print('precious')\n", &[], Some("keep"))
        .await
        .unwrap();

    assert!(orch.remove(&info.container_id, true, true).await.is_err());
    assert!(info.project_path.join("main.py").exists());
    assert!(orch.get(&info.container_id).is_some());
    assert_eq!(rt.containers().len(), 1);
    assert!(rt.calls_matching("rm -f").is_empty());
    assert!(rt.calls_matching("rmi -f").is_empty());
}

#[tokio::test]
async fn failed_rm_keeps_handle_image_and_project() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    let info = orch.create_project("python", "", &[], Some("busy")).await.unwrap();
    rt.on(" rm -f ", ExecOutput::failed(1, "device busy"));

    let err = orch.remove(&info.container_id, true, false).await.unwrap_err();
    assert!(matches!(err, SandboxError::Command { ref op, ref stderr } if op == "rm" && stderr == "device busy"));
    assert_eq!(orch.get(&info.container_id).unwrap().state, ContainerState::Stopped);
    assert_eq!(rt.containers().len(), 1);
    assert!(info.project_path.exists());
    assert!(rt.calls_matching("rmi -f").is_empty());
}

#[tokio::test]
async fn failed_stop_does_not_mark_container_stopped() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    let info = orch.create_project("python", "", &[], Some("stuck")).await.unwrap();
    rt.on(" stop ", ExecOutput::failed(1, "timeout"));
    rt.on(" rm -f ", ExecOutput::failed(1, "device busy"));

    assert!(orch.remove(&info.container_id, false, false).await.is_err());
    assert_eq!(orch.get(&info.container_id).unwrap().state, ContainerState::Running);
    assert_eq!(orch.running_count(), 1);
}

#[tokio::test]
async fn import_provisions_new_container() {
    let dir = TempDir::new().unwrap();
    let (_rt, orch) = orchestrator(&dir);
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("main.py"), "print('imported')").unwrap();
    std::fs::write(src.path().join("requirements.txt"), "requests\n# comment\n").unwrap();
    let bytes = ProjectArchive::from_dir(src.path(), "python", "up")
        .unwrap()
        .to_bytes()
        .unwrap();

    let info = orch.import_project(&bytes, "python", Some("uploaded")).await.unwrap();
    let dockerfile = std::fs::read_to_string(info.project_path.join("Dockerfile")).unwrap();
    assert!(dockerfile.contains("pip install --no-cache-dir requests"));
    assert_eq!(orch.list(Some("python")).len(), 1);
}

#[tokio::test]
async fn sweep_removes_only_created_containers() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    rt.add_container("spec_agent_python_stuck", FakeState::Created, 0.0);
    rt.add_container("spec_agent_python_live", FakeState::Running, 10.0);
    rt.add_container("other_created", FakeState::Created, 0.0);

    let removed = orch.sweep_orphans().await.unwrap();
    assert_eq!(removed, vec!["spec_agent_python_stuck".to_string()]);
    assert_eq!(rt.containers().len(), 2);

    let cpu = orch.container_cpu().await.unwrap();
    assert_eq!(cpu.get("spec_agent_python_live"), Some(&10.0));
}

#[tokio::test]
async fn lifecycle_events_reach_the_bus() {
    let dir = TempDir::new().unwrap();
    let bus = EventBus::new();
    let rt = Arc::new(FakeRuntime::new());
    let orch = SandboxOrchestrator::new(rt, SandboxSettings::under(dir.path())).with_bus(bus.clone());
    let info = orch.create_project("python", "", &[], Some("b")).await.unwrap();
    orch.stop(&info.container_id).await.unwrap();

    let filter = BusFilter::kind(BusKind::DockerOp);
    let ops: Vec<String> = bus
        .history(&filter, 10)
        .into_iter()
        .map(|m| m.payload["operation"].as_str().unwrap_or("").to_string())
        .collect();
    assert_eq!(ops, vec!["create", "stop"]);
}

#[tokio::test]
async fn shutdown_stops_unless_retained() {
    let dir = TempDir::new().unwrap();
    let (rt, orch) = orchestrator(&dir);
    orch.create_project("python", "", &[], Some("x")).await.unwrap();

    orch.shutdown(true).await;
    assert_eq!(rt.running_count(), 1);
    orch.shutdown(false).await;
    assert_eq!(rt.running_count(), 0);
    assert!(orch.exec_command("x", "true", Duration::from_secs(1)).await.is_err());
}
