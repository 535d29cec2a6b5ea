use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use cs_agents::registry::RegistryError;
use cs_agents::{
    AgentPlatform, AgentRegistry, Coordinator, ExecuteOptions, RegistryDeps, SquadSlots, WorkerDeps,
};
use cs_bridge::http_api::{api_router, ApiState};
use cs_bridge::EventBus;
use cs_core::config::{CoordinatorConfig, RemoteConfig, SquadConfig};
use cs_core::types::ExecOutput;
use cs_intelligence::{LlmClient, MockProvider};
use cs_sandbox::{FakeRuntime, HostCapacity, SandboxOrchestrator, SandboxSettings};

const CODE: &str = "def add(a, b):\n    \"\"\"Return a + b.\"\"\"\n    return a + b\n\n\nprint(add(2, 3))\n";

struct Fixture {
    _dir: TempDir,
    rt: Arc<FakeRuntime>,
    registry: Arc<AgentRegistry>,
}

fn fixture(mock: MockProvider, squad: SquadSlots) -> Fixture {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    let sandbox = Arc::new(
        SandboxOrchestrator::new(rt.clone(), SandboxSettings::under(dir.path()))
            .with_host_capacity(HostCapacity { cpus: 4, mem_mb: 16_000 }),
    );
    let deps = WorkerDeps::new(LlmClient::new(Arc::new(mock)), EventBus::new()).with_sandbox(sandbox);
    let registry = AgentRegistry::new(RegistryDeps::new(deps, squad));
    Fixture { _dir: dir, rt, registry }
}

fn code_mock() -> MockProvider {
    MockProvider::new().with_responder(|call| {
        if call.prompt.contains("Analyse the requirements") {
            json!({ "project_name": "adder", "features": ["add"] }).to_string()
        } else {
            format!("```python\n{CODE}```")
        }
    })
}

#[tokio::test]
async fn workers_are_created_lazily_per_language() {
    let f = fixture(MockProvider::new(), SquadSlots::new(SquadConfig { min: 1, max: 2 }));
    assert!(f.registry.workers().is_empty());

    let a = f.registry.worker("py").unwrap();
    let b = f.registry.worker("python").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.name(), "python_agent");
    f.registry.worker("go").unwrap();
    assert_eq!(f.registry.status().len(), 2);

    assert!(matches!(
        f.registry.worker("cobol"),
        Err(RegistryError::UnsupportedLanguage(_))
    ));
}

#[tokio::test]
async fn develop_runs_under_a_squad_slot() {
    let squad = SquadSlots::new(SquadConfig { min: 1, max: 1 });
    let f = fixture(code_mock(), squad.clone());
    f.rt.on("pytest", ExecOutput::ok("1 passed"));

    let held = squad.acquire().await;
    let registry = f.registry.clone();
    let run = tokio::spawn(async move {
        registry
            .develop("add two numbers", "python", ExecuteOptions::default(), Map::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished());
    drop(held);

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(result.success);
    assert_eq!(result.iterations, 1);
    assert!(result.container_id.is_some());
    assert_eq!(squad.in_flight(), 0);

    let response = result.to_response();
    assert_eq!(response.status, "completed");
    assert_eq!(response.attempts, 1);

    assert!(f.registry.find_task(result.task_id).is_some());
    assert_eq!(f.registry.evict_finished(), 1);
    assert!(f.registry.find_task(result.task_id).is_none());
}

#[tokio::test]
async fn scratch_container_is_reused() {
    let f = fixture(MockProvider::new(), SquadSlots::new(SquadConfig { min: 1, max: 2 }));
    f.rt.on("python main.py", ExecOutput::ok("5\n"));

    let first = f.registry.execute_code("python", CODE, None).await.unwrap();
    let second = f.registry.execute_code("python", CODE, None).await.unwrap();
    assert_eq!(first.stdout, "5\n");
    assert!(second.success);
    assert_eq!(f.rt.calls_matching("run -d").len(), 1);
    assert!(f.registry.sandbox().unwrap().get("spec_agent_python_scratch").is_some());
}

#[tokio::test]
async fn export_then_upload_runs_the_project() {
    let f = fixture(MockProvider::new(), SquadSlots::new(SquadConfig { min: 1, max: 2 }));
    let info = f.registry.create_project("python", CODE, &[], Some("adder")).await.unwrap();

    let archive = f.registry.download_project(&info.container_id).await.unwrap();
    let uploaded = f
        .registry
        .upload_and_process(&archive, "python", Some("adder copy"))
        .await
        .unwrap();
    assert_ne!(uploaded.project.container_id, info.container_id);
    assert!(uploaded.run.success);
    assert_eq!(
        std::fs::read_to_string(uploaded.project.project_path.join("main.py")).unwrap(),
        CODE
    );
}

#[tokio::test]
async fn push_runs_git_in_the_project_dir() {
    let f = fixture(MockProvider::new(), SquadSlots::new(SquadConfig { min: 1, max: 2 }));
    let info = f.registry.create_project("python", CODE, &[], Some("adder")).await.unwrap();

    let pushed = f
        .registry
        .push_to_remote_repo(&info.container_id, "https://git.example/adder.git", "")
        .await
        .unwrap();
    assert_eq!(pushed, "https://git.example/adder.git#main");
    let git: Vec<String> = f.rt.calls_matching("git ");
    assert_eq!(git.len(), 4);
    assert!(git[3].contains("push https://git.example/adder.git HEAD:main"));

    f.rt.on("HEAD:dev", ExecOutput::failed(128, "rejected"));
    let err = f
        .registry
        .push_to_remote_repo(&info.container_id, "https://git.example/adder.git", "dev")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Git { ref step, .. } if step == "push"));
}

#[tokio::test]
async fn push_requires_remote_or_url() {
    let dir = TempDir::new().unwrap();
    let sandbox = Arc::new(SandboxOrchestrator::new(
        Arc::new(FakeRuntime::new()),
        SandboxSettings::under(dir.path()),
    ));
    let deps = WorkerDeps::new(LlmClient::new(Arc::new(MockProvider::new())), EventBus::new())
        .with_sandbox(sandbox);
    let registry = AgentRegistry::new(
        RegistryDeps::new(deps, SquadSlots::new(SquadConfig { min: 1, max: 1 }))
            .with_remote(RemoteConfig::default()),
    );
    assert!(matches!(
        registry.push_to_remote_repo("missing", "", "main").await,
        Err(RegistryError::RemoteDisabled)
    ));
}

#[tokio::test]
async fn platform_serves_the_http_api() {
    let f = fixture(code_mock(), SquadSlots::new(SquadConfig { min: 1, max: 2 }));
    f.rt.on("pytest", ExecOutput::ok("1 passed"));
    f.rt.on("python main.py", ExecOutput::ok("5\n"));
    let coordinator = Arc::new(Coordinator::new(f.registry.clone(), CoordinatorConfig::default()));
    let platform = Arc::new(AgentPlatform::new(f.registry.clone(), coordinator));
    let bus = f.registry.deps().bus.clone();
    let router = api_router(Arc::new(ApiState::new(platform, bus)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "description": "add two numbers", "language": "python" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    assert_eq!(resp["attempts"], 1);
    assert_eq!(resp["requiresUser"], false);

    let quick = client
        .post(format!("{base}/tasks/quick"))
        .json(&json!({ "code": "print(5)" }))
        .send()
        .await
        .unwrap();
    assert!(quick.status().is_success());
    let quick: Value = quick.json().await.unwrap();
    assert_eq!(quick["stdout"], "5\n");

    let bad = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "description": "x", "language": "cobol" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 400);

    let status: Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["workers"][0]["language"], "python");
    assert_eq!(status["llmAvailable"], true);
    assert_eq!(status["squad"]["inFlight"], 0);
}
