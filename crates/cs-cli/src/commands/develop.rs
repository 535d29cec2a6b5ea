use std::sync::Arc;

use anyhow::Context;
use reqwest::StatusCode;

use cs_agents::registry::RegistryError;
use cs_agents::worker::WorkerError;
use cs_agents::{AgentRegistry, Coordinator, ExecuteOptions, RegistryDeps};
use cs_api_types::{DevelopRequest, DevelopResponse};
use cs_bridge::EventBus;
use cs_core::config::Config;
use cs_core::language;

use super::{api_client, friendly_error, Exit};

#[derive(Debug, Clone)]
pub struct DevelopArgs {
    pub description: String,
    pub language: String,
    pub rag: bool,
    pub test: bool,
    pub json: bool,
}

impl DevelopArgs {
    fn options(&self) -> ExecuteOptions {
        ExecuteOptions {
            use_rag: self.rag,
            run_tests: self.test,
        }
    }

    /// `Some(Exit::Usage)` when the arguments cannot be run.
    fn reject(&self) -> Option<Exit> {
        if self.description.trim().is_empty() {
            eprintln!("--description must not be empty");
            return Some(Exit::Usage);
        }
        if language::normalize(&self.language).is_none() {
            eprintln!(
                "unsupported language {:?} (supported: {})",
                self.language,
                language::supported().join(", ")
            );
            return Some(Exit::Usage);
        }
        None
    }
}

fn print_response(response: &DevelopResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    let outcome = if response.success { "succeeded" } else { "failed" };
    println!(
        "task {} {outcome} after {} attempt(s), {} iteration(s)",
        response.task_id.as_deref().unwrap_or("-"),
        response.attempts,
        response.iterations
    );
    if !response.code.is_empty() {
        println!("\n{}", response.code);
    }
    if !response.success {
        for error in response.errors.iter().rev().take(3).rev() {
            eprintln!("  error: {error}");
        }
        if response.requires_user {
            eprintln!("the task needs input from a human");
        }
    }
    Ok(())
}

fn exit_for(response: &DevelopResponse) -> Exit {
    if response.success {
        Exit::Success
    } else {
        Exit::TaskFailed
    }
}

/// Build the registry and coordinator from config and develop in-process.
pub async fn run(args: &DevelopArgs) -> anyhow::Result<Exit> {
    if let Some(exit) = args.reject() {
        return Ok(exit);
    }
    let config = Config::load().context("failed to load configuration")?;
    let registry = AgentRegistry::new(RegistryDeps::from_config(&config, EventBus::new()).await);
    let coordinator = Coordinator::from_config(registry.clone(), &config);
    run_local(&registry, &Arc::new(coordinator), args).await
}

pub async fn run_local(
    registry: &Arc<AgentRegistry>,
    coordinator: &Arc<Coordinator>,
    args: &DevelopArgs,
) -> anyhow::Result<Exit> {
    if let Some(exit) = args.reject() {
        return Ok(exit);
    }
    let init = registry.initialize().await;
    if !init.llm {
        eprintln!("LLM endpoint unreachable");
        return Ok(Exit::LlmUnreachable);
    }
    if args.test && !init.sandbox && !registry.deps().worker.degraded_mode {
        eprintln!("container sandbox unavailable (set WORKER_DEGRADED_MODE=true to skip execution)");
        return Ok(Exit::SandboxUnavailable);
    }

    let result = match coordinator
        .develop(&args.description, &args.language, args.options())
        .await
    {
        Ok(result) => result,
        Err(RegistryError::UnsupportedLanguage(_) | RegistryError::Worker(WorkerError::UnsupportedLanguage(_))) => {
            return Ok(Exit::Usage)
        }
        Err(RegistryError::SandboxUnavailable) => return Ok(Exit::SandboxUnavailable),
        Err(err) => return Err(err.into()),
    };
    let response = result.to_response();
    print_response(&response, args.json)?;
    Ok(exit_for(&response))
}

/// POST the task to a running daemon.
pub async fn run_remote(api_url: &str, args: &DevelopArgs) -> anyhow::Result<Exit> {
    if let Some(exit) = args.reject() {
        return Ok(exit);
    }
    let request = DevelopRequest {
        use_rag: args.rag,
        run_tests: args.test,
        ..DevelopRequest::new(&args.description, &args.language)
    };
    let resp = api_client()
        .post(format!("{}/tasks", api_url.trim_end_matches('/')))
        .json(&request)
        .send()
        .await
        .map_err(friendly_error)?;

    match resp.status() {
        s if s.is_success() => {}
        StatusCode::BAD_REQUEST => {
            eprintln!("rejected: {}", resp.text().await.unwrap_or_default());
            return Ok(Exit::Usage);
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            eprintln!("unavailable: {}", resp.text().await.unwrap_or_default());
            return Ok(Exit::SandboxUnavailable);
        }
        s => anyhow::bail!("task request failed (HTTP {s})"),
    }
    let response: DevelopResponse = resp.json().await.map_err(friendly_error)?;
    print_response(&response, args.json)?;
    Ok(exit_for(&response))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use cs_agents::{SquadSlots, WorkerDeps};
    use cs_core::config::{CoordinatorConfig, SquadConfig, WorkerConfig};
    use cs_core::types::ExecOutput;
    use cs_intelligence::llm::OllamaProvider;
    use cs_intelligence::{LlmClient, MockProvider};
    use cs_sandbox::{FakeRuntime, HostCapacity, SandboxOrchestrator, SandboxSettings};

    use super::*;

    const CODE: &str = "def add(a, b):\n    \"\"\"Return a + b.\"\"\"\n    return a + b\n";

    fn args(language: &str, test: bool) -> DevelopArgs {
        DevelopArgs {
            description: "add two numbers".into(),
            language: language.into(),
            rag: false,
            test,
            json: false,
        }
    }

    fn local(llm: LlmClient, rt: FakeRuntime, worker: WorkerConfig) -> (TempDir, Arc<AgentRegistry>, Arc<Coordinator>) {
        let dir = TempDir::new().unwrap();
        let sandbox = Arc::new(
            SandboxOrchestrator::new(Arc::new(rt), SandboxSettings::under(dir.path()))
                .with_host_capacity(HostCapacity { cpus: 2, mem_mb: 8_000 }),
        );
        let deps = WorkerDeps::new(llm, EventBus::new())
            .with_sandbox(sandbox)
            .with_worker_config(worker);
        let registry = AgentRegistry::new(RegistryDeps::new(deps, SquadSlots::new(SquadConfig { min: 1, max: 1 })));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            CoordinatorConfig {
                max_retries: 0,
                user_reply_timeout_secs: 1,
                reply_poll_interval_secs: 1,
            },
        ));
        (dir, registry, coordinator)
    }

    fn code_llm() -> LlmClient {
        LlmClient::new(Arc::new(
            MockProvider::new().with_default(format!("```python\n{CODE}```")),
        ))
    }

    #[tokio::test]
    async fn local_success_exits_zero() {
        let rt = FakeRuntime::new();
        rt.on("pytest", ExecOutput::ok("1 passed"));
        let (_dir, registry, coordinator) = local(code_llm(), rt, WorkerConfig::default());
        let exit = run_local(&registry, &coordinator, &args("python", true)).await.unwrap();
        assert_eq!(exit, Exit::Success);
    }

    #[tokio::test]
    async fn local_failure_exits_four() {
        let llm = LlmClient::new(Arc::new(MockProvider::new().with_default("")));
        let (_dir, registry, coordinator) = local(llm, FakeRuntime::new(), WorkerConfig::default());
        let exit = run_local(&registry, &coordinator, &args("python", false)).await.unwrap();
        assert_eq!(exit, Exit::TaskFailed);
    }

    #[tokio::test]
    async fn unreachable_llm_exits_two() {
        let llm = LlmClient::new(Arc::new(OllamaProvider::new(
            "http://127.0.0.1:1",
            "qwen2.5-coder",
            Duration::from_secs(2),
        )));
        let (_dir, registry, coordinator) = local(llm, FakeRuntime::new(), WorkerConfig::default());
        let exit = run_local(&registry, &coordinator, &args("python", true)).await.unwrap();
        assert_eq!(exit, Exit::LlmUnreachable);
    }

    #[tokio::test]
    async fn missing_sandbox_exits_three_unless_degraded() {
        let (_dir, registry, coordinator) =
            local(code_llm(), FakeRuntime::unavailable(), WorkerConfig::default());
        let exit = run_local(&registry, &coordinator, &args("python", true)).await.unwrap();
        assert_eq!(exit, Exit::SandboxUnavailable);

        let degraded = WorkerConfig {
            degraded_mode: true,
            ..Default::default()
        };
        let (_dir, registry, coordinator) = local(code_llm(), FakeRuntime::unavailable(), degraded);
        let exit = run_local(&registry, &coordinator, &args("python", true)).await.unwrap();
        assert_eq!(exit, Exit::Success);
    }

    #[tokio::test]
    async fn bad_arguments_exit_one() {
        let (_dir, registry, coordinator) = local(code_llm(), FakeRuntime::new(), WorkerConfig::default());
        let exit = run_local(&registry, &coordinator, &args("cobol", false)).await.unwrap();
        assert_eq!(exit, Exit::Usage);

        let mut blank = args("python", false);
        blank.description = "  ".into();
        assert_eq!(run_local(&registry, &coordinator, &blank).await.unwrap(), Exit::Usage);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn remote_maps_response_to_exit_code() {
        let app = Router::new().route(
            "/tasks",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["runTests"], false);
                if body["language"] == "go" {
                    Json(json!({ "success": false, "attempts": 3, "requiresUser": true }))
                } else {
                    Json(json!({ "success": true, "attempts": 1, "code": "print(1)" }))
                }
            }),
        );
        let base = serve(app).await;
        assert_eq!(run_remote(&base, &args("python", false)).await.unwrap(), Exit::Success);
        assert_eq!(run_remote(&base, &args("go", false)).await.unwrap(), Exit::TaskFailed);
    }

    #[tokio::test]
    async fn remote_unavailable_exits_three() {
        let app = Router::new().route(
            "/tasks",
            post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, Json(json!({ "error": "docker down" }))) }),
        );
        let base = serve(app).await;
        assert_eq!(
            run_remote(&base, &args("python", true)).await.unwrap(),
            Exit::SandboxUnavailable
        );
    }
}
