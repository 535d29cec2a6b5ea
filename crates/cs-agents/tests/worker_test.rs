use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use cs_agents::{AgentRegistry, ExecuteOptions, RegistryDeps, SquadSlots, Worker, WorkerDeps};
use cs_bridge::{BusFilter, BusKind, EventBus};
use cs_core::config::{SquadConfig, WorkerConfig};
use cs_core::decision_memory::DecisionMemory;
use cs_core::types::{ExecOutput, TaskState};
use cs_intelligence::llm::CapturedCall;
use cs_intelligence::{LlmClient, MockProvider, RetrievalIndex};
use cs_sandbox::{FakeRuntime, HostCapacity, SandboxOrchestrator, SandboxSettings};

const BROKEN: &str = "def add(a, b):\n    \"\"\"Return the sum of two integers.\"\"\"\n    return a +\n";
const FIXED: &str = "def add(a, b):\n    \"\"\"Return the sum of two integers.\"\"\"\n    return a + b\n";
const TESTS: &str = "from main import add\n\n\ndef test_add():\n    assert add(2, 3) == 5\n";

fn requirements(features: &[&str]) -> String {
    json!({
        "project_name": "adder",
        "description": "sum two integers",
        "features": features,
        "dependencies": [],
        "files_needed": ["main.py"],
        "estimated_complexity": "low",
    })
    .to_string()
}

/// Answers by prompt shape: analysis, generation, tests, fixes.
fn scripted(call: &CapturedCall) -> String {
    let p = &call.prompt;
    if p.contains("Analyse the requirements") {
        requirements(&["add two integers"])
    } else if p.contains("Analyse and fix the error") {
        json!({
            "cause": "incomplete expression",
            "fix_suggestion": "complete the addition",
            "corrected_code": FIXED,
        })
        .to_string()
    } else if p.contains("Write unit tests") {
        format!("```python\n{TESTS}```")
    } else {
        format!("```python\n{BROKEN}```")
    }
}

fn sandbox(dir: &TempDir, rt: Arc<FakeRuntime>) -> Arc<SandboxOrchestrator> {
    Arc::new(
        SandboxOrchestrator::new(rt, SandboxSettings::under(dir.path()))
            .with_host_capacity(HostCapacity { cpus: 4, mem_mb: 16_000 }),
    )
}

#[tokio::test]
async fn fix_loop_completes_on_second_iteration() {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    rt.on("pytest", ExecOutput::failed(1, "SyntaxError: invalid syntax"))
        .on("pytest", ExecOutput::ok("1 passed"));
    let mock = Arc::new(MockProvider::new().with_responder(scripted));
    let memory = Arc::new(DecisionMemory::new_in_memory().await.unwrap());
    let bus = EventBus::new();
    let deps = WorkerDeps::new(LlmClient::new(mock.clone()), bus.clone())
        .with_sandbox(sandbox(&dir, rt.clone()))
        .with_memory(memory.clone());
    let worker = Worker::new("python", deps).unwrap();

    let task = worker.create_task("Function that returns the sum of two integers", Map::new());
    let done = worker.execute(task.id, ExecuteOptions::default()).await.unwrap();

    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.iterations, 2);
    assert_eq!(done.errors.len(), 1);
    assert!(done.errors[0].contains("Iteração 1"));
    assert!(done.errors[0].contains("SyntaxError"));
    assert_eq!(done.code.trim(), FIXED.trim());
    assert_eq!(done.tests.trim(), TESTS.trim());
    assert!(done.container_id.is_none());
    assert!(done.metadata.get("container_id").and_then(Value::as_str).is_some());
    assert_eq!(done.metadata["fix_decisions"].as_array().map(Vec::len), Some(1));
    assert_eq!(rt.calls_matching("pytest").len(), 2);

    let ends = bus.history(&BusFilter::kind(BusKind::TaskEnd), 10);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].payload["success"], true);
    assert_eq!(bus.history(&BusFilter::kind(BusKind::TaskStart), 10).len(), 1);

    // the applied fix is settled and counted as a successful pattern
    let patterns = memory.learned_patterns(Some("code_fix"), 0.0, 10).await.unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].success_count, 1);
    assert_eq!(patterns[0].failure_count, 0);
    assert_eq!(patterns[0].data["language"], "python");
    assert_eq!(patterns[0].data["decision"], "complete the addition");
}

#[tokio::test]
async fn happy_path_passes_first_iteration() {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    rt.on("pytest", ExecOutput::ok("1 passed"));
    let mock = Arc::new(MockProvider::new().with_responder(|call| {
        if call.prompt.contains("Implement the following") {
            format!("```python\n{FIXED}```")
        } else {
            scripted(call)
        }
    }));
    let retrieval = Arc::new(RetrievalIndex::in_memory());
    let deps = WorkerDeps::new(LlmClient::new(mock), EventBus::new())
        .with_sandbox(sandbox(&dir, rt))
        .with_retrieval(retrieval.clone());
    let worker = Worker::new("python", deps).unwrap();

    let task = worker.create_task("Function that returns the sum of two integers", Map::new());
    let done = worker.execute(task.id, ExecuteOptions::default()).await.unwrap();

    assert!(done.is_success());
    assert_eq!(done.iterations, 1);
    assert!(done.errors.is_empty());
    let project = done.project_path.clone().unwrap();
    assert_eq!(std::fs::read_to_string(project.join("main.py")).unwrap().trim(), FIXED.trim());
    assert!(project.join("test_main.py").exists());

    // successful code becomes a retrieval example
    let index = retrieval.for_language("python").await.unwrap();
    let hits = index.search("sum of two integers", None, 3, None).await.unwrap();
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn iteration_limit_fails_the_task() {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    rt.on("pytest", ExecOutput::failed(1, "AssertionError"));
    let counter = std::sync::Mutex::new(0usize);
    let mock = Arc::new(MockProvider::new().with_responder(move |call| {
        if call.prompt.contains("Analyse and fix the error") {
            let mut c = counter.lock().unwrap();
            *c += 1;
            json!({ "cause": "c", "fix_suggestion": "f", "corrected_code": format!("{FIXED}# v{}\n", *c) })
                .to_string()
        } else {
            scripted(call)
        }
    }));
    let deps = WorkerDeps::new(LlmClient::new(mock), EventBus::new())
        .with_sandbox(sandbox(&dir, rt))
        .with_worker_config(WorkerConfig {
            max_iterations: 3,
            ..Default::default()
        });
    let worker = Worker::new("python", deps).unwrap();
    let task = worker.create_task("sum", Map::new());
    let done = worker.execute(task.id, ExecuteOptions::default()).await.unwrap();

    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.iterations, 3);
    assert_eq!(done.errors.len(), 3);
    assert!(done.errors[2].starts_with("Iteração 3"));
}

#[tokio::test]
async fn unchanged_fix_stops_the_loop_early() {
    let dir = TempDir::new().unwrap();
    let rt = Arc::new(FakeRuntime::new());
    rt.on("pytest", ExecOutput::failed(1, "SyntaxError: invalid syntax"));
    let mock = Arc::new(MockProvider::new().with_responder(|call| {
        if call.prompt.contains("Analyse and fix the error") {
            json!({ "cause": "unknown", "fix_suggestion": "none", "corrected_code": BROKEN }).to_string()
        } else {
            scripted(call)
        }
    }));
    let memory = Arc::new(DecisionMemory::new_in_memory().await.unwrap());
    let deps = WorkerDeps::new(LlmClient::new(mock), EventBus::new())
        .with_sandbox(sandbox(&dir, rt.clone()))
        .with_memory(memory)
        .with_worker_config(WorkerConfig {
            max_iterations: 5,
            ..Default::default()
        });
    let worker = Worker::new("python", deps).unwrap();
    let task = worker.create_task("sum", Map::new());
    let done = worker.execute(task.id, ExecuteOptions::default()).await.unwrap();

    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.iterations, 1);
    assert!(done.iterations < 5);
    assert_eq!(done.last_error(), Some("Fix produced identical code"));
    assert!(done.errors[0].starts_with("Iteração 1"));
    assert_eq!(done.code.trim(), BROKEN.trim());
    assert_eq!(done.metadata["fix_decisions"].as_array().map(Vec::len), Some(0));
    assert_eq!(rt.calls_matching("pytest").len(), 1);
}

#[tokio::test]
async fn missing_sandbox_fails_or_degrades() {
    let mock = Arc::new(MockProvider::new().with_responder(scripted));
    let deps = WorkerDeps::new(LlmClient::new(mock.clone()), EventBus::new())
        .with_sandbox(sandbox(&TempDir::new().unwrap(), Arc::new(FakeRuntime::unavailable())));

    let strict = Worker::new("python", deps.clone()).unwrap();
    let t = strict.create_task("sum", Map::new());
    let done = strict.execute(t.id, ExecuteOptions::default()).await.unwrap();
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.last_error(), Some("Container sandbox unavailable"));

    let lenient = Worker::new(
        "python",
        deps.with_worker_config(WorkerConfig {
            degraded_mode: true,
            ..Default::default()
        }),
    )
    .unwrap();
    let t = lenient.create_task("sum", Map::new());
    let done = lenient.execute(t.id, ExecuteOptions::default()).await.unwrap();
    assert!(done.is_success());
    assert_eq!(done.metadata["degraded"], true);
    assert_eq!(done.iterations, 0);
}

#[tokio::test]
async fn empty_generation_fails_after_explicit_retry() {
    let mock = Arc::new(MockProvider::new().with_default(""));
    let deps = WorkerDeps::new(LlmClient::new(mock.clone()), EventBus::new());
    let worker = Worker::new("python", deps).unwrap();
    let t = worker.create_task("sum", Map::new());
    let done = worker
        .execute(t.id, ExecuteOptions { use_rag: false, run_tests: false })
        .await
        .unwrap();
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.last_error(), Some("LLM returned an empty response"));
    // analysis, generation, explicit retry
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn generation_timeout_splits_across_peers() {
    let features = ["parse input", "compute result", "print output"];
    let mock = Arc::new(
        MockProvider::new()
            .with_response(requirements(&features))
            .with_delayed_response(Duration::from_secs(5), format!("```python\n{FIXED}```"))
            .with_responder(|call| {
                let p = &call.prompt;
                if p.contains("Analyse the requirements") {
                    return requirements(&[]);
                }
                let chunk = p
                    .split("REQUIREMENTS:\n")
                    .nth(1)
                    .and_then(|rest| rest.lines().next())
                    .unwrap_or("unknown")
                    .to_string();
                format!("```\n// implements: {chunk}\nfunction step() {{\n  return \"{chunk}\";\n}}\n```")
            }),
    );
    let deps = WorkerDeps::new(LlmClient::new(mock), EventBus::new()).with_worker_config(WorkerConfig {
        generation_timeout_secs: 1,
        ..Default::default()
    });
    let registry = AgentRegistry::new(RegistryDeps::new(
        deps,
        SquadSlots::new(SquadConfig { min: 2, max: 4 }),
    ));

    let result = registry
        .develop(
            "Read numbers, add them and print the total",
            "python",
            ExecuteOptions { use_rag: false, run_tests: true },
            Map::new(),
        )
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.code.matches("# --- chunk ").count(), 3);
    for (i, feature) in features.iter().enumerate() {
        assert!(result.code.contains(&format!("# --- chunk {i} (")));
        assert!(result.code.contains(feature));
    }
    assert!(!result.code.contains("(python) ---"));
    assert_eq!(result.metadata["fallback_depth"], 1);
}
