//! Process execution seam.
//!
//! Every external command the sandbox issues (the container CLI, and git
//! for remote pushes) goes through a [`CommandRunner`] so tests can swap in
//! [`FakeRuntime`].

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use cs_core::types::ExecOutput;

use crate::SandboxError;

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args..` and capture its output. A non-zero exit is not
    /// an error; only failure to spawn is.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        debug!(program, args = ?args, "exec");

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{program}: {e}")))?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
                success: output.status.success(),
            }),
            Ok(Err(e)) => Err(SandboxError::Spawn(format!("{program}: {e}"))),
            Err(_) => Ok(ExecOutput::failed(
                TIMEOUT_EXIT_CODE,
                format!("timed out after {}s", timeout.as_secs()),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl RecordedCall {
    pub fn line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeState {
    Created,
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub state: FakeState,
    pub cpu_pct: f64,
}

struct Rule {
    pattern: String,
    outputs: VecDeque<ExecOutput>,
}

#[derive(Default)]
struct FakeInner {
    calls: Vec<RecordedCall>,
    rules: Vec<Rule>,
    containers: BTreeMap<String, FakeContainer>,
    next_id: u64,
    unavailable: bool,
}

/// In-memory stand-in for a docker-compatible CLI.
///
/// Lifecycle commands (`run -d`, `start`, `stop`, `rm`, `ps`, `stats`)
/// are simulated against a container table. Anything else succeeds with
/// empty output unless a scripted rule matches: rules match when the
/// joined command line contains their pattern, pop their outputs in
/// order and keep repeating the last one. Rules take precedence over the
/// simulation.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command fails as if the daemon were not reachable.
    pub fn unavailable() -> Self {
        let rt = Self::default();
        rt.lock().unavailable = true;
        rt
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on(&self, pattern: impl Into<String>, output: ExecOutput) -> &Self {
        let pattern = pattern.into();
        let mut inner = self.lock();
        match inner.rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.outputs.push_back(output),
            None => inner.rules.push(Rule {
                pattern,
                outputs: VecDeque::from([output]),
            }),
        }
        self
    }

    /// Seed a pre-existing container.
    pub fn add_container(&self, name: &str, state: FakeState, cpu_pct: f64) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("{:012x}", 0xc0ffee_u64 * 1000 + inner.next_id);
        inner.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                state,
                cpu_pct,
            },
        );
        id
    }

    pub fn set_cpu(&self, name: &str, cpu_pct: f64) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.cpu_pct = cpu_pct;
        }
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.lock().containers.values().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|c| c.state == FakeState::Running)
            .count()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Recorded command lines containing `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(RecordedCall::line)
            .filter(|l| l.contains(needle))
            .collect()
    }

    fn scripted(inner: &mut FakeInner, line: &str) -> Option<ExecOutput> {
        let rule = inner.rules.iter_mut().find(|r| line.contains(&r.pattern))?;
        if rule.outputs.len() > 1 {
            rule.outputs.pop_front()
        } else {
            rule.outputs.front().cloned()
        }
    }

    fn find<'a>(inner: &'a mut FakeInner, key: &str) -> Option<&'a mut FakeContainer> {
        inner
            .containers
            .values_mut()
            .find(|c| c.name == key || c.id == key || c.id.starts_with(key))
    }

    fn simulate(inner: &mut FakeInner, args: &[String]) -> ExecOutput {
        let verb = args.first().map(String::as_str).unwrap_or("");
        match verb {
            "run" => {
                let name = args
                    .iter()
                    .position(|a| a == "--name")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_else(|| format!("anon_{}", inner.next_id + 1));
                if inner.containers.contains_key(&name) {
                    return ExecOutput::failed(125, format!("Conflict. The container name \"/{name}\" is already in use"));
                }
                inner.next_id += 1;
                let id = format!("{:064x}", 0xabc000_u64 + inner.next_id);
                inner.containers.insert(
                    name.clone(),
                    FakeContainer {
                        id: id.clone(),
                        name,
                        state: FakeState::Running,
                        cpu_pct: 0.0,
                    },
                );
                ExecOutput::ok(format!("{id}\n"))
            }
            "start" | "stop" => {
                let mut out = String::new();
                for key in &args[1..] {
                    match Self::find(inner, key) {
                        Some(c) => {
                            c.state = if verb == "start" {
                                FakeState::Running
                            } else {
                                FakeState::Exited
                            };
                            out.push_str(key);
                            out.push('\n');
                        }
                        None => return ExecOutput::failed(1, format!("Error: No such container: {key}")),
                    }
                }
                ExecOutput::ok(out)
            }
            "rm" => {
                for key in args[1..].iter().filter(|a| !a.starts_with('-')) {
                    let name = inner
                        .containers
                        .values()
                        .find(|c| &c.name == key || &c.id == key || c.id.starts_with(key.as_str()))
                        .map(|c| c.name.clone());
                    match name {
                        Some(n) => {
                            inner.containers.remove(&n);
                        }
                        None => return ExecOutput::failed(1, format!("Error: No such container: {key}")),
                    }
                }
                ExecOutput::ok("")
            }
            "ps" => {
                let all = args.iter().any(|a| a == "-a" || a == "--all");
                let name_filter = args
                    .iter()
                    .filter_map(|a| a.strip_prefix("name="))
                    .next()
                    .map(str::to_string);
                let status_filter = args
                    .iter()
                    .filter_map(|a| a.strip_prefix("status="))
                    .next()
                    .map(str::to_string);
                let rows: Vec<String> = inner
                    .containers
                    .values()
                    .filter(|c| all || c.state == FakeState::Running)
                    .filter(|c| name_filter.as_deref().map_or(true, |f| c.name.contains(f)))
                    .filter(|c| {
                        status_filter.as_deref().map_or(true, |s| match s {
                            "created" => c.state == FakeState::Created,
                            "running" => c.state == FakeState::Running,
                            "exited" => c.state == FakeState::Exited,
                            _ => true,
                        })
                    })
                    .map(|c| {
                        let (state, status) = match c.state {
                            FakeState::Created => ("created", "Created"),
                            FakeState::Running => ("running", "Up 5 minutes"),
                            FakeState::Exited => ("exited", "Exited (0) 1 minute ago"),
                        };
                        format!("{}\t{}\t{}\t{}", &c.id[..12.min(c.id.len())], c.name, state, status)
                    })
                    .collect();
                ExecOutput::ok(rows.join("\n"))
            }
            "stats" => {
                let rows: Vec<String> = inner
                    .containers
                    .values()
                    .filter(|c| c.state == FakeState::Running)
                    .map(|c| format!("{}\t{:.2}%", c.name, c.cpu_pct))
                    .collect();
                ExecOutput::ok(rows.join("\n"))
            }
            "exec" => {
                let key = args.iter().skip(1).find(|a| !a.starts_with('-'));
                match key.and_then(|k| Self::find(inner, k)) {
                    Some(c) if c.state == FakeState::Running => ExecOutput::ok(""),
                    Some(c) => ExecOutput::failed(1, format!("Error response from daemon: container {} is not running", c.id)),
                    None => ExecOutput::failed(1, "Error: No such container"),
                }
            }
            _ => ExecOutput::ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRuntime {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        _timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let call = RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
        };
        let line = call.line();
        let mut inner = self.lock();
        inner.calls.push(call);
        if inner.unavailable {
            return Ok(ExecOutput::failed(
                1,
                "Cannot connect to the Docker daemon. Is the docker daemon running?",
            ));
        }
        if let Some(out) = Self::scripted(&mut inner, &line) {
            return Ok(out);
        }
        if program == "git" {
            return Ok(ExecOutput::ok(""));
        }
        Ok(Self::simulate(&mut inner, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    async fn run(rt: &FakeRuntime, line: &str) -> ExecOutput {
        rt.run("docker", &args(line), None, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn simulates_container_lifecycle() {
        let rt = FakeRuntime::new();
        let out = run(&rt, "run -d --name spec_agent_python_x img").await;
        assert!(out.success);
        assert_eq!(rt.running_count(), 1);

        assert!(run(&rt, "stop spec_agent_python_x").await.success);
        assert_eq!(rt.running_count(), 0);
        let ps = run(&rt, "ps -a --filter name=spec_agent").await;
        assert!(ps.stdout.contains("exited"));

        assert!(run(&rt, "rm -f spec_agent_python_x").await.success);
        assert!(rt.containers().is_empty());
        assert!(!run(&rt, "stop spec_agent_python_x").await.success);
    }

    #[tokio::test]
    async fn scripted_rules_pop_then_repeat() {
        let rt = FakeRuntime::new();
        rt.on("pytest", ExecOutput::failed(1, "assert 1 == 2"))
            .on("pytest", ExecOutput::ok("1 passed"));
        assert!(!run(&rt, "exec c sh -c pytest").await.success);
        assert!(run(&rt, "exec c sh -c pytest").await.success);
        assert!(run(&rt, "exec c sh -c pytest").await.success);
        assert_eq!(rt.calls_matching("pytest").len(), 3);
    }

    #[tokio::test]
    async fn unavailable_fails_everything() {
        let rt = FakeRuntime::unavailable();
        assert!(!run(&rt, "info").await.success);
    }

    #[tokio::test]
    async fn process_runner_captures_output() {
        let out = ProcessRunner
            .run("sh", &args("-c true"), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success);
        let out = ProcessRunner
            .run(
                "sh",
                &["-c".to_string(), "echo oops >&2; exit 3".to_string()],
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn process_runner_times_out() {
        let out = ProcessRunner
            .run("sh", &args("-c sleep 5"), None, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = ProcessRunner
            .run("definitely-not-a-binary-xyz", &[], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(_)));
    }
}
