//! Typed wrapper over a docker-compatible CLI.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use cs_core::types::ExecOutput;
use cs_telemetry::metrics::PlatformMetrics;

use crate::resources::ResourceLimits;
use crate::runtime::CommandRunner;
use crate::SandboxError;

/// One row of `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsEntry {
    pub id: String,
    pub name: String,
    /// `created`, `running`, `exited`, `paused`, ...
    pub state: String,
    pub status: String,
}

impl PsEntry {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Arguments for `run -d`.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub limits: Option<ResourceLimits>,
    /// (host, guest)
    pub volumes: Vec<(String, String)>,
    /// (host, guest)
    pub ports: Vec<(u16, u16)>,
}

impl RunSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["run".into(), "-d".into(), "--name".into(), self.name.clone()];
        if let Some(net) = &self.network {
            args.push("--network".into());
            args.push(net.clone());
        }
        if let Some(limits) = &self.limits {
            args.extend(limits.to_flags());
        }
        for (host, guest) in &self.volumes {
            args.push("-v".into());
            args.push(format!("{host}:{guest}"));
        }
        for (host, guest) in &self.ports {
            args.push("-p".into());
            args.push(format!("{host}:{guest}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// Lifecycle commands (`build`, `run`, `start`, `stop`, `rm`, `rmi`) are
/// serialized through an internal lock; reads and `exec` are not.
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
    lifecycle: Arc<Mutex<()>>,
}

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub async fn raw(&self, args: Vec<String>, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.runner.run(&self.binary, &args, None, timeout).await
    }

    async fn lifecycle_op(&self, op: &str, args: Vec<String>, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let _guard = self.lifecycle.lock().await;
        let out = self.raw(args, timeout).await?;
        PlatformMetrics::container_op(op, out.success);
        if !out.success {
            debug!(op, stderr = %out.stderr.trim(), "container command failed");
        }
        Ok(out)
    }

    /// `info` succeeds.
    pub async fn available(&self) -> bool {
        match self.raw(strs(&["info"]), Duration::from_secs(10)).await {
            Ok(out) => out.success,
            Err(e) => {
                warn!(error = %e, "container runtime not reachable");
                false
            }
        }
    }

    /// Create the network unless `network inspect` already finds it.
    pub async fn ensure_network(&self, name: &str) -> Result<(), SandboxError> {
        let inspect = self.raw(strs(&["network", "inspect", name]), self.timeout).await?;
        if inspect.success {
            return Ok(());
        }
        let created = self.raw(strs(&["network", "create", name]), self.timeout).await?;
        if created.success || created.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(SandboxError::Command {
                op: "network create".into(),
                stderr: created.stderr,
            })
        }
    }

    pub async fn build(&self, tag: &str, context: &Path) -> Result<ExecOutput, SandboxError> {
        let args = vec![
            "build".into(),
            "-t".into(),
            tag.to_string(),
            context.display().to_string(),
        ];
        self.lifecycle_op("build", args, self.timeout).await
    }

    pub async fn run(&self, spec: &RunSpec) -> Result<ExecOutput, SandboxError> {
        self.lifecycle_op("run", spec.to_args(), self.timeout).await
    }

    pub async fn exec(&self, container: &str, command: &[String], timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        let out = self.raw(args, timeout).await?;
        PlatformMetrics::container_op("exec", out.success);
        Ok(out)
    }

    /// `exec <id> sh -c <command>`.
    pub async fn exec_shell(&self, container: &str, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.exec(container, &["sh".into(), "-c".into(), command.to_string()], timeout)
            .await
    }

    pub async fn start(&self, container: &str) -> Result<ExecOutput, SandboxError> {
        self.lifecycle_op("start", strs(&["start", container]), self.timeout).await
    }

    pub async fn stop(&self, container: &str) -> Result<ExecOutput, SandboxError> {
        self.lifecycle_op("stop", strs(&["stop", container]), self.timeout).await
    }

    pub async fn remove(&self, container: &str) -> Result<ExecOutput, SandboxError> {
        self.lifecycle_op("rm", strs(&["rm", "-f", container]), self.timeout).await
    }

    pub async fn remove_image(&self, image: &str) -> Result<ExecOutput, SandboxError> {
        self.lifecycle_op("rmi", strs(&["rmi", "-f", image]), self.timeout).await
    }

    pub async fn logs(&self, container: &str, lines: usize) -> Result<ExecOutput, SandboxError> {
        let args = vec!["logs".into(), "--tail".into(), lines.to_string(), container.to_string()];
        self.raw(args, self.timeout).await
    }

    pub async fn image_prune(&self) -> Result<ExecOutput, SandboxError> {
        self.lifecycle_op("image_prune", strs(&["image", "prune", "-f"]), self.timeout).await
    }

    /// Containers whose name contains `prefix`. `all` includes non-running
    /// ones; `status` narrows to a single docker status.
    pub async fn ps(&self, prefix: &str, all: bool, status: Option<&str>) -> Result<Vec<PsEntry>, SandboxError> {
        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".into());
        }
        args.push("--filter".into());
        args.push(format!("name={prefix}"));
        if let Some(s) = status {
            args.push("--filter".into());
            args.push(format!("status={s}"));
        }
        args.push("--format".into());
        args.push("{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Status}}".into());
        let out = self.raw(args, self.timeout).await?;
        if !out.success {
            return Err(SandboxError::Command {
                op: "ps".into(),
                stderr: out.stderr,
            });
        }
        Ok(parse_ps(&out.stdout))
    }

    /// Per-container CPU percentage from `stats --no-stream`.
    pub async fn cpu_stats(&self) -> Result<Vec<(String, f64)>, SandboxError> {
        let args = strs(&["stats", "--no-stream", "--format", "{{.Name}}\t{{.CPUPerc}}"]);
        let out = self.raw(args, self.timeout).await?;
        if !out.success {
            return Err(SandboxError::Command {
                op: "stats".into(),
                stderr: out.stderr,
            });
        }
        Ok(parse_stats(&out.stdout))
    }
}

pub fn parse_ps(stdout: &str) -> Vec<PsEntry> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let id = cols.next()?.trim().to_string();
            let name = cols.next()?.trim().to_string();
            let state = cols.next().unwrap_or("").trim().to_ascii_lowercase();
            let status = cols.next().unwrap_or("").trim().to_string();
            Some(PsEntry {
                id,
                name,
                state,
                status,
            })
        })
        .collect()
}

pub fn parse_stats(stdout: &str) -> Vec<(String, f64)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, cpu) = line.split_once('\t')?;
            let pct = cpu.trim().trim_end_matches('%').parse::<f64>().ok()?;
            Some((name.trim().to_string(), pct))
        })
        .collect()
}
