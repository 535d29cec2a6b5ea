// ---------------------------------------------------------------------------
// SandboxOrchestrator
// ---------------------------------------------------------------------------
//
// Owns the table of container handles. Tasks reference containers by id
// only. Every lifecycle change is published on the bus (when attached) and
// mirrored into the live-container gauge.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cs_bridge::EventBus;
use cs_core::config::{Config, DockerConfig};
use cs_core::language::{self, LanguageTemplate};
use cs_core::types::ExecOutput;
use cs_telemetry::metrics::PlatformMetrics;

use crate::archive::{copy_tree, ProjectArchive, BACKUP_METADATA_FILE};
use crate::docker::{DockerCli, PsEntry, RunSpec};
use crate::resources::{HostCapacity, ResourceLimits};
use crate::runtime::CommandRunner;
use crate::{Result, SandboxError};

pub const CONTAINER_PREFIX: &str = "spec_agent";

const RUN_TIMEOUT: Duration = Duration::from_secs(60);
const TEST_TIMEOUT: Duration = Duration::from_secs(120);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Building,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub language: String,
    pub state: ContainerState,
    pub image: String,
    /// host -> guest
    pub ports: BTreeMap<u16, u16>,
    /// host -> guest
    pub volumes: BTreeMap<String, String>,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub container_id: String,
    pub container_name: String,
    pub project_path: PathBuf,
    pub port: u16,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub network: String,
    pub projects_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub runtime_binary: String,
    pub command_timeout: Duration,
    pub docker: DockerConfig,
}

impl SandboxSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            network: cfg.sandbox.network_name.clone(),
            projects_dir: cfg.projects_dir(),
            backup_dir: cfg.backup_dir(),
            runtime_binary: cfg.sandbox.runtime_binary.clone(),
            command_timeout: Duration::from_secs(cfg.sandbox.command_timeout_secs),
            docker: cfg.docker.clone(),
        }
    }

    /// Defaults rooted at `base` (used by tests).
    pub fn under(base: &Path) -> Self {
        Self {
            network: "specialized_agents_network".into(),
            projects_dir: base.join("projects"),
            backup_dir: base.join("backups"),
            runtime_binary: "docker".into(),
            command_timeout: Duration::from_secs(300),
            docker: DockerConfig::default(),
        }
    }
}

/// Lowercase, `[a-z0-9_.-]` only; image tags reject anything else.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '_' || c == '.' || c == '-').to_string();
    if cleaned.is_empty() {
        "project".into()
    } else {
        cleaned
    }
}

/// Dockerfile for `language` with `dependencies` (the template's default
/// packages when empty) baked into the image.
pub fn generate_dockerfile(tpl: &LanguageTemplate, dependencies: &[String]) -> String {
    let deps: Vec<String> = if dependencies.is_empty() {
        tpl.default_packages.iter().map(|s| s.to_string()).collect()
    } else {
        dependencies.to_vec()
    };
    let mut out = format!("FROM {}\n\nWORKDIR /app\n\n{}\n", tpl.base_image, tpl.dockerfile_extra);
    if !deps.is_empty() {
        let joined = deps.join(" ");
        match tpl.name {
            "python" => out.push_str(&format!("RUN {} {}\n", tpl.install_cmd, joined)),
            "javascript" | "typescript" => {
                out.push_str(&format!("RUN npm init -y && npm install {joined}\n"))
            }
            "go" => {
                for dep in &deps {
                    out.push_str(&format!("RUN go get {dep}\n"));
                }
            }
            "php" => out.push_str(&format!("RUN composer require {joined}\n")),
            // Rust, Java and C# resolve dependencies from their manifests.
            _ => {}
        }
    }
    out.push_str("\nCOPY . .\n\nCMD [\"tail\", \"-f\", \"/dev/null\"]\n");
    out
}

/// Manifest files some toolchains need before the entry point can run.
pub fn scaffold_files(tpl: &LanguageTemplate, project: &str) -> Vec<(String, String)> {
    match tpl.name {
        "go" => vec![("go.mod".into(), format!("module {project}\n\ngo 1.22\n"))],
        "rust" => vec![(
            "Cargo.toml".into(),
            format!(
                "[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[[bin]]\nname = \"main\"\npath = \"main.rs\"\n",
                project.replace('.', "_")
            ),
        )],
        "javascript" | "typescript" => vec![(
            "package.json".into(),
            format!(
                "{{\n  \"name\": \"{}\",\n  \"version\": \"0.1.0\",\n  \"scripts\": {{ \"test\": \"jest\" }}\n}}\n",
                project.replace('_', "-")
            ),
        )],
        _ => Vec::new(),
    }
}

fn template_for(language: &str) -> Result<&'static LanguageTemplate> {
    language::template(language).ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
}

pub struct SandboxOrchestrator {
    cli: DockerCli,
    settings: SandboxSettings,
    host: HostCapacity,
    containers: RwLock<BTreeMap<String, ContainerHandle>>,
    bus: Option<EventBus>,
}

impl SandboxOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: SandboxSettings) -> Self {
        let cli = DockerCli::new(runner, settings.runtime_binary.clone(), settings.command_timeout);
        Self {
            cli,
            settings,
            host: HostCapacity::detect(),
            containers: RwLock::new(BTreeMap::new()),
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_host_capacity(mut self, host: HostCapacity) -> Self {
        self.host = host;
        self
    }

    pub fn cli(&self) -> &DockerCli {
        &self.cli
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn prefix(&self) -> &'static str {
        CONTAINER_PREFIX
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::compute(&self.settings.docker, self.host)
    }

    /// Ensure the managed network exists. Returns false when the runtime is
    /// not reachable.
    pub async fn init(&self) -> Result<bool> {
        if !self.cli.available().await {
            warn!("container runtime unavailable; sandbox disabled");
            return Ok(false);
        }
        self.cli.ensure_network(&self.settings.network).await?;
        info!(network = %self.settings.network, "sandbox network ready");
        Ok(true)
    }

    pub async fn docker_available(&self) -> bool {
        self.cli.available().await
    }

    fn log_op(&self, op: &str, container: &str, success: bool) {
        if let Some(bus) = &self.bus {
            bus.log_docker_op(op, container, success);
        }
    }

    fn publish_live(&self) {
        PlatformMetrics::live_containers(self.running_count());
    }

    // -- handle table -------------------------------------------------------

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ContainerHandle>> {
        self.containers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ContainerHandle>> {
        self.containers.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Handle by id, id prefix or name.
    pub fn get(&self, key: &str) -> Option<ContainerHandle> {
        let table = self.read();
        table.get(key).cloned().or_else(|| {
            table
                .values()
                .find(|h| h.name == key || (key.len() >= 6 && h.id.starts_with(key)))
                .cloned()
        })
    }

    fn require(&self, key: &str) -> Result<ContainerHandle> {
        self.get(key).ok_or_else(|| SandboxError::NotFound(key.to_string()))
    }

    fn set_state(&self, key: &str, state: ContainerState) {
        let mut table = self.write();
        if let Some(h) = table
            .values_mut()
            .find(|h| h.id == key || h.name == key || (key.len() >= 6 && h.id.starts_with(key)))
        {
            h.state = state;
        }
    }

    pub fn list(&self, language: Option<&str>) -> Vec<ContainerHandle> {
        self.read()
            .values()
            .filter(|h| language.map_or(true, |l| h.language == l))
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.read()
            .values()
            .filter(|h| h.state == ContainerState::Running)
            .count()
    }

    fn next_port(&self, tpl: &LanguageTemplate) -> u16 {
        let used: BTreeSet<u16> = self
            .read()
            .values()
            .flat_map(|h| h.ports.keys().copied())
            .collect();
        (tpl.port_range.0..tpl.port_range.1)
            .find(|p| !used.contains(p))
            .unwrap_or(tpl.port_range.0)
    }

    // -- projects -----------------------------------------------------------

    /// Write `code` plus a Dockerfile to a fresh project directory, build
    /// the image and start a long-lived container with the directory
    /// mounted at `/app`.
    pub async fn create_project(
        &self,
        language: &str,
        code: &str,
        dependencies: &[String],
        project_name: Option<&str>,
    ) -> Result<ProjectInfo> {
        let tpl = template_for(language)?;
        let project = sanitize_name(
            &project_name
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_{}", tpl.name, Utc::now().format("%Y%m%d_%H%M%S"))),
        );
        let project_path = self.settings.projects_dir.join(tpl.name).join(&project);
        tokio::fs::create_dir_all(&project_path).await?;
        tokio::fs::write(project_path.join(tpl.main_file()), code).await?;
        for (file, content) in scaffold_files(tpl, &project) {
            let path = project_path.join(&file);
            if !path.exists() {
                tokio::fs::write(path, content).await?;
            }
        }
        tokio::fs::write(project_path.join("Dockerfile"), generate_dockerfile(tpl, dependencies)).await?;
        self.provision(tpl, &project, project_path).await
    }

    async fn provision(&self, tpl: &LanguageTemplate, project: &str, project_path: PathBuf) -> Result<ProjectInfo> {
        let image = format!("{CONTAINER_PREFIX}_{}:{project}", tpl.name);
        let name = format!("{CONTAINER_PREFIX}_{}_{project}", tpl.name);
        let port = self.next_port(tpl);
        let guest_port = tpl.port_range.0;
        let host_dir = project_path.display().to_string();

        let placeholder = ContainerHandle {
            id: name.clone(),
            name: name.clone(),
            language: tpl.name.to_string(),
            state: ContainerState::Building,
            image: image.clone(),
            ports: BTreeMap::from([(port, guest_port)]),
            volumes: BTreeMap::from([(host_dir.clone(), "/app".to_string())]),
            project_path: project_path.clone(),
            created_at: Utc::now(),
        };
        self.write().insert(name.clone(), placeholder.clone());

        match self.cli.build(&image, &project_path).await {
            Ok(out) if out.success => {}
            Ok(out) => {
                self.write().remove(&name);
                self.log_op("build", &name, false);
                return Err(SandboxError::Build(out.diagnostics().trim().to_string()));
            }
            Err(e) => {
                self.write().remove(&name);
                return Err(e);
            }
        }

        let spec = RunSpec {
            name: name.clone(),
            image: image.clone(),
            network: Some(self.settings.network.clone()),
            limits: Some(self.resource_limits()),
            volumes: vec![(host_dir, "/app".into())],
            ports: vec![(port, guest_port)],
        };
        let run = match self.cli.run(&spec).await {
            Ok(out) if out.success => out,
            Ok(out) => {
                self.write().remove(&name);
                self.log_op("run", &name, false);
                return Err(SandboxError::Command {
                    op: "run".into(),
                    stderr: out.stderr,
                });
            }
            Err(e) => {
                self.write().remove(&name);
                return Err(e);
            }
        };
        let id: String = run.stdout.trim().chars().take(12).collect();
        let id = if id.is_empty() { name.clone() } else { id };

        {
            let mut table = self.write();
            table.remove(&name);
            table.insert(
                id.clone(),
                ContainerHandle {
                    id: id.clone(),
                    state: ContainerState::Running,
                    ..placeholder
                },
            );
        }
        self.log_op("create", &name, true);
        self.publish_live();
        info!(container = %id, name = %name, language = tpl.name, port, "container started");

        Ok(ProjectInfo {
            container_id: id,
            container_name: name,
            project_path,
            port,
            image,
        })
    }

    /// Overwrite a file in the mounted project directory.
    pub async fn update_code(&self, container: &str, code: &str, filename: Option<&str>) -> Result<PathBuf> {
        let handle = self.require(container)?;
        let tpl = template_for(&handle.language)?;
        let file = filename.map(str::to_string).unwrap_or_else(|| tpl.main_file());
        let path = handle.project_path.join(&file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, code).await?;
        Ok(path)
    }

    /// Optionally overwrite `filename` (the main file by default), then run
    /// it with the language's run command.
    pub async fn run_code(&self, container: &str, code: Option<&str>, filename: Option<&str>) -> Result<ExecOutput> {
        let handle = self.require(container)?;
        let tpl = template_for(&handle.language)?;
        let file = filename.map(str::to_string).unwrap_or_else(|| tpl.main_file());
        if let Some(code) = code {
            self.update_code(container, code, Some(&file)).await?;
        }
        let out = self
            .cli
            .exec_shell(&handle.id, &tpl.run_command(&file), RUN_TIMEOUT)
            .await?;
        if let Some(bus) = &self.bus {
            bus.log_execution("sandbox", &handle.id, out.exit_code, out.success);
        }
        Ok(out)
    }

    /// Optionally overwrite the main and test files, then run the test
    /// command.
    pub async fn run_tests(&self, container: &str, code: Option<&str>, test_code: Option<&str>) -> Result<ExecOutput> {
        let handle = self.require(container)?;
        let tpl = template_for(&handle.language)?;
        if let Some(code) = code {
            self.update_code(container, code, None).await?;
        }
        let test_file = tpl.test_file();
        if let Some(tests) = test_code {
            self.update_code(container, tests, Some(&test_file)).await?;
        }
        let out = self
            .cli
            .exec_shell(&handle.id, &tpl.test_command(&test_file), TEST_TIMEOUT)
            .await?;
        if let Some(bus) = &self.bus {
            bus.log_execution("sandbox", &handle.id, out.exit_code, out.success);
        }
        Ok(out)
    }

    pub async fn exec_command(&self, container: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let handle = self.require(container)?;
        self.cli.exec_shell(&handle.id, command, timeout).await
    }

    pub async fn install_packages(&self, container: &str, packages: &[String], language: Option<&str>) -> Result<ExecOutput> {
        let handle = self.require(container)?;
        let tpl = template_for(language.unwrap_or(&handle.language))?;
        if packages.is_empty() {
            return Ok(ExecOutput::ok(""));
        }
        let cmd = format!("{} {}", tpl.install_cmd, packages.join(" "));
        self.cli.exec_shell(&handle.id, &cmd, INSTALL_TIMEOUT).await
    }

    pub async fn logs(&self, container: &str, lines: usize) -> Result<String> {
        let handle = self.require(container)?;
        let out = self.cli.logs(&handle.id, lines).await?;
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start a container by id or name. Unknown (unmanaged by this process)
    /// containers are passed straight to the runtime.
    pub async fn start(&self, container: &str) -> Result<bool> {
        let key = self.get(container).map(|h| h.id).unwrap_or_else(|| container.to_string());
        let out = self.cli.start(&key).await?;
        if out.success {
            self.set_state(&key, ContainerState::Running);
        }
        self.log_op("start", &key, out.success);
        self.publish_live();
        Ok(out.success)
    }

    pub async fn stop(&self, container: &str) -> Result<bool> {
        let key = self.get(container).map(|h| h.id).unwrap_or_else(|| container.to_string());
        let out = self.cli.stop(&key).await?;
        if out.success {
            self.set_state(&key, ContainerState::Stopped);
        }
        self.log_op("stop", &key, out.success);
        self.publish_live();
        Ok(out.success)
    }

    /// Stop, optionally back up, then remove the container and its image.
    ///
    /// A failed backup or `rm` returns the error with the handle, image and
    /// project directory left in place. The handle is dropped only once the
    /// runtime has removed the container.
    pub async fn remove(&self, container: &str, remove_project: bool, backup: bool) -> Result<RemoveOutcome> {
        let handle = self.get(container);
        let key = handle.as_ref().map(|h| h.id.clone()).unwrap_or_else(|| container.to_string());

        let stopped = self.cli.stop(&key).await?;
        if stopped.success {
            self.set_state(&key, ContainerState::Stopped);
        }

        let mut backup_path = None;
        if let Some(h) = &handle {
            if backup && h.project_path.exists() {
                match self.backup_project(h).await {
                    Ok(path) => backup_path = Some(path),
                    Err(e) => {
                        warn!(container = %key, error = %e, "backup failed, keeping container and project");
                        self.log_op("remove", &key, false);
                        self.publish_live();
                        return Err(e);
                    }
                }
            }
        }

        let out = self.cli.remove(&key).await?;
        if !out.success {
            self.log_op("remove", &key, false);
            self.publish_live();
            return Err(SandboxError::Command {
                op: "rm".into(),
                stderr: out.stderr.trim().to_string(),
            });
        }

        if let Some(h) = &handle {
            self.write().remove(&h.id);
            let rmi = self.cli.remove_image(&h.image).await?;
            if !rmi.success {
                warn!(image = %h.image, stderr = %rmi.stderr.trim(), "image removal failed");
            }
            if remove_project && h.project_path.exists() {
                tokio::fs::remove_dir_all(&h.project_path).await?;
            }
        }
        self.log_op("remove", &key, true);
        self.publish_live();
        Ok(RemoveOutcome {
            removed: true,
            backup_path,
        })
    }

    /// Copy the project tree to
    /// `BACKUP_DIR/containers/{lang}_{name}_{ts}/` with a metadata sidecar.
    pub async fn backup_project(&self, handle: &ContainerHandle) -> Result<PathBuf> {
        let dir_name = format!(
            "{}_{}_{}",
            handle.language,
            handle.name,
            Utc::now().format("%Y%m%d_%H%M%S%3f")
        );
        let target = self.settings.backup_dir.join("containers").join(dir_name);
        let src = handle.project_path.clone();
        let dst = target.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| SandboxError::Archive(e.to_string()))??;
        let metadata = serde_json::json!({
            "container": handle,
            "backup_date": Utc::now().to_rfc3339(),
            "original_path": handle.project_path,
        });
        tokio::fs::write(
            target.join(BACKUP_METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;
        info!(container = %handle.id, path = %target.display(), "project backed up");
        Ok(target)
    }

    pub async fn export_project(&self, container: &str) -> Result<Vec<u8>> {
        let handle = self.require(container)?;
        let name = handle
            .project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| handle.name.clone());
        let path = handle.project_path.clone();
        let language = handle.language.clone();
        let archive = tokio::task::spawn_blocking(move || ProjectArchive::from_dir(&path, &language, &name))
            .await
            .map_err(|e| SandboxError::Archive(e.to_string()))??;
        archive.to_bytes()
    }

    /// Unpack an archive into a new project directory and provision it. A
    /// Dockerfile is generated when the archive has none.
    pub async fn import_project(&self, archive: &[u8], language: &str, name: Option<&str>) -> Result<ProjectInfo> {
        let tpl = template_for(language)?;
        let archive = ProjectArchive::from_bytes(archive)?;
        let project = sanitize_name(
            &name
                .map(str::to_string)
                .unwrap_or_else(|| format!("imported_{}", Utc::now().format("%Y%m%d_%H%M%S"))),
        );
        let project_path = self.settings.projects_dir.join(tpl.name).join(&project);
        let dst = project_path.clone();
        let extracted = archive.clone();
        tokio::task::spawn_blocking(move || extracted.extract_to(&dst))
            .await
            .map_err(|e| SandboxError::Archive(e.to_string()))??;

        if !project_path.join("Dockerfile").exists() {
            let deps = read_dependencies(tpl, &project_path).await;
            tokio::fs::write(project_path.join("Dockerfile"), generate_dockerfile(tpl, &deps)).await?;
        }
        self.provision(tpl, &project, project_path).await
    }

    pub async fn cleanup_images(&self) -> Result<bool> {
        Ok(self.cli.image_prune().await?.success)
    }

    // -- runtime inspection (autoscaler) ------------------------------------

    /// Managed containers as the runtime sees them.
    pub async fn managed(&self, all: bool) -> Result<Vec<PsEntry>> {
        self.cli.ps(CONTAINER_PREFIX, all, None).await
    }

    /// CPU percent per managed container name.
    pub async fn container_cpu(&self) -> Result<BTreeMap<String, f64>> {
        Ok(self
            .cli
            .cpu_stats()
            .await?
            .into_iter()
            .filter(|(name, _)| name.starts_with(CONTAINER_PREFIX))
            .collect())
    }

    /// Remove managed containers stuck in `created`.
    pub async fn sweep_orphans(&self) -> Result<Vec<String>> {
        let orphans = self.cli.ps(CONTAINER_PREFIX, true, Some("created")).await?;
        let mut removed = Vec::new();
        for entry in orphans {
            if self.cli.remove(&entry.name).await?.success {
                self.write().retain(|_, h| h.name != entry.name);
                removed.push(entry.name);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "removed orphan containers");
        }
        Ok(removed)
    }

    /// Stop every known container unless `retain`.
    pub async fn shutdown(&self, retain: bool) {
        if retain {
            info!(count = self.running_count(), "retaining containers on shutdown");
            return;
        }
        let ids: Vec<String> = self
            .list(None)
            .into_iter()
            .filter(|h| h.state == ContainerState::Running)
            .map(|h| h.id)
            .collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(container = %id, error = %e, "failed to stop container on shutdown");
            }
        }
    }
}

async fn read_dependencies(tpl: &LanguageTemplate, dir: &Path) -> Vec<String> {
    match tpl.name {
        "python" => tokio::fs::read_to_string(dir.join("requirements.txt"))
            .await
            .map(|s| {
                s.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        "javascript" | "typescript" => tokio::fs::read(dir.join("package.json"))
            .await
            .ok()
            .and_then(|b| serde_json::from_slice::<serde_json::Value>(&b).ok())
            .and_then(|v| v.get("dependencies").and_then(|d| d.as_object()).map(|d| d.keys().cloned().collect()))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("network", &self.settings.network)
            .field("containers", &self.read().len())
            .finish()
    }
}
