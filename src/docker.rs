use crate::env_file::{DEFAULT_SERVER_PORT, SERVER_PORT_KEY};
use crate::error::{CyrusError, ProcessErrorDetails};
use crate::settings::{write_atomic, DockerSettings};
use crate::tools::{ResolvedTools, ToolConfigResolver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub const TOOLS_HASH_LABEL: &str = "cyrus.tools.hash";
pub const ENV_FILE_VAR: &str = "CYRUS_ENV_FILE";
pub const IMAGE_VAR: &str = "CYRUS_IMAGE";
pub const CONTAINER_NAME_VAR: &str = "CYRUS_CONTAINER_NAME";

/// Exit status and captured streams of one `docker` invocation. Streams stay
/// empty when output was passed through to the terminal.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        // Killed by a signal: no code, and never a success.
        let status_code = status.code().unwrap_or(if status.success() { 0 } else { 1 });
        Self {
            status_code,
            stdout,
            stderr,
        }
    }

    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Seam between the container controller and the `docker` CLI.
pub trait DockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

/// Runs the `docker` binary from `PATH` inside the compose bundle directory.
pub struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new("docker");
        cmd.args(args).envs(env_overrides);
        // A missing bundle dir surfaces as a compose error naming the file.
        if cwd.is_dir() {
            cmd.current_dir(cwd);
        }
        if !capture_output {
            let status = cmd.status()?;
            return Ok(CommandOutput::from_status(status, Vec::new(), Vec::new()));
        }
        let output = cmd.stdin(Stdio::null()).output()?;
        Ok(CommandOutput::from_status(
            output.status,
            output.stdout,
            output.stderr,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            "starting" => HealthStatus::Starting,
            _ => HealthStatus::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub running: bool,
    pub health: HealthStatus,
    pub container_id: Option<String>,
    pub uptime_secs: Option<u64>,
}

impl ContainerStatus {
    pub fn stopped() -> Self {
        Self {
            running: false,
            health: HealthStatus::None,
            container_id: None,
            uptime_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageStatus {
    pub needs_rebuild: bool,
    pub reason: String,
}

impl ImageStatus {
    fn rebuild(reason: impl Into<String>) -> Self {
        Self {
            needs_rebuild: true,
            reason: reason.into(),
        }
    }

    fn current(reason: impl Into<String>) -> Self {
        Self {
            needs_rebuild: false,
            reason: reason.into(),
        }
    }
}

/// Staleness decision table, evaluated top to bottom.
pub fn decide_image_status(
    image: &str,
    exists: bool,
    image_hash: Option<&str>,
    current_hash: Option<&str>,
) -> ImageStatus {
    if !exists {
        return ImageStatus::rebuild(format!("image {image} does not exist"));
    }
    match (current_hash, image_hash) {
        (None, Some(_)) => ImageStatus::rebuild("tools configuration removed"),
        (None, None) => ImageStatus::current("up to date (no tools)"),
        (Some(_), None) => ImageStatus::rebuild("image is missing tools hash label"),
        (Some(current), Some(label)) if current != label => {
            ImageStatus::rebuild("tools configuration changed")
        }
        (Some(_), Some(_)) => ImageStatus::current("up to date"),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    state: InspectState,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    started_at: Option<String>,
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

fn parse_container_status(text: &str, now: DateTime<Utc>) -> Option<ContainerStatus> {
    let entries: Vec<InspectEntry> = serde_json::from_str(text).ok()?;
    let entry = entries.into_iter().next()?;
    let running = entry.state.running;
    let health = entry
        .state
        .health
        .as_ref()
        .map(|health| HealthStatus::parse(&health.status))
        .unwrap_or(HealthStatus::None);
    let container_id = if entry.id.is_empty() {
        None
    } else {
        Some(entry.id.chars().take(12).collect())
    };
    let uptime_secs = if running {
        entry
            .state
            .started_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|started| {
                let elapsed = now - started.with_timezone(&Utc);
                elapsed.num_seconds().max(0) as u64
            })
    } else {
        None
    };
    Some(ContainerStatus {
        running,
        health,
        container_id,
        uptime_secs,
    })
}

/// Renders the invocation so it can be pasted into a shell, with the compose
/// variables this crate exports in front.
fn render_docker_command(args: &[String], env_overrides: &BTreeMap<String, String>) -> String {
    fn quote(part: &str) -> String {
        let plain = !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
        if plain {
            part.to_string()
        } else {
            format!("'{}'", part.replace('\'', r"'\''"))
        }
    }
    let mut rendered = vec!["docker".to_string()];
    rendered.extend(args.iter().map(|arg| quote(arg)));
    let command = rendered.join(" ");
    if env_overrides.is_empty() {
        return command;
    }
    let prefix = env_overrides
        .iter()
        .map(|(key, value)| format!("{key}={}", quote(value)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{prefix} {command}")
}

fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    let (error_code, hint) = match err.kind() {
        io::ErrorKind::NotFound => (
            "docker_not_found",
            Some("cyrus-local needs Docker Engine or Docker Desktop with the compose plugin; make sure `docker` is on your PATH."),
        ),
        io::ErrorKind::PermissionDenied => (
            "docker_permission_denied",
            Some("The `docker` binary could not be executed; check its permissions."),
        ),
        _ => ("process_command_failed", None),
    };
    ProcessErrorDetails {
        error_code: error_code.to_string(),
        hint: hint.map(str::to_string),
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

fn classify_docker_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown command: docker compose")
        || lower.contains("'compose' is not a docker command")
        || lower.contains("is not a docker command")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some("Install the Docker Compose v2 plugin (`docker compose version` must work).".to_string()),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some("The agent port is already in use. Stop the other process or change CYRUS_SERVER_PORT.".to_string()),
        );
    }

    if lower.contains("no such container") || lower.contains("no such object") {
        return (
            "container_not_found".to_string(),
            Some("The container is not running. Start it with `cyrus-local start`.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") || lower.contains("authentication")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Registry access was denied. Run `docker login` and retry.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Wraps every `docker` / `docker compose` invocation for the agent stack.
pub struct ContainerController<R: DockerRunner> {
    runner: R,
    settings: DockerSettings,
    docker_dir: PathBuf,
    env_file: PathBuf,
    generated_dockerfile: PathBuf,
    server_port: u16,
    stream_output: bool,
}

impl<R: DockerRunner> ContainerController<R> {
    pub fn new(
        runner: R,
        settings: DockerSettings,
        docker_dir: PathBuf,
        env_file: PathBuf,
        generated_dockerfile: PathBuf,
    ) -> Self {
        Self {
            runner,
            settings,
            docker_dir,
            env_file,
            generated_dockerfile,
            server_port: DEFAULT_SERVER_PORT,
            stream_output: true,
        }
    }

    /// Port the agent listens on, published on the host loopback by compose.
    pub fn with_server_port(mut self, server_port: u16) -> Self {
        self.server_port = server_port;
        self
    }

    /// Captures build output instead of letting it reach the terminal.
    pub fn with_stream_output(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }

    pub fn docker_dir(&self) -> &Path {
        &self.docker_dir
    }

    pub fn generated_dockerfile(&self) -> &Path {
        &self.generated_dockerfile
    }

    fn env_overrides(&self) -> BTreeMap<String, String> {
        let mut envs = BTreeMap::new();
        envs.insert(
            ENV_FILE_VAR.to_string(),
            self.env_file.to_string_lossy().to_string(),
        );
        envs.insert(IMAGE_VAR.to_string(), self.settings.image.clone());
        envs.insert(
            CONTAINER_NAME_VAR.to_string(),
            self.settings.container_name.clone(),
        );
        envs.insert(SERVER_PORT_KEY.to_string(), self.server_port.to_string());
        envs
    }

    fn compose_args(&self, sub: &[&str]) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if !self.settings.project_name.trim().is_empty() {
            args.push("-p".to_string());
            args.push(self.settings.project_name.clone());
        }
        args.push("-f".to_string());
        args.push(
            self.docker_dir
                .join(crate::settings::COMPOSE_FILE)
                .to_string_lossy()
                .to_string(),
        );
        args.extend(sub.iter().map(|s| s.to_string()));
        args
    }

    fn execute(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, CyrusError> {
        let envs = self.env_overrides();
        let command = render_docker_command(args, &BTreeMap::new());
        debug!(
            command = %render_docker_command(args, &envs),
            project = %self.settings.project_name,
            "running docker"
        );
        let cmd_output = self
            .runner
            .run(args, &self.docker_dir, &envs, capture_output)
            .map_err(|err| CyrusError::ProcessDetailed {
                message: format!("failed to run command `{command}`: {err}"),
                details: docker_spawn_error_details(&err, &command),
            })?;
        if !cmd_output.success() {
            let stderr = cmd_output.stderr_text();
            let (error_code, hint) = classify_docker_failure(&stderr);
            let mut message = format!(
                "command failed with status {} while running `{}`",
                cmd_output.status_code, command
            );
            if !stderr.is_empty() {
                message = format!("{message}: {stderr}");
            }
            if let Some(ref hint_message) = hint {
                message = format!("{message}\nHint: {hint_message}");
            }
            return Err(CyrusError::ProcessDetailed {
                message,
                details: ProcessErrorDetails {
                    error_code,
                    hint,
                    command: Some(command),
                    raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
                },
            });
        }
        Ok(cmd_output)
    }

    /// Runs a query and reports only whether it succeeded.
    fn probe(&self, args: &[String]) -> bool {
        match self.execute(args, true) {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "docker probe failed");
                false
            }
        }
    }

    pub fn engine_available(&self) -> bool {
        self.probe(&["info".to_string()])
    }

    pub fn compose_available(&self) -> bool {
        self.probe(&["compose".to_string(), "version".to_string()])
    }

    pub fn check_available(&self) -> bool {
        self.engine_available() && self.compose_available()
    }

    pub fn build(&self, no_cache: bool) -> Result<(), CyrusError> {
        let mut sub = vec!["build"];
        if no_cache {
            sub.push("--no-cache");
        }
        sub.push(self.settings.service.as_str());
        let args = self.compose_args(&sub);
        self.execute(&args, !self.stream_output)?;
        Ok(())
    }

    /// Builds the compose image, retags it as the base, then layers the tool
    /// Dockerfile on top and labels the result with `tools_hash`.
    pub fn build_with_tools(
        &self,
        tools: &ToolConfigResolver,
        resolved: &ResolvedTools,
        tools_hash: Option<&str>,
        no_cache: bool,
    ) -> Result<(), CyrusError> {
        self.build(no_cache)?;
        self.execute(
            &[
                "tag".to_string(),
                self.settings.image.clone(),
                self.settings.base_image.clone(),
            ],
            true,
        )?;

        let dockerfile = tools.render_dockerfile(resolved, &self.settings.base_image)?;
        write_atomic(&self.generated_dockerfile, &dockerfile)?;
        let result = self.build_generated(tools_hash, no_cache);
        self.cleanup_generated_dockerfile();
        result
    }

    fn build_generated(&self, tools_hash: Option<&str>, no_cache: bool) -> Result<(), CyrusError> {
        let context_dir = self
            .generated_dockerfile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            self.generated_dockerfile.to_string_lossy().to_string(),
            "-t".to_string(),
            self.settings.image.clone(),
        ];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        if let Some(hash) = tools_hash {
            args.push("--label".to_string());
            args.push(format!("{TOOLS_HASH_LABEL}={hash}"));
        }
        args.push(context_dir.to_string_lossy().to_string());
        self.execute(&args, !self.stream_output)?;
        Ok(())
    }

    /// Removes the generated Dockerfile. Returns false when removal failed.
    pub fn cleanup_generated_dockerfile(&self) -> bool {
        if !self.generated_dockerfile.exists() {
            return true;
        }
        match fs::remove_file(&self.generated_dockerfile) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "failed to remove generated Dockerfile");
                false
            }
        }
    }

    pub fn image_exists(&self) -> bool {
        self.probe(&[
            "image".to_string(),
            "inspect".to_string(),
            self.settings.image.clone(),
        ])
    }

    pub fn image_tools_hash(&self) -> Option<String> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            format!("{{{{ index .Config.Labels \"{TOOLS_HASH_LABEL}\" }}}}"),
            self.settings.image.clone(),
        ];
        let output = self.execute(&args, true).ok()?;
        let text = output.stdout_text();
        if text.is_empty() || text == "<no value>" {
            return None;
        }
        Some(text)
    }

    pub fn check_image_status(&self, current_hash: Option<&str>) -> ImageStatus {
        let exists = self.image_exists();
        let image_hash = if exists {
            self.image_tools_hash()
        } else {
            None
        };
        decide_image_status(
            &self.settings.image,
            exists,
            image_hash.as_deref(),
            current_hash,
        )
    }

    pub fn up(&self) -> Result<(), CyrusError> {
        let args = self.compose_args(&["up", "-d"]);
        self.execute(&args, true)?;
        Ok(())
    }

    pub fn down(&self) -> Result<(), CyrusError> {
        let args = self.compose_args(&["down"]);
        self.execute(&args, true)?;
        Ok(())
    }

    pub fn exec(&self, command: &[String], interactive: bool) -> Result<CommandOutput, CyrusError> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-it".to_string());
        }
        args.push(self.settings.container_name.clone());
        args.extend(command.iter().cloned());
        self.execute(&args, !interactive)
    }

    /// Never fails: any inspect error reads as a stopped container.
    pub fn status(&self) -> ContainerStatus {
        let args = vec!["inspect".to_string(), self.settings.container_name.clone()];
        let output = match self.execute(&args, true) {
            Ok(output) => output,
            Err(err) => {
                debug!(error = %err, "container inspect failed");
                return ContainerStatus::stopped();
            }
        };
        parse_container_status(&String::from_utf8_lossy(&output.stdout), Utc::now())
            .unwrap_or_else(ContainerStatus::stopped)
    }

    pub fn is_running(&self) -> bool {
        self.status().running
    }

    pub fn wait_for_healthy(&self, timeout: Duration, poll_interval: Duration) -> Result<(), CyrusError> {
        let started = Instant::now();
        loop {
            let status = self.status();
            debug!(running = status.running, health = status.health.as_str(), "health poll");
            if !status.running {
                return Err(CyrusError::Process(
                    "container stopped while waiting for it to become healthy".to_string(),
                ));
            }
            match status.health {
                HealthStatus::Healthy => return Ok(()),
                HealthStatus::Unhealthy => {
                    return Err(CyrusError::Process(
                        "container reported unhealthy".to_string(),
                    ))
                }
                HealthStatus::Starting | HealthStatus::None => {}
            }
            if started.elapsed() >= timeout {
                return Err(CyrusError::Timeout(format!(
                    "container did not become healthy within {}s",
                    timeout.as_secs()
                )));
            }
            thread::sleep(poll_interval);
        }
    }

    pub fn logs(&self, follow: bool, lines: usize) -> Result<CommandOutput, CyrusError> {
        let tail = lines.to_string();
        let mut sub = vec!["logs", "--tail", tail.as_str()];
        if follow {
            sub.push("--follow");
        }
        sub.push(self.settings.service.as_str());
        let args = self.compose_args(&sub);
        self.execute(&args, false)
    }
}
