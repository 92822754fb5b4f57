//! Command flows that sequence the container, tunnel, env file and state store.

use crate::docker::{
    ContainerController, ContainerStatus, DockerRunner, HealthStatus, ImageStatus,
};
use crate::env_file::{EnvFileStore, BASE_URL_KEY};
use crate::error::CyrusError;
use crate::settings::Settings;
use crate::state::{RunState, StateStore};
use crate::tools::{has_tools, ResolvedTools, ToolConfigResolver};
use crate::tunnel::{self, TunnelApi, TunnelController, TunnelStatus};
use crate::ui::Ui;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Lets Ctrl+C end a foreground child without killing this process.
fn install_interrupt_guard() {
    INTERRUPTED.store(false, Ordering::SeqCst);
    if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!(error = %err, "interrupt handler already installed");
    }
}

fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[derive(Debug, Clone)]
pub struct Timings {
    pub health_timeout: Duration,
    pub health_poll: Duration,
    pub url_retries: u32,
    pub url_delay: Duration,
}

impl Timings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            health_timeout: settings.health.timeout(),
            health_poll: settings.health.poll_interval(),
            url_retries: settings.tunnel.max_retries,
            url_delay: settings.tunnel.retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub detach: bool,
    pub force_build: bool,
    pub log_lines: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartReport {
    pub already_running: bool,
    pub tunnel_url: Option<String>,
    pub ngrok_pid: Option<u32>,
    pub image: Option<ImageStatus>,
    pub rebuilt: bool,
    pub healthy: bool,
    pub tunnel_active: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StopReport {
    pub container_stopped: bool,
    pub tunnel_stopped: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub container: ContainerStatus,
    pub tunnel: TunnelStatus,
    pub state: RunState,
    pub env_file_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolsReport {
    pub tools_file: String,
    pub generated_dockerfile: PathBuf,
    pub configured: bool,
    pub hash: Option<String>,
    pub resolved: Option<ResolvedTools>,
    pub image: ImageStatus,
}

pub struct Orchestrator<R: DockerRunner, A: TunnelApi> {
    container: ContainerController<R>,
    tunnel: TunnelController<A>,
    state: StateStore,
    env: EnvFileStore,
    tools: ToolConfigResolver,
    timings: Timings,
    ui: Ui,
}

impl<R: DockerRunner, A: TunnelApi> Orchestrator<R, A> {
    pub fn new(
        container: ContainerController<R>,
        tunnel: TunnelController<A>,
        state: StateStore,
        env: EnvFileStore,
        tools: ToolConfigResolver,
        timings: Timings,
        ui: Ui,
    ) -> Self {
        Self {
            container,
            tunnel,
            state,
            env,
            tools,
            timings,
            ui,
        }
    }

    /// Checks every external dependency and reports all missing ones at once.
    pub fn preflight(&self) -> Result<(), CyrusError> {
        let mut missing = Vec::new();
        if !self.container.engine_available() {
            missing.push(
                "  - docker is not installed or the daemon is not running. Install Docker and start it.".to_string(),
            );
        } else if !self.container.compose_available() {
            missing.push(
                "  - docker compose plugin is missing. Install Docker Compose v2.".to_string(),
            );
        }
        if !self.tunnel.binary_available() {
            missing.push(format!(
                "  - {} not found on PATH. Install it from https://ngrok.com/download and run `ngrok config add-authtoken <token>`.",
                self.tunnel.binary()
            ));
        }
        if missing.is_empty() {
            return Ok(());
        }
        Err(CyrusError::Unavailable(missing.join("\n")))
    }

    /// Tool config that actually adds something, with its hash. A tools file
    /// that resolves to nothing counts as no configuration.
    fn current_tools(&self) -> Result<(Option<ResolvedTools>, Option<String>), CyrusError> {
        match self.tools.resolved()? {
            Some(resolved) if has_tools(&resolved) => {
                let hash = self.tools.config_hash()?;
                Ok((Some(resolved), hash))
            }
            _ => Ok((None, None)),
        }
    }

    pub fn image_status(&self) -> Result<ImageStatus, CyrusError> {
        let (_, hash) = self.current_tools()?;
        Ok(self.container.check_image_status(hash.as_deref()))
    }

    pub fn build(&self, no_cache: bool) -> Result<(), CyrusError> {
        let (resolved, hash) = self.current_tools()?;
        match resolved {
            Some(resolved) => {
                self.ui.step("Building image with tools");
                self.container
                    .build_with_tools(&self.tools, &resolved, hash.as_deref(), no_cache)?;
            }
            None => {
                self.ui.step("Building image");
                self.container.build(no_cache)?;
            }
        }
        self.ui.success("Image built");
        Ok(())
    }

    /// Standalone `build` command: fails fast when docker itself is unusable.
    pub fn rebuild(&self, no_cache: bool) -> Result<(), CyrusError> {
        if !self.container.check_available() {
            return Err(CyrusError::Unavailable(
                "  - docker engine or compose plugin is not available. Start Docker and check `docker compose version`.".to_string(),
            ));
        }
        self.build(no_cache)
    }

    /// Returns the staleness decision (when consulted) and whether a build ran.
    fn reconcile_image(&self, force_build: bool) -> Result<(Option<ImageStatus>, bool), CyrusError> {
        if force_build {
            self.ui.step("Rebuilding image (forced)");
            self.build(false)?;
            return Ok((None, true));
        }
        let status = self.image_status()?;
        if !status.needs_rebuild {
            self.ui.info(&format!("Image {}", status.reason));
            return Ok((Some(status), false));
        }
        self.ui.step(&format!("Image needs rebuild: {}", status.reason));
        self.build(false)?;
        Ok((Some(status), true))
    }

    fn stop_tunnel_after_failure(&self, pid: u32) {
        if let Err(err) = tunnel::stop(pid) {
            self.ui.warn(&format!("failed to stop tunnel process {pid}: {err}"));
        }
    }

    fn health_gate(&self) -> bool {
        self.ui.step("Waiting for container to become healthy");
        match self
            .container
            .wait_for_healthy(self.timings.health_timeout, self.timings.health_poll)
        {
            Ok(()) => {
                self.ui.success("Container is healthy");
                true
            }
            Err(err) => {
                self.ui.warn(&format!(
                    "{err}; the agent may still be warming up. Check `cyrus-local logs`."
                ));
                false
            }
        }
    }

    pub fn start(&mut self, options: StartOptions) -> Result<StartReport, CyrusError> {
        self.ui.step("Checking dependencies");
        self.preflight()?;

        if self.state.is_running() {
            let container = self.container.status();
            if container.running {
                let url = self.state.state().tunnel_url.clone();
                let tunnel_active = self.tunnel.is_running();
                self.ui.success("Cyrus is already running");
                if let Some(url) = &url {
                    self.ui.info(&format!("Tunnel URL: {url}"));
                }
                if !tunnel_active {
                    self.ui.warn("the tunnel API reports no public URL; webhooks will not arrive");
                    self.ui
                        .hint("Run `cyrus-local stop` and then `cyrus-local start` to open a new tunnel.");
                }
                return Ok(StartReport {
                    already_running: true,
                    tunnel_url: url,
                    ngrok_pid: self.state.state().ngrok_pid,
                    image: None,
                    rebuilt: false,
                    healthy: container.health == HealthStatus::Healthy,
                    tunnel_active,
                });
            }
            self.ui
                .warn("state says Cyrus is running but the container is not; clearing stale state");
            if let Some(pid) = self.state.state().ngrok_pid {
                if tunnel::is_process_running(pid) {
                    self.stop_tunnel_after_failure(pid);
                }
            }
            self.state.set_stopped()?;
        }

        if !self.env.exists() {
            return Err(CyrusError::Config(format!(
                "no environment file at {}; run `cyrus-local init` first",
                self.env.path().display()
            )));
        }
        let env_config = self.env.read()?;
        let port = env_config.server_port();

        self.ui.step(&format!("Starting tunnel on port {port}"));
        let mut handle = self.tunnel.start(port)?;
        let pid = handle.pid;
        let url = match self
            .tunnel
            .wait_for_url(self.timings.url_retries, self.timings.url_delay)
        {
            Ok(url) => url,
            Err(err) => {
                if handle.has_exited() {
                    self.ui
                        .hint("The tunnel process exited early; check NGROK_AUTHTOKEN in your env file.");
                } else {
                    self.stop_tunnel_after_failure(pid);
                }
                return Err(err);
            }
        };
        self.ui.success(&format!("Tunnel URL: {url}"));

        if let Err(err) = self.env.set(BASE_URL_KEY, &url) {
            self.stop_tunnel_after_failure(pid);
            return Err(err);
        }

        let (image, rebuilt) = match self.reconcile_image(options.force_build) {
            Ok(result) => result,
            Err(err) => {
                self.stop_tunnel_after_failure(pid);
                return Err(err);
            }
        };

        self.ui.step("Starting container");
        if let Err(err) = self.container.up() {
            self.stop_tunnel_after_failure(pid);
            return Err(err);
        }

        let healthy = self.health_gate();

        let docker_dir = self.container.docker_dir().to_path_buf();
        self.state.set_running(pid, &url, &docker_dir)?;
        self.ui.success("Cyrus is running");
        self.ui.info(&format!("Webhook base URL: {url}"));

        let report = StartReport {
            already_running: false,
            tunnel_url: Some(url),
            ngrok_pid: Some(pid),
            image,
            rebuilt,
            healthy,
            tunnel_active: true,
        };
        if !options.detach {
            self.ui.hint("Following logs (Ctrl+C to detach; Cyrus keeps running)");
            self.logs(true, options.log_lines)?;
        }
        Ok(report)
    }

    /// Best effort: every step runs even if an earlier one failed, and the
    /// persisted state is always cleared.
    pub fn stop(&mut self) -> Result<StopReport, CyrusError> {
        let mut warnings = Vec::new();

        self.ui.step("Stopping container");
        let container_stopped = match self.container.down() {
            Ok(()) => true,
            Err(err) => {
                let message = format!("failed to stop container: {err}");
                self.ui.warn(&message);
                warnings.push(message);
                false
            }
        };

        let tunnel_stopped = match self.state.state().ngrok_pid {
            Some(pid) => {
                self.ui.step("Stopping tunnel");
                match tunnel::stop(pid) {
                    Ok(()) => true,
                    Err(err) => {
                        let message = format!("failed to stop tunnel process {pid}: {err}");
                        self.ui.warn(&message);
                        warnings.push(message);
                        false
                    }
                }
            }
            None => true,
        };

        self.state.set_stopped()?;
        self.ui.success("Cyrus stopped");
        Ok(StopReport {
            container_stopped,
            tunnel_stopped,
            warnings,
        })
    }

    /// Recreates the container only; the tunnel and persisted state are untouched.
    pub fn restart(&self) -> Result<bool, CyrusError> {
        self.ui.step("Restarting container");
        self.container.down()?;
        self.container.up()?;
        Ok(self.health_gate())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            container: self.container.status(),
            tunnel: self.tunnel.status(),
            state: self.state.state().clone(),
            env_file_exists: self.env.exists(),
        }
    }

    pub fn tools_report(&self) -> Result<ToolsReport, CyrusError> {
        let resolved = self.tools.resolved()?;
        let hash = self.tools.config_hash()?;
        Ok(ToolsReport {
            tools_file: self.tools.tools_file().to_string_lossy().to_string(),
            generated_dockerfile: self.container.generated_dockerfile().to_path_buf(),
            configured: resolved.is_some(),
            hash,
            resolved,
            image: self.image_status()?,
        })
    }

    pub fn logs(&self, follow: bool, lines: usize) -> Result<(), CyrusError> {
        if !follow {
            self.container.logs(false, lines)?;
            return Ok(());
        }
        install_interrupt_guard();
        match self.container.logs(true, lines) {
            Ok(_) => Ok(()),
            Err(_) if interrupted() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn require_running_container(&self) -> Result<(), CyrusError> {
        if self.container.is_running() {
            return Ok(());
        }
        Err(CyrusError::Process(
            "the Cyrus container is not running; start it with `cyrus-local start`".to_string(),
        ))
    }

    /// Attached session inside the container. Ctrl+C ends it normally.
    pub fn exec_interactive(&self, command: &[String]) -> Result<(), CyrusError> {
        self.require_running_container()?;
        install_interrupt_guard();
        match self.container.exec(command, true) {
            Ok(_) => Ok(()),
            Err(_) if interrupted() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::tests::{
        failed_output, inspect_json, make_controller, ok_output, MockDockerRunner,
    };
    use crate::tunnel::tests::{tunnels_body, ScriptedApi, EMPTY_TUNNELS};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const URL: &str = "https://cyrus-test.ngrok.app";

    impl<R: DockerRunner, A: TunnelApi> Orchestrator<R, A> {
        fn container(&self) -> &ContainerController<R> {
            &self.container
        }
    }

    fn fast_timings() -> Timings {
        Timings {
            health_timeout: Duration::from_secs(5),
            health_poll: Duration::from_millis(1),
            url_retries: 2,
            url_delay: Duration::from_millis(1),
        }
    }

    fn make_orchestrator(
        dir: &Path,
        tunnel_binary: &str,
        api: ScriptedApi,
    ) -> Orchestrator<MockDockerRunner, ScriptedApi> {
        Orchestrator::new(
            make_controller(dir),
            TunnelController::new(api, tunnel_binary),
            StateStore::load(dir.join("state.json")),
            EnvFileStore::new(dir.join(".env"), None),
            ToolConfigResolver::new(dir.join("tools.yaml"), dir.to_path_buf()),
            fast_timings(),
            Ui::new(true),
        )
    }

    fn write_env(dir: &Path) {
        fs::write(dir.join(".env"), "# agent\nCYRUS_BASE_URL=\nLINEAR_CLIENT_ID=id\n").unwrap();
    }

    /// A pid that belonged to a process which has already been reaped.
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn mark_running(dir: &Path, pid: u32) {
        let mut store = StateStore::load(dir.join("state.json"));
        store
            .set_running(pid, "https://old.ngrok.app", &dir.join("docker"))
            .unwrap();
    }

    fn reload_state(dir: &Path) -> RunState {
        StateStore::load(dir.join("state.json")).state().clone()
    }

    fn push_preflight_ok(runner: &MockDockerRunner) {
        runner.push_outputs([
            ok_output("Server Version: 27.0.0"),
            ok_output("Docker Compose version v2.29.0"),
        ]);
    }

    fn detached() -> StartOptions {
        StartOptions {
            detach: true,
            force_build: false,
            log_lines: 100,
        }
    }

    fn compose_subcommand(args: &[String]) -> Option<&str> {
        if args.first().map(String::as_str) == Some("compose") {
            args.get(5).map(String::as_str)
        } else {
            None
        }
    }

    #[test]
    fn preflight_reports_every_missing_dependency() {
        let dir = tempdir().unwrap();
        let orch = make_orchestrator(
            dir.path(),
            "cyrus-local-missing-tunnel-binary",
            ScriptedApi::always(EMPTY_TUNNELS),
        );
        orch.container().runner().push_output(failed_output(
            "Cannot connect to the Docker daemon. Is the docker daemon running?",
        ));
        let err = orch.preflight().unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, CyrusError::Unavailable(_)));
        assert!(message.contains("docker is not installed"));
        assert!(message.contains("cyrus-local-missing-tunnel-binary"));
    }

    #[test]
    fn preflight_reports_missing_compose_plugin() {
        let dir = tempdir().unwrap();
        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.container().runner().push_output(ok_output(""));
        orch.container()
            .runner()
            .push_output(failed_output("docker: 'compose' is not a docker command."));
        let message = orch.preflight().unwrap_err().to_string();
        assert!(message.contains("compose plugin"));
        assert!(!message.contains("ngrok.com"));
    }

    #[test]
    fn start_short_circuits_when_already_running() {
        let dir = tempdir().unwrap();
        mark_running(dir.path(), dead_pid());
        let api = ScriptedApi::always(&tunnels_body(&[("https", "https://old.ngrok.app")]));
        let mut orch = make_orchestrator(dir.path(), "sh", api);
        push_preflight_ok(orch.container().runner());
        orch.container()
            .runner()
            .push_output(ok_output(&inspect_json(true, Some("healthy"))));
        let report = orch.start(detached()).unwrap();
        assert!(report.already_running);
        assert!(report.healthy);
        assert!(report.tunnel_active);
        assert_eq!(report.tunnel_url.as_deref(), Some("https://old.ngrok.app"));
        assert_eq!(orch.container().runner().calls().len(), 3);
        assert!(reload_state(dir.path()).is_running);
    }

    #[test]
    fn already_running_report_reflects_container_health() {
        let dir = tempdir().unwrap();
        mark_running(dir.path(), dead_pid());
        let mut orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        push_preflight_ok(orch.container().runner());
        orch.container()
            .runner()
            .push_output(ok_output(&inspect_json(true, Some("unhealthy"))));
        let report = orch.start(detached()).unwrap();
        assert!(report.already_running);
        assert!(!report.healthy);
        assert!(!report.tunnel_active);
        assert_eq!(orch.container().runner().calls().len(), 3);
    }

    #[test]
    fn stale_state_is_cleared_before_env_check() {
        let dir = tempdir().unwrap();
        mark_running(dir.path(), dead_pid());
        let mut orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        push_preflight_ok(orch.container().runner());
        orch.container()
            .runner()
            .push_output(failed_output("Error: No such object: cyrus"));
        let err = orch.start(detached()).unwrap_err();
        assert!(err.to_string().contains("cyrus-local init"));
        assert_eq!(reload_state(dir.path()), RunState::default());
    }

    #[cfg(unix)]
    #[test]
    fn start_runs_full_flow_and_commits_state() {
        let dir = tempdir().unwrap();
        write_env(dir.path());
        let body = tunnels_body(&[("https", URL)]);
        let mut orch = make_orchestrator(dir.path(), "true", ScriptedApi::always(&body));
        let runner = orch.container().runner();
        push_preflight_ok(runner);
        runner.push_output(ok_output("[]"));
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(&inspect_json(true, Some("healthy"))));

        let report = orch.start(detached()).unwrap();
        assert!(!report.already_running);
        assert!(report.healthy);
        assert!(!report.rebuilt);
        assert_eq!(report.tunnel_url.as_deref(), Some(URL));
        assert_eq!(
            report.image.as_ref().map(|image| image.reason.as_str()),
            Some("up to date (no tools)")
        );

        let env = fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(env.contains(&format!("CYRUS_BASE_URL={URL}\n")));
        assert!(env.starts_with("# agent\n"));

        let state = reload_state(dir.path());
        assert!(state.is_running);
        assert_eq!(state.ngrok_pid, report.ngrok_pid);
        assert_eq!(state.tunnel_url.as_deref(), Some(URL));
        assert_eq!(state.docker_dir, Some(dir.path().join("docker")));

        let subcommands = orch.container().runner().compose_subcommands();
        assert!(subcommands.iter().any(|sub| sub == "up"));
        assert!(!subcommands.iter().any(|sub| sub == "build"));
    }

    #[cfg(unix)]
    #[test]
    fn start_builds_with_tools_when_label_is_stale() {
        let dir = tempdir().unwrap();
        write_env(dir.path());
        fs::write(dir.path().join("tools.yaml"), "presets: [python]\n").unwrap();
        let body = tunnels_body(&[("https", URL)]);
        let mut orch = make_orchestrator(dir.path(), "true", ScriptedApi::always(&body));
        let runner = orch.container().runner();
        push_preflight_ok(runner);
        runner.push_output(ok_output("[]"));
        runner.push_output(ok_output("0000000000000000"));
        for _ in 0..4 {
            runner.push_output(ok_output(""));
        }
        runner.push_output(ok_output(&inspect_json(true, Some("healthy"))));

        let report = orch.start(detached()).unwrap();
        assert!(report.rebuilt);
        assert_eq!(
            report.image.map(|image| image.reason),
            Some("tools configuration changed".to_string())
        );
        let calls = orch.container().runner().calls();
        assert!(calls.iter().any(|call| call.args.first().map(String::as_str) == Some("tag")));
        let hash = ToolConfigResolver::new(dir.path().join("tools.yaml"), dir.path().into())
            .config_hash()
            .unwrap()
            .unwrap();
        assert!(calls
            .iter()
            .any(|call| call.args.contains(&format!("cyrus.tools.hash={hash}"))));
    }

    #[cfg(unix)]
    #[test]
    fn forced_build_skips_staleness_check() {
        let dir = tempdir().unwrap();
        write_env(dir.path());
        let body = tunnels_body(&[("https", URL)]);
        let mut orch = make_orchestrator(dir.path(), "true", ScriptedApi::always(&body));
        let runner = orch.container().runner();
        push_preflight_ok(runner);
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(&inspect_json(true, Some("healthy"))));
        let options = StartOptions {
            force_build: true,
            ..detached()
        };
        let report = orch.start(options).unwrap();
        assert!(report.rebuilt);
        assert!(report.image.is_none());
        let calls = orch.container().runner().calls();
        assert_eq!(compose_subcommand(&calls[2].args), Some("build"));
        assert!(!calls
            .iter()
            .any(|call| call.args.starts_with(&["image".to_string(), "inspect".to_string()])));
    }

    #[cfg(unix)]
    #[test]
    fn tunnel_timeout_aborts_without_touching_env_or_state() {
        let dir = tempdir().unwrap();
        write_env(dir.path());
        let mut orch = make_orchestrator(dir.path(), "true", ScriptedApi::always(EMPTY_TUNNELS));
        push_preflight_ok(orch.container().runner());
        let err = orch.start(detached()).unwrap_err();
        assert!(err.is_timeout());
        let env = fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(env.contains("CYRUS_BASE_URL=\n"));
        assert!(!reload_state(dir.path()).is_running);
        assert_eq!(orch.container().runner().calls().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn failed_up_does_not_mark_running() {
        let dir = tempdir().unwrap();
        write_env(dir.path());
        let body = tunnels_body(&[("https", URL)]);
        let mut orch = make_orchestrator(dir.path(), "true", ScriptedApi::always(&body));
        let runner = orch.container().runner();
        push_preflight_ok(runner);
        runner.push_output(ok_output("[]"));
        runner.push_output(ok_output(""));
        runner.push_output(failed_output("Bind for 0.0.0.0:3456 failed: port is already allocated"));
        let err = orch.start(detached()).unwrap_err();
        assert_eq!(err.details().unwrap().error_code, "docker_port_conflict");
        assert!(!reload_state(dir.path()).is_running);
    }

    #[cfg(unix)]
    #[test]
    fn health_timeout_is_only_a_warning() {
        let dir = tempdir().unwrap();
        write_env(dir.path());
        let body = tunnels_body(&[("https", URL)]);
        let mut orch = make_orchestrator(dir.path(), "true", ScriptedApi::always(&body));
        orch.timings.health_timeout = Duration::ZERO;
        let runner = orch.container().runner();
        push_preflight_ok(runner);
        runner.push_output(ok_output("[]"));
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(&inspect_json(true, Some("starting"))));
        let report = orch.start(detached()).unwrap();
        assert!(!report.healthy);
        assert!(reload_state(dir.path()).is_running);
    }

    #[cfg(unix)]
    #[test]
    fn stop_is_best_effort_and_clears_state() {
        let dir = tempdir().unwrap();
        mark_running(dir.path(), dead_pid());

        let mut orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.container()
            .runner()
            .push_output(failed_output("Cannot connect to the Docker daemon"));
        let report = orch.stop().unwrap();
        assert!(!report.container_stopped);
        assert!(report.tunnel_stopped);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(reload_state(dir.path()), RunState::default());

        let again = orch.stop().unwrap();
        assert!(again.container_stopped);
        assert_eq!(reload_state(dir.path()), RunState::default());
    }

    #[test]
    fn restart_fails_when_compose_up_fails() {
        let dir = tempdir().unwrap();
        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.container().runner().push_output(ok_output(""));
        orch.container()
            .runner()
            .push_output(failed_output("Cannot connect to the Docker daemon"));
        let err = orch.restart().unwrap_err();
        assert_eq!(err.details().unwrap().error_code, "docker_daemon_unreachable");
        assert_eq!(orch.container().runner().calls().len(), 2);
    }

    #[test]
    fn restart_recreates_container_and_keeps_state() {
        let dir = tempdir().unwrap();
        mark_running(dir.path(), dead_pid());
        let before = reload_state(dir.path());
        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        let runner = orch.container().runner();
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(""));
        runner.push_output(ok_output(&inspect_json(true, Some("healthy"))));
        assert!(orch.restart().unwrap());
        let calls = orch.container().runner().calls();
        assert_eq!(compose_subcommand(&calls[0].args), Some("down"));
        assert_eq!(compose_subcommand(&calls[1].args), Some("up"));
        assert_eq!(reload_state(dir.path()), before);
    }

    #[test]
    fn status_never_fails() {
        let dir = tempdir().unwrap();
        let orch = make_orchestrator(
            dir.path(),
            "sh",
            ScriptedApi::always(EMPTY_TUNNELS)
                .then(Err(CyrusError::Process("connection refused".to_string()))),
        );
        orch.container()
            .runner()
            .push_output(failed_output("Cannot connect to the Docker daemon"));
        let report = orch.status();
        assert!(!report.container.running);
        assert!(!report.tunnel.running);
        assert!(!report.env_file_exists);
        assert!(!report.state.is_running);
    }

    #[test]
    fn rebuild_checks_docker_before_building() {
        let dir = tempdir().unwrap();
        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.container()
            .runner()
            .push_output(failed_output("Cannot connect to the Docker daemon"));
        let err = orch.rebuild(false).unwrap_err();
        assert!(matches!(err, CyrusError::Unavailable(_)));
        assert_eq!(orch.container().runner().calls().len(), 1);

        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.rebuild(true).unwrap();
        let calls = orch.container().runner().calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(&calls[2].args[5..], &["build", "--no-cache", "cyrus"]);
    }

    #[test]
    fn empty_tools_file_counts_as_no_tools() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tools.yaml"), "presets: []\n").unwrap();
        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.container().runner().push_output(ok_output("[]"));
        orch.container().runner().push_output(ok_output(""));
        let report = orch.tools_report().unwrap();
        assert!(report.configured);
        assert!(report.hash.is_some());
        assert!(!report.image.needs_rebuild);
        assert_eq!(report.image.reason, "up to date (no tools)");
        assert_eq!(
            report.generated_dockerfile,
            dir.path().join("build").join("Dockerfile.tools")
        );
    }

    #[test]
    fn exec_requires_running_container() {
        let dir = tempdir().unwrap();
        let orch = make_orchestrator(dir.path(), "sh", ScriptedApi::always(EMPTY_TUNNELS));
        orch.container()
            .runner()
            .push_output(failed_output("Error: No such object: cyrus"));
        let err = orch
            .exec_interactive(&["bash".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("not running"));
        let calls = orch.container().runner().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "inspect");
    }
}
