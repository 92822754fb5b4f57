mod docker;
mod env_file;
mod error;
mod orchestrator;
mod settings;
mod state;
mod tools;
mod tunnel;
mod ui;

use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password, Select};
use serde::Serialize;
use serde_json::json;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use crate::docker::{ContainerController, HealthStatus, RealDockerRunner};
use crate::env_file::{EnvConfig, EnvFileStore, DEFAULT_SERVER_PORT};
use crate::error::{CyrusError, ProcessErrorDetails};
use crate::orchestrator::{Orchestrator, StartOptions, StatusReport, Timings, ToolsReport};
use crate::settings::{
    read_settings, resolve_config_dir, resolve_docker_dir, resolve_env_file, write_atomic, Paths,
    Settings, DEFAULT_SETTINGS_YAML, SETTINGS_FILE,
};
use crate::state::StateStore;
use crate::tools::{ToolConfigResolver, PRESETS, TOOLS_TEMPLATE_YAML};
use crate::tunnel::{HttpTunnelApi, TunnelController};
use crate::ui::{init_tracing, Ui};

const DEFAULT_LOG_LINES: usize = 100;

#[derive(Parser, Debug)]
#[command(
    name = "cyrus-local",
    version,
    about = "Run the Cyrus agent locally with Docker Compose and an ngrok tunnel"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long = "config-dir", global = true)]
    config_dir: Option<PathBuf>,
    #[arg(long = "env-file", global = true)]
    env_file: Option<PathBuf>,
    #[arg(long = "docker-dir", global = true)]
    docker_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the environment file and fill in credentials
    Init {
        #[arg(long, default_value_t = false)]
        defaults: bool,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Start the tunnel and the agent container
    Start {
        #[arg(long, short = 'd', default_value_t = false)]
        detach: bool,
        /// Rebuild the image even if it is up to date
        #[arg(long, default_value_t = false)]
        build: bool,
    },
    Stop,
    Restart,
    Status,
    Logs {
        #[arg(long, short = 'f', default_value_t = false)]
        follow: bool,
        #[arg(long, short = 'n', default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
    /// Open a shell (or run a command) inside the container
    Shell {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Authorize the agent with Linear
    Auth,
    /// Register a repository with the agent
    AddRepo {
        url: Option<String>,
    },
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
    Build {
        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    List,
    Show,
    Init,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Path,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    paths: Paths,
    settings: Settings,
    json: bool,
    ui: Ui,
}

fn main() -> Result<(), CyrusError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;

    let result = match build_context(&cli) {
        Ok(ctx) => run(&ctx, cli.command),
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => Ok(()),
        Err(CyrusError::Cancelled) => {
            if json {
                print_json(&JsonResult::<serde_json::Value> {
                    ok: true,
                    result: Some(json!({"cancelled": true})),
                    error: None,
                    error_details: None,
                })?;
            } else {
                println!("Cancelled.");
            }
            Ok(())
        }
        Err(err) => {
            if json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                    error_details: err.details(),
                };
                print_json(&payload)?;
            } else {
                Ui::new(false).error(&err.to_string());
            }
            std::process::exit(1);
        }
    }
}

fn run(ctx: &Context, command: Commands) -> Result<(), CyrusError> {
    match command {
        Commands::Init { defaults, force } => handle_init(ctx, defaults, force),
        Commands::Start { detach, build } => handle_start(ctx, detach, build),
        Commands::Stop => handle_stop(ctx),
        Commands::Restart => handle_restart(ctx),
        Commands::Status => handle_status(ctx),
        Commands::Logs { follow, lines } => build_orchestrator(ctx)?.logs(follow, lines),
        Commands::Shell { command } => {
            let command = if command.is_empty() {
                vec!["bash".to_string()]
            } else {
                command
            };
            build_orchestrator(ctx)?.exec_interactive(&command)
        }
        Commands::Auth => build_orchestrator(ctx)?
            .exec_interactive(&["cyrus".to_string(), "self-auth".to_string()]),
        Commands::AddRepo { url } => {
            let mut command = vec!["cyrus".to_string(), "self-add-repo".to_string()];
            command.extend(url);
            build_orchestrator(ctx)?.exec_interactive(&command)
        }
        Commands::Tools { command } => handle_tools(ctx, command),
        Commands::Build { no_cache } => {
            build_orchestrator(ctx)?.rebuild(no_cache)?;
            output(ctx, json!({"built": true, "image": ctx.settings.docker.image}), |_| {})
        }
        Commands::Config { command } => handle_config(ctx, command),
    }
}

fn build_context(cli: &Cli) -> Result<Context, CyrusError> {
    let config_dir = resolve_config_dir(cli.config_dir.as_ref());
    let settings_file = config_dir.join(SETTINGS_FILE);
    let settings = read_settings(&settings_file).map_err(|err| {
        CyrusError::Config(format!(
            "config is invalid. Please edit {} and try again. ({})",
            settings_file.display(),
            err
        ))
    })?;
    let docker_dir = resolve_docker_dir(cli.docker_dir.as_ref(), &settings);
    let mut paths = Paths::in_config_dir(config_dir, docker_dir);
    paths.env_file = resolve_env_file(cli.env_file.as_ref(), &paths.config_dir);
    Ok(Context {
        paths,
        settings,
        json: cli.json,
        ui: Ui::new(cli.json),
    })
}

fn env_store(ctx: &Context) -> EnvFileStore {
    EnvFileStore::new(ctx.paths.env_file.clone(), Some(ctx.paths.env_template()))
}

fn tool_resolver(ctx: &Context) -> ToolConfigResolver {
    ToolConfigResolver::new(ctx.paths.tools_file.clone(), ctx.paths.config_dir.clone())
}

fn build_orchestrator(
    ctx: &Context,
) -> Result<Orchestrator<RealDockerRunner, HttpTunnelApi>, CyrusError> {
    let env = env_store(ctx);
    let env_config = env.read()?;
    let container = ContainerController::new(
        RealDockerRunner,
        ctx.settings.docker.clone(),
        ctx.paths.docker_dir.clone(),
        ctx.paths.env_file.clone(),
        ctx.paths.generated_dockerfile(),
    )
    .with_server_port(env_config.server_port())
    .with_stream_output(!ctx.json);
    let tunnel = TunnelController::new(
        HttpTunnelApi::new(&ctx.settings.tunnel.api_url)?,
        &ctx.settings.tunnel.binary,
    )
    .with_authtoken(env_config.ngrok_authtoken);
    Ok(Orchestrator::new(
        container,
        tunnel,
        StateStore::load(ctx.paths.state_file.clone()),
        env,
        tool_resolver(ctx),
        Timings::from_settings(&ctx.settings),
        ctx.ui,
    ))
}

fn handle_start(ctx: &Context, detach: bool, build: bool) -> Result<(), CyrusError> {
    let mut orchestrator = build_orchestrator(ctx)?;
    // Following logs would interleave with the JSON document.
    let options = StartOptions {
        detach: detach || ctx.json,
        force_build: build,
        log_lines: DEFAULT_LOG_LINES,
    };
    let report = orchestrator.start(options)?;
    if ctx.json {
        return output(ctx, json!(report), |_| {});
    }
    if options.detach {
        ctx.ui.hint("Follow logs with `cyrus-local logs -f`; stop with `cyrus-local stop`.");
    }
    Ok(())
}

fn handle_stop(ctx: &Context) -> Result<(), CyrusError> {
    let report = build_orchestrator(ctx)?.stop()?;
    output(ctx, json!(report), |_| {})
}

fn handle_restart(ctx: &Context) -> Result<(), CyrusError> {
    let healthy = build_orchestrator(ctx)?.restart()?;
    output(ctx, json!({"restarted": true, "healthy": healthy}), |ui| {
        ui.success("Container restarted");
    })
}

fn handle_status(ctx: &Context) -> Result<(), CyrusError> {
    let report = build_orchestrator(ctx)?.status();
    output(ctx, json!(report), |ui| render_status(ui, ctx, &report))
}

fn render_status(ui: &Ui, ctx: &Context, report: &StatusReport) {
    ui.step("Cyrus status");
    let container = &report.container;
    if container.running {
        let mut line = format!("Container: running ({})", health_label(container.health));
        if let Some(id) = &container.container_id {
            line.push_str(&format!(", id {id}"));
        }
        if let Some(secs) = container.uptime_secs {
            line.push_str(&format!(", up {}", format_uptime(secs)));
        }
        ui.info(&line);
    } else {
        ui.info("Container: stopped");
    }
    match &report.tunnel.url {
        Some(url) => ui.info(&format!("Tunnel: {url}")),
        None => ui.info("Tunnel: not running"),
    }
    let state = &report.state;
    if state.is_running {
        let since = state
            .started_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
        let pid = state
            .ngrok_pid
            .map(|pid| pid.to_string())
            .unwrap_or_default();
        ui.info(&format!("State: running since {since} (tunnel pid {pid})"));
    } else {
        ui.info("State: stopped");
    }
    if report.env_file_exists {
        ui.info(&format!("Env file: {}", ctx.paths.env_file.display()));
    } else {
        ui.warn(&format!(
            "no env file at {}; run `cyrus-local init`",
            ctx.paths.env_file.display()
        ));
    }
}

fn health_label(health: HealthStatus) -> &'static str {
    match health {
        HealthStatus::None => "no healthcheck",
        other => other.as_str(),
    }
}

fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn handle_tools(ctx: &Context, command: ToolsCommand) -> Result<(), CyrusError> {
    match command {
        ToolsCommand::List => {
            let presets: Vec<serde_json::Value> = PRESETS
                .iter()
                .map(|preset| {
                    json!({
                        "name": preset.name,
                        "description": preset.description,
                        "apt": preset.apt,
                        "npm": preset.npm,
                        "pip": preset.pip,
                        "cargo": preset.cargo,
                        "commands": preset.commands,
                    })
                })
                .collect();
            output(ctx, json!({"presets": presets}), |ui| {
                ui.step("Available presets");
                for preset in PRESETS {
                    println!("  {:<12} {}", preset.name, preset.description);
                    for (label, items) in [
                        ("apt", preset.apt),
                        ("npm", preset.npm),
                        ("pip", preset.pip),
                        ("cargo", preset.cargo),
                    ] {
                        if !items.is_empty() {
                            ui.hint(&format!("{label}: {}", items.join(", ")));
                        }
                    }
                    if !preset.commands.is_empty() {
                        ui.hint(&format!("commands: {}", preset.commands.len()));
                    }
                }
            })
        }
        ToolsCommand::Show => {
            let report = build_orchestrator(ctx)?.tools_report()?;
            output(ctx, json!(report), |ui| render_tools(ui, &report))
        }
        ToolsCommand::Init => {
            let path = ctx.paths.tools_file.clone();
            if path.exists() {
                return output(ctx, json!({"path": path, "created": false}), |ui| {
                    ui.info(&format!("{} already exists", path.display()));
                });
            }
            write_atomic(&path, TOOLS_TEMPLATE_YAML)?;
            output(ctx, json!({"path": path, "created": true}), |ui| {
                ui.success(&format!("Created {}", path.display()));
                ui.hint("Edit it, then run `cyrus-local build` or `cyrus-local start`.");
            })
        }
    }
}

fn render_tools(ui: &Ui, report: &ToolsReport) {
    let Some(resolved) = &report.resolved else {
        ui.info(&format!("No tool configuration at {}", report.tools_file));
        ui.hint("Create one with `cyrus-local tools init`.");
        return;
    };
    ui.step(&format!("Tools from {}", report.tools_file));
    for (label, items) in [
        ("apt", &resolved.apt),
        ("npm", &resolved.npm),
        ("pip", &resolved.pip),
        ("cargo", &resolved.cargo),
        ("commands", &resolved.commands),
    ] {
        if items.is_empty() {
            continue;
        }
        ui.info(&format!("{label}:"));
        for item in items {
            println!("      - {item}");
        }
    }
    if let Some(custom) = &resolved.custom_dockerfile {
        ui.info(&format!("custom Dockerfile: {}", custom.display()));
    }
    if let Some(hash) = &report.hash {
        ui.info(&format!("hash: {hash}"));
    }
    ui.info(&format!(
        "generated Dockerfile: {}",
        report.generated_dockerfile.display()
    ));
    if report.image.needs_rebuild {
        ui.warn(&format!("image needs rebuild: {}", report.image.reason));
    } else {
        ui.success(&format!("image {}", report.image.reason));
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), CyrusError> {
    let settings_file = &ctx.paths.settings_file;
    match command {
        ConfigCommand::Init => {
            if settings_file.exists() {
                return output(ctx, json!({"path": settings_file, "created": false}), |ui| {
                    ui.info(&format!("{} already exists", settings_file.display()));
                });
            }
            write_atomic(settings_file, DEFAULT_SETTINGS_YAML)?;
            output(ctx, json!({"path": settings_file, "created": true}), |ui| {
                ui.success(&format!("Created {}", settings_file.display()));
            })
        }
        ConfigCommand::Validate => {
            read_settings(settings_file)?;
            let tools = tool_resolver(ctx);
            tools.load()?;
            output(
                ctx,
                json!({
                    "path": settings_file,
                    "valid": true,
                    "tools_file": tools.tools_file(),
                    "tools_file_exists": tools.exists(),
                }),
                |ui| ui.success(&format!("{} is valid", settings_file.display())),
            )
        }
        ConfigCommand::Path => {
            let paths = &ctx.paths;
            let payload = json!({
                "config_dir": paths.config_dir,
                "settings_file": paths.settings_file,
                "env_file": paths.env_file,
                "state_file": paths.state_file,
                "tools_file": paths.tools_file,
                "generated_dockerfile": paths.generated_dockerfile(),
                "docker_dir": paths.docker_dir,
                "compose_file": paths.compose_file(),
            });
            output(ctx, payload, |_| {
                for (label, path) in [
                    ("config dir", &paths.config_dir),
                    ("settings", &paths.settings_file),
                    ("env file", &paths.env_file),
                    ("state", &paths.state_file),
                    ("tools", &paths.tools_file),
                    ("docker dir", &paths.docker_dir),
                ] {
                    println!("{label:<12} {}", path.display());
                }
                println!("{:<12} {}", "dockerfile", paths.generated_dockerfile().display());
            })
        }
    }
}

fn handle_init(ctx: &Context, defaults: bool, force: bool) -> Result<(), CyrusError> {
    if ctx.json && !defaults {
        return Err(CyrusError::Process(
            "--json is only supported with `cyrus-local init --defaults`".to_string(),
        ));
    }
    if !defaults && !io::stdin().is_terminal() {
        return Err(CyrusError::Process(
            "interactive init requires a TTY; re-run with `--defaults` for non-interactive mode"
                .to_string(),
        ));
    }

    let store = env_store(ctx);
    let env_path = store.path().to_path_buf();
    let template = ctx.paths.env_template();
    let theme = ColorfulTheme::default();

    if store.exists() && !force {
        if defaults {
            return output(ctx, json!({"env_file": env_path, "created": false}), |ui| {
                ui.info(&format!("{} already exists; keeping it", env_path.display()));
                ui.hint("Pass --force to recreate it from the template.");
            });
        }
        let overwrite = Confirm::with_theme(&theme)
            .with_prompt(format!(
                "{} already exists. Overwrite it?",
                env_path.display()
            ))
            .default(false)
            .interact_opt()?;
        if overwrite != Some(true) {
            return Err(CyrusError::Cancelled);
        }
    }

    if !template.is_file() {
        ctx.ui.warn(&format!(
            "no env template at {}; starting from an empty file",
            template.display()
        ));
    }

    if defaults {
        store.write_template()?;
        return output(ctx, json!({"env_file": env_path, "created": true}), |ui| {
            ui.success(&format!("Created {}", env_path.display()));
            ui.hint("Fill in your credentials, then run `cyrus-local start`.");
        });
    }

    let current = store.read()?;
    println!("{}", dialoguer::console::style("Cyrus Local Setup").bold().cyan());
    println!(
        "{}",
        dialoguer::console::style(format!("Values are stored in {}", env_path.display())).dim()
    );
    let config = prompt_env_config(&theme, &ctx.ui, &current)?;
    store.write_template()?;
    store.write(&config)?;

    ctx.ui.success(&format!("Wrote {}", env_path.display()));
    if !config.has_claude_credentials() {
        ctx.ui
            .warn("no Claude credentials set; the agent cannot run until one is configured");
    }
    ctx.ui.hint("Next: `cyrus-local start`, then `cyrus-local auth` to connect Linear.");
    Ok(())
}

fn prompt_env_config(
    theme: &ColorfulTheme,
    ui: &Ui,
    current: &EnvConfig,
) -> Result<EnvConfig, CyrusError> {
    let mut config = current.clone();

    config.linear_client_id = prompt_text(
        theme,
        "Linear OAuth client ID",
        current.linear_client_id.as_deref(),
        false,
    )?;
    config.linear_client_secret = prompt_secret(
        theme,
        ui,
        "Linear OAuth client secret",
        current.linear_client_secret.as_deref(),
        true,
    )?;
    config.linear_webhook_secret = prompt_secret(
        theme,
        ui,
        "Linear webhook signing secret",
        current.linear_webhook_secret.as_deref(),
        true,
    )?;

    let choices = ["Anthropic API key", "Claude Code OAuth token"];
    let default_choice = usize::from(
        current.anthropic_api_key.is_none() && current.claude_code_oauth_token.is_some(),
    );
    let choice = Select::with_theme(theme)
        .with_prompt("How should Claude authenticate?")
        .items(&choices)
        .default(default_choice)
        .interact()?;
    if choice == 0 {
        config.anthropic_api_key = prompt_secret(
            theme,
            ui,
            "ANTHROPIC_API_KEY",
            current.anthropic_api_key.as_deref(),
            true,
        )?;
    } else {
        config.claude_code_oauth_token = prompt_secret(
            theme,
            ui,
            "CLAUDE_CODE_OAUTH_TOKEN (from `claude setup-token`)",
            current.claude_code_oauth_token.as_deref(),
            true,
        )?;
    }

    config.ngrok_authtoken = prompt_secret(
        theme,
        ui,
        "ngrok authtoken",
        current.ngrok_authtoken.as_deref(),
        false,
    )?;

    let port = Input::<String>::with_theme(theme)
        .with_prompt("Local agent port")
        .default(current.server_port().to_string())
        .validate_with(|input: &String| -> Result<(), String> {
            match input.trim().parse::<u16>() {
                Ok(port) if port != 0 => Ok(()),
                _ => Err("enter a port between 1 and 65535".to_string()),
            }
        })
        .interact_text()?;
    config.server_port = if port.trim() == DEFAULT_SERVER_PORT.to_string() {
        current.server_port.clone()
    } else {
        Some(port.trim().to_string())
    };

    config.gh_token = prompt_secret(
        theme,
        ui,
        "GitHub token (optional)",
        current.gh_token.as_deref(),
        false,
    )?;
    config.git_user_name =
        prompt_text(theme, "Git author name (optional)", current.git_user_name.as_deref(), true)?;
    config.git_user_email = prompt_text(
        theme,
        "Git author email (optional)",
        current.git_user_email.as_deref(),
        true,
    )?;
    Ok(config)
}

fn prompt_text(
    theme: &ColorfulTheme,
    prompt: &str,
    current: Option<&str>,
    optional: bool,
) -> Result<Option<String>, CyrusError> {
    let mut input = Input::<String>::with_theme(theme)
        .with_prompt(prompt)
        .allow_empty(optional);
    if let Some(value) = current {
        input = input.default(value.to_string());
    }
    let value = input.interact_text()?;
    let value = value.trim();
    Ok(if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    })
}

/// Empty input keeps the current value. Required secrets re-prompt until set.
fn prompt_secret(
    theme: &ColorfulTheme,
    ui: &Ui,
    prompt: &str,
    current: Option<&str>,
    required: bool,
) -> Result<Option<String>, CyrusError> {
    let label = if current.is_some() {
        format!("{prompt} (Enter keeps current)")
    } else {
        prompt.to_string()
    };
    loop {
        let value = Password::with_theme(theme)
            .with_prompt(label.as_str())
            .allow_empty_password(true)
            .interact()?;
        let value = value.trim();
        if !value.is_empty() {
            return Ok(Some(value.to_string()));
        }
        if let Some(existing) = current {
            return Ok(Some(existing.to_string()));
        }
        if !required {
            return Ok(None);
        }
        ui.warn(&format!("{prompt} is required"));
    }
}

/// JSON envelope in `--json` mode, otherwise the human renderer.
fn output<F>(ctx: &Context, payload: serde_json::Value, render: F) -> Result<(), CyrusError>
where
    F: FnOnce(&Ui),
{
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        render(&ctx.ui);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), CyrusError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
