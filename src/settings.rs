use crate::error::CyrusError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_YAML: &str = include_str!("../config/default.yaml");
pub const SETTINGS_FILE: &str = "config.yaml";
pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const ENV_TEMPLATE_FILE: &str = ".env.example";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    pub docker: DockerSettings,
    pub tunnel: TunnelSettings,
    pub health: HealthSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSettings {
    pub dir: String,
    pub image: String,
    pub base_image: String,
    pub container_name: String,
    pub project_name: String,
    pub service: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSettings {
    pub binary: String,
    pub api_url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    pub timeout_sec: u64,
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            docker: DockerSettings::default(),
            tunnel: TunnelSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            dir: "".to_string(),
            image: "cyrus-local:latest".to_string(),
            base_image: "cyrus-local:base".to_string(),
            container_name: "cyrus".to_string(),
            project_name: "cyrus".to_string(),
            service: "cyrus".to_string(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            binary: "ngrok".to_string(),
            api_url: "http://127.0.0.1:4040/api/tunnels".to_string(),
            max_retries: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout_sec: 120,
            poll_interval_ms: 2000,
        }
    }
}

impl HealthSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TunnelSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

pub fn read_settings_from_str(content: &str) -> Result<Settings, CyrusError> {
    let settings: Settings = serde_yaml::from_str(content)?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Missing file means defaults; a present but invalid file is an error.
pub fn read_settings(path: &Path) -> Result<Settings, CyrusError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(path)?;
    read_settings_from_str(&content)
}

fn validate_settings(settings: &Settings) -> Result<(), CyrusError> {
    if settings.version != 1 {
        return Err(CyrusError::Config(format!(
            "unsupported config version {}",
            settings.version
        )));
    }
    let required = [
        ("docker.image", &settings.docker.image),
        ("docker.base_image", &settings.docker.base_image),
        ("docker.container_name", &settings.docker.container_name),
        ("docker.service", &settings.docker.service),
        ("tunnel.binary", &settings.tunnel.binary),
        ("tunnel.api_url", &settings.tunnel.api_url),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(CyrusError::Config(format!("{field} must not be empty")));
        }
    }
    if settings.docker.image == settings.docker.base_image {
        return Err(CyrusError::Config(
            "docker.base_image must differ from docker.image".to_string(),
        ));
    }
    if settings.tunnel.max_retries == 0 {
        return Err(CyrusError::Config(
            "tunnel.max_retries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Every location the CLI touches, resolved once and handed to each component.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub settings_file: PathBuf,
    pub env_file: PathBuf,
    pub state_file: PathBuf,
    pub tools_file: PathBuf,
    pub build_dir: PathBuf,
    pub docker_dir: PathBuf,
}

impl Paths {
    pub fn in_config_dir(config_dir: PathBuf, docker_dir: PathBuf) -> Self {
        Self {
            settings_file: config_dir.join(SETTINGS_FILE),
            env_file: config_dir.join(".env"),
            state_file: config_dir.join("state.json"),
            tools_file: config_dir.join("tools.yaml"),
            build_dir: config_dir.join("build"),
            config_dir,
            docker_dir,
        }
    }

    pub fn generated_dockerfile(&self) -> PathBuf {
        self.build_dir.join("Dockerfile.tools")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.docker_dir.join(COMPOSE_FILE)
    }

    pub fn env_template(&self) -> PathBuf {
        self.docker_dir.join(ENV_TEMPLATE_FILE)
    }
}

pub fn resolve_config_dir(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CYRUS_LOCAL_CONFIG_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("cyrus-local");
    base
}

pub fn resolve_env_file(override_path: Option<&PathBuf>, config_dir: &Path) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CYRUS_LOCAL_ENV_FILE") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    config_dir.join(".env")
}

pub fn resolve_docker_dir(override_path: Option<&PathBuf>, settings: &Settings) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CYRUS_LOCAL_DOCKER_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if !settings.docker.dir.trim().is_empty() {
        return PathBuf::from(expand_path(settings.docker.dir.trim()));
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate in [dir.join("docker"), dir.to_path_buf()] {
                if candidate.join(COMPOSE_FILE).exists() {
                    return candidate;
                }
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let candidate = cwd.join("docker");
        if candidate.join(COMPOSE_FILE).exists() {
            return candidate;
        }
        return cwd;
    }
    PathBuf::from(".")
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn ensure_parent(path: &Path) -> Result<(), CyrusError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Writes through a sibling temp file so readers never see a partial document.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), CyrusError> {
    ensure_parent(path)?;
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
