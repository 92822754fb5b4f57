use crate::error::CyrusError;
use crate::settings::write_atomic;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const BASE_URL_KEY: &str = "CYRUS_BASE_URL";
pub const SERVER_PORT_KEY: &str = "CYRUS_SERVER_PORT";
pub const DEFAULT_SERVER_PORT: u16 = 3456;

/// Known keys of the agent environment file. Empty values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub base_url: Option<String>,
    pub server_port: Option<String>,
    pub linear_direct_webhooks: Option<String>,
    pub linear_client_id: Option<String>,
    pub linear_client_secret: Option<String>,
    pub linear_webhook_secret: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub claude_code_oauth_token: Option<String>,
    pub ngrok_authtoken: Option<String>,
    pub gh_token: Option<String>,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
}

impl EnvConfig {
    fn fields(&self) -> [(&'static str, &Option<String>); 12] {
        [
            (BASE_URL_KEY, &self.base_url),
            (SERVER_PORT_KEY, &self.server_port),
            ("LINEAR_DIRECT_WEBHOOKS", &self.linear_direct_webhooks),
            ("LINEAR_CLIENT_ID", &self.linear_client_id),
            ("LINEAR_CLIENT_SECRET", &self.linear_client_secret),
            ("LINEAR_WEBHOOK_SECRET", &self.linear_webhook_secret),
            ("ANTHROPIC_API_KEY", &self.anthropic_api_key),
            ("CLAUDE_CODE_OAUTH_TOKEN", &self.claude_code_oauth_token),
            ("NGROK_AUTHTOKEN", &self.ngrok_authtoken),
            ("GH_TOKEN", &self.gh_token),
            ("GIT_USER_NAME", &self.git_user_name),
            ("GIT_USER_EMAIL", &self.git_user_email),
        ]
    }

    fn field_mut(&mut self, key: &str) -> Option<&mut Option<String>> {
        let slot = match key {
            BASE_URL_KEY => &mut self.base_url,
            SERVER_PORT_KEY => &mut self.server_port,
            "LINEAR_DIRECT_WEBHOOKS" => &mut self.linear_direct_webhooks,
            "LINEAR_CLIENT_ID" => &mut self.linear_client_id,
            "LINEAR_CLIENT_SECRET" => &mut self.linear_client_secret,
            "LINEAR_WEBHOOK_SECRET" => &mut self.linear_webhook_secret,
            "ANTHROPIC_API_KEY" => &mut self.anthropic_api_key,
            "CLAUDE_CODE_OAUTH_TOKEN" => &mut self.claude_code_oauth_token,
            "NGROK_AUTHTOKEN" => &mut self.ngrok_authtoken,
            "GH_TOKEN" => &mut self.gh_token,
            "GIT_USER_NAME" => &mut self.git_user_name,
            "GIT_USER_EMAIL" => &mut self.git_user_email,
            _ => return None,
        };
        Some(slot)
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut config = Self::default();
        for (key, value) in map {
            if value.is_empty() {
                continue;
            }
            if let Some(slot) = config.field_mut(key) {
                *slot = Some(value.clone());
            }
        }
        config
    }

    /// Non-empty entries in a stable key order.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        self.fields()
            .into_iter()
            .filter_map(|(key, value)| match value.as_deref() {
                Some(v) if !v.is_empty() => Some((key, v)),
                _ => None,
            })
            .collect()
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
            .as_deref()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    pub fn has_claude_credentials(&self) -> bool {
        self.anthropic_api_key.is_some() || self.claude_code_oauth_token.is_some()
    }
}

pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        values
            .entry(key.to_string())
            .or_insert_with(|| unquote(value.trim()).to_string());
    }
    values
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Replaces the first line assigning `key` in place, or appends a new line.
pub fn upsert_line(content: &str, key: &str, value: &str) -> String {
    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        let assigns_key = line
            .split_once('=')
            .is_some_and(|(name, _)| name.trim() == key);
        if !replaced && assigns_key {
            lines.push(format!("{key}={value}"));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("{key}={value}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Clone)]
pub struct EnvFileStore {
    path: PathBuf,
    template: Option<PathBuf>,
}

impl EnvFileStore {
    pub fn new(path: PathBuf, template: Option<PathBuf>) -> Self {
        Self { path, template }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read(&self) -> Result<EnvConfig, CyrusError> {
        if !self.exists() {
            return Ok(EnvConfig::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(EnvConfig::from_map(&parse_env(&content)))
    }

    pub fn template_text(&self) -> Result<String, CyrusError> {
        match &self.template {
            Some(template) if template.is_file() => Ok(fs::read_to_string(template)?),
            _ => Ok(String::new()),
        }
    }

    fn base_text(&self) -> Result<String, CyrusError> {
        if self.exists() {
            return Ok(fs::read_to_string(&self.path)?);
        }
        self.template_text()
    }

    pub fn write(&self, config: &EnvConfig) -> Result<(), CyrusError> {
        let mut content = self.base_text()?;
        for (key, value) in config.entries() {
            content = upsert_line(&content, key, value);
        }
        write_atomic(&self.path, &content)?;
        debug!(path = %self.path.display(), "env file written");
        Ok(())
    }

    /// Seeds the file from the template verbatim.
    pub fn write_template(&self) -> Result<(), CyrusError> {
        let content = self.template_text()?;
        write_atomic(&self.path, &content)?;
        Ok(())
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), CyrusError> {
        let content = self.base_text()?;
        let updated = upsert_line(&content, key, value);
        write_atomic(&self.path, &updated)?;
        debug!(path = %self.path.display(), key, "env key updated");
        Ok(())
    }
}
