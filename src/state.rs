use crate::error::CyrusError;
use crate::settings::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const STATE_VERSION: u32 = 1;

/// `is_running` holds exactly when all four run fields are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub version: u32,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ngrok_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_dir: Option<PathBuf>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            is_running: false,
            ngrok_pid: None,
            tunnel_url: None,
            started_at: None,
            docker_dir: None,
        }
    }
}

impl RunState {
    fn is_consistent(&self) -> bool {
        let fields = [
            self.ngrok_pid.is_some(),
            self.tunnel_url.is_some(),
            self.started_at.is_some(),
            self.docker_dir.is_some(),
        ];
        if self.is_running {
            fields.iter().all(|present| *present)
        } else {
            fields.iter().all(|present| !*present)
        }
    }
}

/// The persisted run state, read once and rewritten wholesale on every change.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: RunState,
}

impl StateStore {
    /// Missing, unparseable or inconsistent files all fall back to the default state.
    pub fn load(path: PathBuf) -> Self {
        let state = read_state(&path).unwrap_or_default();
        Self { path, state }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running
    }

    pub fn set_running(
        &mut self,
        ngrok_pid: u32,
        tunnel_url: &str,
        docker_dir: &Path,
    ) -> Result<(), CyrusError> {
        let next = RunState {
            version: STATE_VERSION,
            is_running: true,
            ngrok_pid: Some(ngrok_pid),
            tunnel_url: Some(tunnel_url.to_string()),
            started_at: Some(Utc::now()),
            docker_dir: Some(docker_dir.to_path_buf()),
        };
        self.persist(next)
    }

    pub fn set_stopped(&mut self) -> Result<(), CyrusError> {
        self.persist(RunState::default())
    }

    fn persist(&mut self, next: RunState) -> Result<(), CyrusError> {
        let body = serde_json::to_string_pretty(&next)?;
        write_atomic(&self.path, &format!("{body}\n"))?;
        debug!(path = %self.path.display(), running = next.is_running, "state persisted");
        self.state = next;
        Ok(())
    }
}

fn read_state(path: &Path) -> Option<RunState> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<RunState>(&content) {
        Ok(state) if state.is_consistent() => Some(state),
        Ok(_) => {
            debug!(path = %path.display(), "inconsistent state file, using defaults");
            None
        }
        Err(err) => {
            debug!(path = %path.display(), error = %err, "corrupt state file, using defaults");
            None
        }
    }
}
