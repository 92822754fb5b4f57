use crate::error::CyrusError;
use serde::{Deserialize, Serialize};
use std::io;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::debug;

const API_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of the tunnel agent's `/api/tunnels` document.
pub trait TunnelApi {
    fn fetch_tunnels(&self) -> Result<String, CyrusError>;
}

pub struct HttpTunnelApi {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpTunnelApi {
    pub fn new(url: &str) -> Result<Self, CyrusError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(API_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

impl TunnelApi for HttpTunnelApi {
    fn fetch_tunnels(&self) -> Result<String, CyrusError> {
        let response = self.client.get(&self.url).send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(CyrusError::Process(format!(
                "tunnel API returned HTTP {status}"
            )));
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TunnelList {
    tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TunnelInfo {
    public_url: String,
    proto: String,
}

fn select_public_url(body: &str) -> Result<Option<String>, CyrusError> {
    let list: TunnelList = serde_json::from_str(body)?;
    let tunnels: Vec<&TunnelInfo> = list
        .tunnels
        .iter()
        .filter(|tunnel| !tunnel.public_url.is_empty())
        .collect();
    let preferred = tunnels
        .iter()
        .find(|tunnel| tunnel.proto == "https")
        .or_else(|| tunnels.first());
    Ok(preferred.map(|tunnel| tunnel.public_url.clone()))
}

/// A launched tunnel process. Only `pid` is persisted.
#[derive(Debug)]
pub struct TunnelHandle {
    pub pid: u32,
    child: Option<Child>,
}

impl TunnelHandle {
    /// Reaps the child if it already exited, so a failed launch is noticed early.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub running: bool,
    pub url: Option<String>,
}

pub struct TunnelController<A: TunnelApi> {
    api: A,
    binary: String,
    authtoken: Option<String>,
}

impl<A: TunnelApi> TunnelController<A> {
    pub fn new(api: A, binary: &str) -> Self {
        Self {
            api,
            binary: binary.to_string(),
            authtoken: None,
        }
    }

    pub fn with_authtoken(mut self, authtoken: Option<String>) -> Self {
        self.authtoken = authtoken.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn binary_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    pub fn start(&self, port: u16) -> Result<TunnelHandle, CyrusError> {
        let binary = which::which(&self.binary).map_err(|_| {
            CyrusError::Unavailable(format!(
                "  - {} not found on PATH. Install it from https://ngrok.com/download and run `ngrok config add-authtoken <token>`.",
                self.binary
            ))
        })?;
        let mut cmd = Command::new(&binary);
        cmd.arg("http")
            .arg(port.to_string())
            .arg("--log")
            .arg("stdout")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(token) = &self.authtoken {
            cmd.env("NGROK_AUTHTOKEN", token);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|err| {
            CyrusError::Process(format!("failed to launch {}: {err}", binary.display()))
        })?;
        let pid = child.id();
        if pid == 0 {
            return Err(CyrusError::Process(
                "tunnel process started without a process id".to_string(),
            ));
        }
        debug!(pid, port, "tunnel process launched");
        Ok(TunnelHandle {
            pid,
            child: Some(child),
        })
    }

    /// Never fails: network and parse errors read as "no tunnel".
    pub fn get_url(&self) -> Option<String> {
        let body = match self.api.fetch_tunnels() {
            Ok(body) => body,
            Err(err) => {
                debug!(error = %err, "tunnel API query failed");
                return None;
            }
        };
        match select_public_url(&body) {
            Ok(url) => url,
            Err(err) => {
                debug!(error = %err, "tunnel API returned unparseable body");
                None
            }
        }
    }

    pub fn wait_for_url(&self, max_retries: u32, retry_delay: Duration) -> Result<String, CyrusError> {
        for attempt in 1..=max_retries {
            if let Some(url) = self.get_url() {
                debug!(attempt, url = %url, "tunnel URL acquired");
                return Ok(url);
            }
            debug!(attempt, max_retries, "tunnel URL not ready");
            if attempt < max_retries {
                thread::sleep(retry_delay);
            }
        }
        Err(CyrusError::Timeout(format!(
            "tunnel URL not available after {max_retries} attempts"
        )))
    }

    pub fn is_running(&self) -> bool {
        self.get_url().is_some()
    }

    pub fn status(&self) -> TunnelStatus {
        let url = self.get_url();
        TunnelStatus {
            running: url.is_some(),
            url,
        }
    }
}

/// Sends SIGTERM. A process that is already gone counts as stopped.
#[cfg(unix)]
pub fn stop(pid: u32) -> Result<(), CyrusError> {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return Err(CyrusError::Process(format!("invalid process id {pid}")));
    };
    if raw_pid <= 0 {
        return Err(CyrusError::Process(format!("invalid process id {pid}")));
    }
    let rc = unsafe { libc::kill(raw_pid, libc::SIGTERM) };
    if rc == 0 {
        debug!(pid, "sent SIGTERM to tunnel process");
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "tunnel process already gone");
        return Ok(());
    }
    Err(CyrusError::Io(err))
}

#[cfg(not(unix))]
pub fn stop(pid: u32) -> Result<(), CyrusError> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() || !is_process_running(pid) {
        return Ok(());
    }
    Err(CyrusError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("failed to stop process {pid}"),
    )))
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(raw_pid) if raw_pid > 0 => unsafe { libc::kill(raw_pid, 0) == 0 },
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
