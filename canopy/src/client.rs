//! Daemon client: connect to the control socket, spawning the daemon
//! detached if nothing is listening yet.

use canopy_core::{Command, PROTOCOL_VERSION, Response};
use canopy_socket::LineClient;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DAEMON_STARTUP_WAIT_ATTEMPTS: usize = 100;
const DAEMON_STARTUP_WAIT_INTERVAL_MS: u64 = 50;

pub fn canopy_home() -> Result<PathBuf, Box<dyn std::error::Error>> {
    dirs::home_dir()
        .map(|home| home.join(".canopy"))
        .ok_or_else(|| "could not resolve home directory".into())
}

pub fn default_socket_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Ok(canopy_home()?.join("canopyd.sock"))
}

fn daemon_log_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Ok(canopy_home()?.join("daemon.log"))
}

fn open_daemon_log(log_path: &Path) -> Result<std::fs::File, std::io::Error> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)
}

fn read_daemon_log_tail(log_path: &Path, max_lines: usize) -> String {
    let Ok(contents) = std::fs::read_to_string(log_path) else {
        return String::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let keep = lines.len().saturating_sub(max_lines);
    lines[keep..].join("\n").trim().to_string()
}

fn connect_error(log_path: &Path, status: Option<std::process::ExitStatus>) -> String {
    let tail = read_daemon_log_tail(log_path, 40);
    let status_hint = status
        .map(|s| format!(" (daemon exited: {s})"))
        .unwrap_or_default();
    if tail.is_empty() {
        format!("could not connect to canopy-server{status_hint}")
    } else {
        format!("could not connect to canopy-server{status_hint}\nlast daemon log lines:\n{tail}")
    }
}

pub struct DaemonClient {
    inner: LineClient,
}

impl DaemonClient {
    /// Connect to a running daemon; spawn one detached first if needed.
    pub async fn ensure(socket: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if let Ok(client) = Self::connect(socket).await {
            return Ok(client);
        }

        let log_path = daemon_log_path().unwrap_or_else(|_| PathBuf::from("canopy-daemon.log"));
        let mut child = spawn_daemon(socket, &log_path)?;

        for _ in 0..DAEMON_STARTUP_WAIT_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(DAEMON_STARTUP_WAIT_INTERVAL_MS)).await;
            if let Ok(client) = Self::connect(socket).await {
                return Ok(client);
            }
            if let Some(status) = child.try_wait()? {
                return Err(connect_error(&log_path, Some(status)).into());
            }
        }

        let status = child.try_wait().ok().flatten();
        Err(connect_error(&log_path, status).into())
    }

    /// Connect without spawning; handshake so a stale socket fails fast.
    pub async fn connect(socket: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let mut client = Self {
            inner: LineClient::connect(socket).await?,
        };
        let resp = client
            .request(&Command::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        if let Some(message) = resp.error_message() {
            return Err(format!("daemon handshake failed: {message}").into());
        }
        Ok(client)
    }

    pub async fn request(
        &mut self,
        command: &Command,
    ) -> Result<Response, Box<dyn std::error::Error>> {
        Ok(self.inner.request(command).await?)
    }

    /// Send one command and keep reading responses until the stream ends.
    /// Used for `logs --follow`.
    pub async fn stream(
        &mut self,
        command: &Command,
        mut on_response: impl FnMut(Response),
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.inner.send(command).await?;
        while let Some(resp) = self.inner.recv::<Response>().await? {
            on_response(resp);
        }
        Ok(())
    }
}

fn spawn_daemon(
    socket: &Path,
    log_path: &Path,
) -> Result<std::process::Child, Box<dyn std::error::Error>> {
    use std::process::Stdio;

    let socket_arg = socket.to_string_lossy().to_string();

    // Prefer the canopy-server that ships next to this binary.
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("canopy-server");
        if sibling.exists() {
            let log_file = open_daemon_log(log_path)?;
            let log_file_err = log_file.try_clone()?;
            let child = std::process::Command::new(sibling)
                .args(["--socket", &socket_arg])
                .stdin(Stdio::null())
                .stdout(Stdio::from(log_file))
                .stderr(Stdio::from(log_file_err))
                .spawn()?;
            return Ok(child);
        }
    }

    // Fall back to PATH.
    let log_file = open_daemon_log(log_path)?;
    let log_file_err = log_file.try_clone()?;
    match std::process::Command::new("canopy-server")
        .args(["--socket", &socket_arg])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()
    {
        Ok(child) => Ok(child),
        Err(e) => Err(format!(
            "failed to spawn 'canopy-server' ({e}). If you're running from a source checkout, \
             build it with: cargo build -p canopy-server"
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_keeps_only_the_last_lines() {
        let temp = tempfile::TempDir::new().unwrap();
        let log = temp.path().join("daemon.log");
        let contents = (0..10).map(|i| format!("line {i}\n")).collect::<String>();
        std::fs::write(&log, contents).unwrap();

        let tail = read_daemon_log_tail(&log, 3);
        assert_eq!(tail, "line 7\nline 8\nline 9");
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        assert_eq!(read_daemon_log_tail(Path::new("/no/such/log"), 10), "");
    }

    #[test]
    fn connect_error_includes_log_tail_and_exit_hint() {
        let temp = tempfile::TempDir::new().unwrap();
        let log = temp.path().join("daemon.log");
        std::fs::write(&log, "bind failed: address in use\n").unwrap();

        let message = connect_error(&log, None);
        assert!(message.contains("could not connect"));
        assert!(message.contains("address in use"));
    }

    #[test]
    fn open_daemon_log_creates_parent_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let log = temp.path().join("nested").join("daemon.log");
        open_daemon_log(&log).unwrap();
        assert!(log.exists());
    }
}
