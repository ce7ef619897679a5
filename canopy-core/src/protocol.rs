//! Supervisor protocol types for control socket communication
//!
//! These types are shared between the CLI and canopy-server for
//! communication via the Unix control socket.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Commands that can be sent to the supervisor daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Query protocol version and supported capabilities.
    Hello { protocol_version: u32 },

    /// Start a dev server in a working directory
    Start {
        path: String,

        /// Launch command; defaults to the package-manager dev script.
        /// (Named `run` on the wire: `command` is taken by the enum tag.)
        #[serde(default)]
        run: Option<String>,

        #[serde(default)]
        args: Vec<String>,

        /// Extra substring that counts as a readiness signal for this server.
        #[serde(default)]
        ready_sentinel: Option<String>,
    },

    /// Stop the dev server addressed by id (best-effort; unknown ids are a no-op)
    Stop { id: String },

    /// Get a single server record
    Get { id: String },

    /// List all server records
    List,

    /// Fetch captured log lines; `follow` switches the connection into a
    /// one-way stream of further lines until the client disconnects.
    Logs {
        id: String,

        #[serde(default)]
        tail: Option<usize>,

        #[serde(default)]
        follow: bool,
    },

    /// Register proxy routes forwarding to the server's allocated host
    ProxyEnable { id: String },

    /// Remove the server's proxy routes
    ProxyDisable { id: String },

    /// Daemon health summary
    Health,

    /// Shut the daemon down (managed servers keep running detached)
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub protocol_version: u32,
    pub server_version: String,
    pub capabilities: Vec<String>,
}

/// Response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Command succeeded
    Ok { data: serde_json::Value },

    /// Command failed
    Error { message: String },
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self::Ok {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Ok { data } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { message } => Some(message),
        }
    }
}

/// One managed dev server, as reported over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub path: String,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub host: Option<String>,
    pub status: ServerStatus,
    pub start_time: u64,
    pub proxy: Option<ProxyInfo>,

    /// Human-readable reason for the most recent `error` transition.
    pub last_error: Option<String>,
}

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(ServerStatus::Starting),
            "running" => Some(ServerStatus::Running),
            "stopped" => Some(ServerStatus::Stopped),
            "error" => Some(ServerStatus::Error),
            _ => None,
        }
    }

    /// Whether a record in this state holds the single-active slot for its path.
    pub fn is_active(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy sub-record attached to a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub status: ProxyStatus,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyStatus::Active => write!(f, "active"),
            ProxyStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Which stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One captured log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub source: LogSource,
    pub line: String,
}

/// `list` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub servers: Vec<ServerInfo>,
}

/// `logs` response payload (non-follow)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogLine>,
}

/// `health` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub server_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_round_trips() {
        let cmd = Command::Start {
            path: "/repo/wt-a".to_string(),
            run: Some("npm".to_string()),
            args: vec!["run".to_string(), "dev".to_string()],
            ready_sentinel: None,
        };
        let encoded = serde_json::to_string(&cmd).unwrap();
        assert!(encoded.contains(r#""command":"start""#), "{encoded}");
        assert!(encoded.contains(r#""run":"npm""#), "{encoded}");
        let parsed: Command = serde_json::from_str(&encoded).unwrap();
        match parsed {
            Command::Start {
                path,
                run,
                args,
                ready_sentinel,
            } => {
                assert_eq!(path, "/repo/wt-a");
                assert_eq!(run.as_deref(), Some("npm"));
                assert_eq!(args, vec!["run".to_string(), "dev".to_string()]);
                assert!(ready_sentinel.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn start_command_defaults_optional_fields() {
        let json = r#"{"command": "start", "path": "/repo/wt-a"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::Start {
                run,
                args,
                ready_sentinel,
                ..
            } => {
                assert!(run.is_none());
                assert!(args.is_empty());
                assert!(ready_sentinel.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn logs_command_defaults_tail_and_follow() {
        let json = r#"{"command": "logs", "id": "abc"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::Logs { id, tail, follow } => {
                assert_eq!(id, "abc");
                assert!(tail.is_none());
                assert!(!follow);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn response_ok_and_error_helpers() {
        let ok = Response::ok(serde_json::json!({"id": "abc"}));
        assert!(ok.is_ok());
        assert!(ok.data().is_some());
        assert!(ok.error_message().is_none());

        let err = Response::error("pool exhausted");
        assert!(!err.is_ok());
        assert_eq!(err.error_message(), Some("pool exhausted"));
    }

    #[test]
    fn server_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Starting).unwrap(),
            r#""starting""#
        );
        assert_eq!(ServerStatus::parse("error"), Some(ServerStatus::Error));
        assert_eq!(ServerStatus::parse("bogus"), None);
    }

    #[test]
    fn active_states_cover_starting_and_running() {
        assert!(ServerStatus::Starting.is_active());
        assert!(ServerStatus::Running.is_active());
        assert!(!ServerStatus::Stopped.is_active());
        assert!(!ServerStatus::Error.is_active());
    }

    #[test]
    fn log_line_round_trips() {
        let line = LogLine {
            source: LogSource::Stderr,
            line: "error: cannot find module 'left-pad'".to_string(),
        };
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains(r#""source":"stderr""#));
        let parsed: LogLine = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.source, LogSource::Stderr);
        assert_eq!(parsed.line, line.line);
    }
}
