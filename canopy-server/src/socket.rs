//! Control socket for the supervisor daemon.
//!
//! The CLI/UI drives the daemon over a Unix socket speaking newline-
//! delimited JSON. Most commands are request/response; `logs` with
//! `follow` switches the connection into a one-way stream of further log
//! lines until the client disconnects.

use crate::proxy::ProxyError;
use crate::supervisor::{LaunchSpec, ManagedServer, Supervisor};
use canopy_core::{
    Command, HealthResponse, HelloResponse, ListResponse, LogLine, LogsResponse, PROTOCOL_VERSION,
    Response, ServerInfo, ServerStatus, server_path,
};
use canopy_socket::{read_message, write_message};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};

const DEFAULT_LOG_TAIL: usize = 100;

/// Everything the control surface needs, injected once at startup.
pub struct Daemon {
    supervisor: Supervisor,
    shutdown_tx: watch::Sender<bool>,
}

/// Dispatch result: either one response, or a response followed by a
/// log stream on the same connection.
pub enum Reply {
    Single(Response),
    LogFollow {
        backlog: Vec<LogLine>,
        rx: broadcast::Receiver<LogLine>,
    },
}

impl Daemon {
    pub fn new(supervisor: Supervisor, shutdown_tx: watch::Sender<bool>) -> Self {
        Self {
            supervisor,
            shutdown_tx,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn dispatch(&self, command: Command) -> Reply {
        match command {
            Command::Hello { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Reply::Single(Response::error(format!(
                        "unsupported protocol version {protocol_version} (daemon speaks {PROTOCOL_VERSION})"
                    )));
                }
                Reply::Single(Response::ok(HelloResponse {
                    protocol_version: PROTOCOL_VERSION,
                    server_version: env!("CARGO_PKG_VERSION").to_string(),
                    capabilities: vec![
                        "servers".to_string(),
                        "logs".to_string(),
                        "proxy".to_string(),
                    ],
                }))
            }

            Command::Start {
                path,
                run,
                args,
                ready_sentinel,
            } => {
                let path = PathBuf::from(path);
                let spec = LaunchSpec::resolve(run, args, ready_sentinel);
                match self.supervisor.start(&path, spec).await {
                    Ok(info) => Reply::Single(Response::ok(info)),
                    Err(e) => Reply::Single(Response::error(e.to_string())),
                }
            }

            Command::Stop { id } => {
                let Some(path) = server_path(&id) else {
                    return Reply::Single(bad_id(&id));
                };
                self.supervisor.stop(&path).await;
                Reply::Single(Response::ok(serde_json::json!({ "stopped": id })))
            }

            Command::Get { id } => {
                let Some(path) = server_path(&id) else {
                    return Reply::Single(bad_id(&id));
                };
                match self.supervisor.get(&path) {
                    Some(managed) => Reply::Single(Response::ok(self.info_for(&managed).await)),
                    None => Reply::Single(not_found(&id)),
                }
            }

            Command::List => {
                let mut servers = Vec::new();
                for managed in self.supervisor.list() {
                    servers.push(self.info_for(&managed).await);
                }
                Reply::Single(Response::ok(ListResponse { servers }))
            }

            Command::Logs { id, tail, follow } => {
                let Some(path) = server_path(&id) else {
                    return Reply::Single(bad_id(&id));
                };
                let Some(managed) = self.supervisor.get(&path) else {
                    return Reply::Single(not_found(&id));
                };
                let backlog = managed.logs.tail(tail.unwrap_or(DEFAULT_LOG_TAIL));
                if follow {
                    Reply::LogFollow {
                        backlog,
                        rx: managed.logs.subscribe(),
                    }
                } else {
                    Reply::Single(Response::ok(LogsResponse { logs: backlog }))
                }
            }

            Command::ProxyEnable { id } => {
                let Some(path) = server_path(&id) else {
                    return Reply::Single(bad_id(&id));
                };
                Reply::Single(self.enable_proxy(&path).await)
            }

            Command::ProxyDisable { id } => {
                let Some(path) = server_path(&id) else {
                    return Reply::Single(bad_id(&id));
                };
                match self.supervisor.proxy().disable(&path).await {
                    Ok(()) => Reply::Single(Response::ok(serde_json::json!({ "disabled": id }))),
                    Err(e) => Reply::Single(Response::error(e.to_string())),
                }
            }

            Command::Health => Reply::Single(Response::ok(HealthResponse {
                status: "ok".to_string(),
                server_count: self.supervisor.count(),
            })),

            Command::Shutdown => {
                let _ = self.shutdown_tx.send(true);
                Reply::Single(Response::ok(serde_json::json!({ "stopping": true })))
            }
        }
    }

    async fn enable_proxy(&self, path: &Path) -> Response {
        let Some(managed) = self.supervisor.get(path) else {
            return Response::error(
                ProxyError::PrereqNotMet {
                    path: path.display().to_string(),
                }
                .to_string(),
            );
        };
        let (status, host) = (managed.status(), managed.host);
        let Some(host) = host else {
            return Response::error(
                ProxyError::PrereqNotMet {
                    path: path.display().to_string(),
                }
                .to_string(),
            );
        };
        if status != ServerStatus::Running {
            return Response::error(
                ProxyError::PrereqNotMet {
                    path: path.display().to_string(),
                }
                .to_string(),
            );
        }

        match self.supervisor.proxy().enable(path, host).await {
            Ok(info) => Response::ok(info),
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn info_for(&self, managed: &Arc<ManagedServer>) -> ServerInfo {
        let proxy = self.supervisor.proxy().state(&managed.path).await;
        managed.info(proxy)
    }
}

fn bad_id(id: &str) -> Response {
    Response::error(format!("malformed server id: {id}"))
}

fn not_found(id: &str) -> Response {
    Response::error(format!("no server for id: {id}"))
}

/// Accept loop for the control socket.
pub struct SocketServer {
    path: PathBuf,
}

impl SocketServer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Bind the socket, refusing to clobber a live daemon. A socket file
    /// nothing answers on is stale and gets removed.
    pub async fn bind(&self) -> Result<UnixListener, std::io::Error> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            match UnixStream::connect(&self.path).await {
                Ok(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("daemon already running (socket at {})", self.path.display()),
                    ));
                }
                Err(e) => {
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionRefused
                            | std::io::ErrorKind::NotConnected
                            | std::io::ErrorKind::ConnectionReset
                    ) {
                        let _ = tokio::fs::remove_file(&self.path).await;
                    }
                }
            }
        }

        UnixListener::bind(&self.path)
    }

    pub async fn run(
        &self,
        daemon: Arc<Daemon>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        let listener = self.bind().await?;
        tracing::info!(socket = %self.path.display(), "control socket listening");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let daemon = daemon.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, daemon).await {
                            tracing::warn!(error = %e, "connection handler failed");
                        }
                    });
                }
            }
        }
    }
}

pub async fn handle_connection(
    stream: UnixStream,
    daemon: Arc<Daemon>,
) -> Result<(), std::io::Error> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let Some(command) = (match read_message::<_, Command>(&mut reader).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                write_message(
                    &mut writer,
                    &Response::error(format!("invalid command: {e}")),
                )
                .await?;
                continue;
            }
            Err(e) => return Err(e),
        }) else {
            break;
        };

        match daemon.dispatch(command).await {
            Reply::Single(response) => {
                write_message(&mut writer, &response).await?;
            }
            Reply::LogFollow { backlog, mut rx } => {
                write_message(&mut writer, &Response::ok(LogsResponse { logs: backlog })).await?;

                // One-way stream from here on; only a disconnect ends it.
                let mut probe = [0u8; 1];
                loop {
                    tokio::select! {
                        received = rx.recv() => {
                            match received {
                                Ok(line) => {
                                    if write_message(&mut writer, &Response::ok(line)).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(missed)) => {
                                    tracing::debug!(missed, "log follower lagged");
                                }
                                Err(broadcast::error::RecvError::Closed) => return Ok(()),
                            }
                        }
                        read = reader.read(&mut probe) => {
                            match read {
                                Ok(0) | Err(_) => return Ok(()),
                                // Extra client input during a follow is ignored.
                                Ok(_) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
