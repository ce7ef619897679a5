//! Durable supervisor state.
//!
//! One sqlite database holds the server registry, the loopback host
//! allocation table, and proxy state. Everything here is written
//! synchronously so a restarted daemon can reconcile orphans from what is
//! on disk alone.

use canopy_core::ServerStatus;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS servers (
    path TEXT PRIMARY KEY,
    pid INTEGER NOT NULL,
    command TEXT NOT NULL,
    args_json TEXT NOT NULL,
    host TEXT,
    status TEXT NOT NULL,
    start_time_unix INTEGER NOT NULL,
    stdout_log TEXT NOT NULL,
    stderr_log TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS host_allocations (
    host TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS proxy_state (
    path TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    ports_json TEXT NOT NULL,
    route_ids_json TEXT NOT NULL,
    active INTEGER NOT NULL,
    created_at_unix INTEGER NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct PersistedServer {
    pub path: PathBuf,
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub host: Option<Ipv4Addr>,
    pub status: ServerStatus,
    pub start_time: u64,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PersistedProxy {
    pub path: PathBuf,
    pub host: Ipv4Addr,
    pub ports: Vec<u16>,
    pub route_ids: Vec<String>,
    pub active: bool,
    pub created_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unsupported schema version: {found}")]
    UnsupportedSchemaVersion { found: i32 },

    #[error("state store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct SqliteStateStore {
    path: PathBuf,
}

impl SqliteStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init(&self) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = self.open_connection()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StateStoreError::UnsupportedSchemaVersion { found: version });
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA)?;
        tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
        tx.commit()?;

        Ok(())
    }

    pub fn upsert_server(&self, server: &PersistedServer) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        let args_json = serde_json::to_string(&server.args)
            .map_err(|e| StateStoreError::InvalidData(format!("serialize args: {e}")))?;
        conn.execute(
            "INSERT INTO servers (
                path, pid, command, args_json, host, status,
                start_time_unix, stdout_log, stderr_log
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(path) DO UPDATE SET
                pid = excluded.pid,
                command = excluded.command,
                args_json = excluded.args_json,
                host = excluded.host,
                status = excluded.status,
                start_time_unix = excluded.start_time_unix,
                stdout_log = excluded.stdout_log,
                stderr_log = excluded.stderr_log;",
            params![
                path_text(&server.path),
                i64::from(server.pid),
                server.command,
                args_json,
                server.host.map(|h| h.to_string()),
                server.status.as_str(),
                server.start_time as i64,
                path_text(&server.stdout_log),
                path_text(&server.stderr_log),
            ],
        )?;
        Ok(())
    }

    pub fn set_server_status(
        &self,
        path: &Path,
        status: ServerStatus,
    ) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        conn.execute(
            "UPDATE servers SET status = ?1 WHERE path = ?2;",
            params![status.as_str(), path_text(path)],
        )?;
        Ok(())
    }

    pub fn remove_server(&self, path: &Path) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        conn.execute(
            "DELETE FROM servers WHERE path = ?1;",
            params![path_text(path)],
        )?;
        Ok(())
    }

    pub fn load_servers(&self) -> Result<Vec<PersistedServer>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT path, pid, command, args_json, host, status,
                    start_time_unix, stdout_log, stderr_log
             FROM servers ORDER BY path;",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut servers = Vec::new();
        for row in rows {
            let (path, pid, command, args_json, host, status, start_time, stdout_log, stderr_log) =
                row?;
            servers.push(PersistedServer {
                path: PathBuf::from(path),
                pid: to_u32(pid, "pid")?,
                command,
                args: serde_json::from_str(&args_json)
                    .map_err(|e| StateStoreError::InvalidData(format!("deserialize args: {e}")))?,
                host: host.map(|h| parse_host(&h)).transpose()?,
                status: ServerStatus::parse(&status).ok_or_else(|| {
                    StateStoreError::InvalidData(format!("unknown server status: {status}"))
                })?,
                start_time: to_u64(start_time, "start_time_unix")?,
                stdout_log: PathBuf::from(stdout_log),
                stderr_log: PathBuf::from(stderr_log),
            });
        }
        Ok(servers)
    }

    /// Replace whatever allocation `path` holds with `host`.
    pub fn set_allocation(&self, host: Ipv4Addr, path: &Path) -> Result<(), StateStoreError> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM host_allocations WHERE path = ?1;",
            params![path_text(path)],
        )?;
        tx.execute(
            "INSERT INTO host_allocations (host, path) VALUES (?1, ?2);",
            params![host.to_string(), path_text(path)],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_allocation(&self, path: &Path) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        conn.execute(
            "DELETE FROM host_allocations WHERE path = ?1;",
            params![path_text(path)],
        )?;
        Ok(())
    }

    pub fn load_allocations(&self) -> Result<Vec<(Ipv4Addr, PathBuf)>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt =
            conn.prepare("SELECT host, path FROM host_allocations ORDER BY host;")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut allocations = Vec::new();
        for row in rows {
            let (host, path) = row?;
            allocations.push((parse_host(&host)?, PathBuf::from(path)));
        }
        Ok(allocations)
    }

    pub fn upsert_proxy(&self, proxy: &PersistedProxy) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        let ports_json = serde_json::to_string(&proxy.ports)
            .map_err(|e| StateStoreError::InvalidData(format!("serialize ports: {e}")))?;
        let route_ids_json = serde_json::to_string(&proxy.route_ids)
            .map_err(|e| StateStoreError::InvalidData(format!("serialize route ids: {e}")))?;
        conn.execute(
            "INSERT INTO proxy_state (
                path, host, ports_json, route_ids_json, active, created_at_unix
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                host = excluded.host,
                ports_json = excluded.ports_json,
                route_ids_json = excluded.route_ids_json,
                active = excluded.active,
                created_at_unix = excluded.created_at_unix;",
            params![
                path_text(&proxy.path),
                proxy.host.to_string(),
                ports_json,
                route_ids_json,
                i64::from(proxy.active),
                proxy.created_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete_proxy(&self, path: &Path) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        conn.execute(
            "DELETE FROM proxy_state WHERE path = ?1;",
            params![path_text(path)],
        )?;
        Ok(())
    }

    pub fn load_proxies(&self) -> Result<Vec<PersistedProxy>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT path, host, ports_json, route_ids_json, active, created_at_unix
             FROM proxy_state ORDER BY path;",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut proxies = Vec::new();
        for row in rows {
            let (path, host, ports_json, route_ids_json, active, created_at) = row?;
            proxies.push(PersistedProxy {
                path: PathBuf::from(path),
                host: parse_host(&host)?,
                ports: serde_json::from_str(&ports_json)
                    .map_err(|e| StateStoreError::InvalidData(format!("deserialize ports: {e}")))?,
                route_ids: serde_json::from_str(&route_ids_json).map_err(|e| {
                    StateStoreError::InvalidData(format!("deserialize route ids: {e}"))
                })?,
                active: active != 0,
                created_at: to_u64(created_at, "created_at_unix")?,
            });
        }
        Ok(proxies)
    }

    pub fn server_status(&self, path: &Path) -> Result<Option<ServerStatus>, StateStoreError> {
        let conn = self.open_connection()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM servers WHERE path = ?1;",
                params![path_text(path)],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => Ok(None),
            Some(s) => ServerStatus::parse(&s)
                .map(Some)
                .ok_or_else(|| StateStoreError::InvalidData(format!("unknown server status: {s}"))),
        }
    }

    fn open_connection(&self) -> Result<Connection, StateStoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn parse_host(value: &str) -> Result<Ipv4Addr, StateStoreError> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| StateStoreError::InvalidData(format!("bad host address: {value}")))
}

fn to_u32(value: i64, field: &str) -> Result<u32, StateStoreError> {
    u32::try_from(value).map_err(|_| {
        StateStoreError::InvalidData(format!("field '{field}' out of range for u32: {value}"))
    })
}

fn to_u64(value: i64, field: &str) -> Result<u64, StateStoreError> {
    u64::try_from(value).map_err(|_| {
        StateStoreError::InvalidData(format!("field '{field}' out of range for u64: {value}"))
    })
}
