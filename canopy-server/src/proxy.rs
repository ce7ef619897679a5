//! Proxy route management against the external reverse proxy.
//!
//! Canopy does not proxy traffic itself; it drives the admin HTTP API of a
//! cooperating reverse proxy on a well-known local port. Enabling a proxy
//! for a server registers one listener per configured port, each forwarding
//! `:port` to `allocated_host:port`. At most one path holds an active proxy
//! at a time: enabling a new one disables the previous one outright.

use crate::defaults::{PROXY_ADMIN_TIMEOUT, PROXY_ADMIN_URL, PROXY_DEFAULT_PORTS};
use crate::state_store::{PersistedProxy, SqliteStateStore, StateStoreError};
use canopy_core::{ProxyInfo, ProxyStatus};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("dev server for {path} is not running with an allocated host")]
    PrereqNotMet { path: String },

    #[error("proxy route registration failed for port {port}: {reason}")]
    ConfigFailed { port: u16, reason: String },

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL of the reverse proxy's admin API.
    pub admin_url: String,
    /// Ports forwarded for an enabled proxy.
    pub ports: Vec<u16>,
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: PROXY_ADMIN_URL.to_string(),
            ports: PROXY_DEFAULT_PORTS.to_vec(),
            timeout: PROXY_ADMIN_TIMEOUT,
        }
    }
}

pub struct RouteManager {
    client: reqwest::Client,
    config: ProxyConfig,
    store: Arc<SqliteStateStore>,
    // One lock covers the whole table so enable/disable are atomic with
    // respect to each other across paths (single-active invariant).
    states: Mutex<HashMap<PathBuf, PersistedProxy>>,
}

impl RouteManager {
    pub fn load(config: ProxyConfig, store: Arc<SqliteStateStore>) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.timeout)
            .build()
            .expect("failed to build admin API client");

        let mut states = HashMap::new();
        for record in store.load_proxies()? {
            states.insert(record.path.clone(), record);
        }

        Ok(Self {
            client,
            config,
            store,
            states: Mutex::new(states),
        })
    }

    /// Register routes forwarding to `host`. Any other active proxy is
    /// disabled first; partial registration failures roll back the routes
    /// already registered for this path.
    pub async fn enable(&self, path: &Path, host: Ipv4Addr) -> Result<ProxyInfo, ProxyError> {
        let mut states = self.states.lock().await;

        let others: Vec<PathBuf> = states
            .iter()
            .filter(|(p, record)| p.as_path() != path && record.active)
            .map(|(p, _)| p.clone())
            .collect();
        for other in others {
            tracing::info!(
                previous = %other.display(),
                next = %path.display(),
                "switching active proxy"
            );
            if let Err(e) = self.teardown(&mut states, &other).await {
                tracing::warn!(path = %other.display(), error = %e, "tearing down previous proxy failed");
            }
        }

        // Re-registering the same path replaces its routes wholesale.
        if states.contains_key(path) {
            self.teardown(&mut states, path).await?;
        }

        let mut registered: Vec<String> = Vec::new();
        for &port in &self.config.ports {
            let route_id = route_id_for(port);
            match self.put_route(&route_id, port, host).await {
                Ok(()) => registered.push(route_id),
                Err(reason) => {
                    for route_id in &registered {
                        if let Err(e) = self.delete_route(route_id).await {
                            tracing::warn!(route_id = %route_id, error = %e, "rollback of registered route failed");
                        }
                    }
                    return Err(ProxyError::ConfigFailed { port, reason });
                }
            }
        }

        let record = PersistedProxy {
            path: path.to_path_buf(),
            host,
            ports: self.config.ports.clone(),
            route_ids: registered,
            active: true,
            created_at: unix_now(),
        };
        self.store.upsert_proxy(&record)?;
        states.insert(path.to_path_buf(), record.clone());

        Ok(ProxyInfo {
            status: ProxyStatus::Active,
            ports: record.ports,
        })
    }

    /// Remove the routes registered for `path`. No-op for unknown paths.
    pub async fn disable(&self, path: &Path) -> Result<(), ProxyError> {
        let mut states = self.states.lock().await;
        self.teardown(&mut states, path).await
    }

    pub async fn state(&self, path: &Path) -> Option<ProxyInfo> {
        let states = self.states.lock().await;
        states.get(path).map(|record| ProxyInfo {
            status: if record.active {
                ProxyStatus::Active
            } else {
                ProxyStatus::Inactive
            },
            ports: record.ports.clone(),
        })
    }

    pub async fn active_path(&self) -> Option<PathBuf> {
        let states = self.states.lock().await;
        states
            .iter()
            .find(|(_, record)| record.active)
            .map(|(p, _)| p.clone())
    }

    /// Drop proxies whose path no longer has an active server. Run at
    /// daemon startup after orphan reconciliation.
    pub async fn reconcile(&self, active_paths: &HashSet<PathBuf>) {
        let mut states = self.states.lock().await;
        let stale: Vec<PathBuf> = states
            .keys()
            .filter(|p| !active_paths.contains(*p))
            .cloned()
            .collect();
        for path in stale {
            if let Err(e) = self.teardown(&mut states, &path).await {
                tracing::warn!(path = %path.display(), error = %e, "stale proxy cleanup failed");
            }
        }
    }

    async fn teardown(
        &self,
        states: &mut HashMap<PathBuf, PersistedProxy>,
        path: &Path,
    ) -> Result<(), ProxyError> {
        let Some(record) = states.remove(path) else {
            return Ok(());
        };
        for route_id in &record.route_ids {
            if let Err(e) = self.delete_route(route_id).await {
                // The route may already be gone (proxy restarted); deletion
                // stays best-effort.
                tracing::debug!(route_id = %route_id, error = %e, "route deletion failed");
            }
        }
        self.store.delete_proxy(path)?;
        Ok(())
    }

    async fn put_route(&self, route_id: &str, port: u16, host: Ipv4Addr) -> Result<(), String> {
        let url = self.route_url(route_id);
        let payload = listener_payload(port, host);
        match self.client.put(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("admin API returned {}", resp.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn delete_route(&self, route_id: &str) -> Result<(), String> {
        let url = self.route_url(route_id);
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("admin API returned {}", resp.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    fn route_url(&self, route_id: &str) -> String {
        format!(
            "{}/config/apps/http/servers/{}",
            self.config.admin_url.trim_end_matches('/'),
            route_id
        )
    }
}

fn route_id_for(port: u16) -> String {
    format!("canopy-{port}")
}

/// Admin API body for one forwarding listener.
fn listener_payload(port: u16, host: Ipv4Addr) -> serde_json::Value {
    serde_json::json!({
        "listen": [format!(":{port}")],
        "routes": [{
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": format!("{host}:{port}") }]
            }]
        }]
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
