//! Loopback host allocation.
//!
//! Every active dev server gets its own 127.0.0.x address so several
//! servers can bind the same port number without colliding. Allocations
//! are written through to the state store before a call returns, which is
//! what lets a restarted daemon reconcile the pool against whatever is
//! still alive.

use crate::defaults::{HOST_POOL_FIRST_OCTET, HOST_POOL_LAST_OCTET};
use crate::state_store::{SqliteStateStore, StateStoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("loopback host pool exhausted ({0} addresses in use)")]
    Exhausted(usize),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

pub struct HostAllocator {
    store: Arc<SqliteStateStore>,
    // host -> path; BTreeMap keeps the first-fit scan deterministic.
    bound: Mutex<BTreeMap<Ipv4Addr, PathBuf>>,
}

impl HostAllocator {
    /// Rebuild the in-memory table from the persisted allocation rows.
    pub fn load(store: Arc<SqliteStateStore>) -> Result<Self, HostError> {
        let mut bound = BTreeMap::new();
        for (host, path) in store.load_allocations()? {
            bound.insert(host, path);
        }
        Ok(Self {
            store,
            bound: Mutex::new(bound),
        })
    }

    /// Reserve a loopback address for `path`. Idempotent: a path that
    /// already holds an allocation gets the same host back.
    pub fn allocate(&self, path: &Path) -> Result<Ipv4Addr, HostError> {
        let mut bound = self.bound.lock();

        if let Some((host, _)) = bound.iter().find(|(_, p)| p.as_path() == path) {
            return Ok(*host);
        }

        let host = Self::pool()
            .find(|candidate| !bound.contains_key(candidate))
            .ok_or(HostError::Exhausted(bound.len()))?;

        self.store.set_allocation(host, path)?;
        bound.insert(host, path.to_path_buf());
        Ok(host)
    }

    /// Release whatever `path` holds. Releasing an unallocated path is a no-op.
    pub fn release(&self, path: &Path) -> Result<(), HostError> {
        let mut bound = self.bound.lock();
        let Some(host) = bound
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(host, _)| *host)
        else {
            return Ok(());
        };

        self.store.delete_allocation(path)?;
        bound.remove(&host);
        Ok(())
    }

    pub fn lookup(&self, path: &Path) -> Option<Ipv4Addr> {
        self.bound
            .lock()
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(host, _)| *host)
    }

    /// Drop allocations whose path is not in `active_paths`. Used at daemon
    /// startup to purge entries left behind by a crashed supervisor or a
    /// deleted worktree.
    pub fn reconcile(&self, active_paths: &HashSet<PathBuf>) -> Result<(), HostError> {
        let mut bound = self.bound.lock();
        let stale: Vec<(Ipv4Addr, PathBuf)> = bound
            .iter()
            .filter(|(_, p)| !active_paths.contains(*p))
            .map(|(h, p)| (*h, p.clone()))
            .collect();

        for (host, path) in stale {
            self.store.delete_allocation(&path)?;
            bound.remove(&host);
        }
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        self.bound.lock().len()
    }

    fn pool() -> impl Iterator<Item = Ipv4Addr> {
        (HOST_POOL_FIRST_OCTET..=HOST_POOL_LAST_OCTET).map(|octet| Ipv4Addr::new(127, 0, 0, octet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn allocator() -> (TempDir, HostAllocator) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStateStore::new(temp.path().join("state.sqlite3")));
        store.init().unwrap();
        (temp, HostAllocator::load(store).unwrap())
    }

    #[test]
    fn allocates_distinct_hosts_in_pool_order() {
        let (_temp, hosts) = allocator();
        let a = hosts.allocate(Path::new("/repo/wt-a")).unwrap();
        let b = hosts.allocate(Path::new("/repo/wt-b")).unwrap();
        assert_eq!(a, Ipv4Addr::new(127, 0, 0, 2));
        assert_eq!(b, Ipv4Addr::new(127, 0, 0, 3));
        assert_ne!(a, b);
    }

    #[test]
    fn allocate_is_idempotent_per_path() {
        let (_temp, hosts) = allocator();
        let first = hosts.allocate(Path::new("/repo/wt-a")).unwrap();
        let again = hosts.allocate(Path::new("/repo/wt-a")).unwrap();
        assert_eq!(first, again);
        assert_eq!(hosts.allocated_count(), 1);
    }

    #[test]
    fn released_host_is_reused() {
        let (_temp, hosts) = allocator();
        let a = hosts.allocate(Path::new("/repo/wt-a")).unwrap();
        hosts.allocate(Path::new("/repo/wt-b")).unwrap();
        hosts.release(Path::new("/repo/wt-a")).unwrap();

        let c = hosts.allocate(Path::new("/repo/wt-c")).unwrap();
        assert_eq!(c, a, "first-fit should reuse the freed address");
    }

    #[test]
    fn release_of_unknown_path_is_a_no_op() {
        let (_temp, hosts) = allocator();
        hosts.release(Path::new("/never/allocated")).unwrap();
    }

    #[test]
    fn lookup_reflects_allocations() {
        let (_temp, hosts) = allocator();
        assert!(hosts.lookup(Path::new("/repo/wt-a")).is_none());
        let a = hosts.allocate(Path::new("/repo/wt-a")).unwrap();
        assert_eq!(hosts.lookup(Path::new("/repo/wt-a")), Some(a));
    }

    #[test]
    fn exhausted_pool_errors() {
        let (_temp, hosts) = allocator();
        for i in 0..(HOST_POOL_LAST_OCTET - HOST_POOL_FIRST_OCTET + 1) as usize {
            hosts
                .allocate(Path::new(&format!("/repo/wt-{i}")))
                .unwrap();
        }
        let err = hosts.allocate(Path::new("/repo/one-too-many")).unwrap_err();
        assert!(matches!(err, HostError::Exhausted(_)), "{err}");
    }

    #[test]
    fn reconcile_drops_paths_outside_the_active_set() {
        let (_temp, hosts) = allocator();
        hosts.allocate(Path::new("/repo/wt-a")).unwrap();
        hosts.allocate(Path::new("/repo/wt-b")).unwrap();

        let active: HashSet<PathBuf> = [PathBuf::from("/repo/wt-b")].into_iter().collect();
        hosts.reconcile(&active).unwrap();

        assert!(hosts.lookup(Path::new("/repo/wt-a")).is_none());
        assert!(hosts.lookup(Path::new("/repo/wt-b")).is_some());
    }

    #[test]
    fn allocations_survive_a_reload() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStateStore::new(temp.path().join("state.sqlite3")));
        store.init().unwrap();

        let first = HostAllocator::load(store.clone()).unwrap();
        let host = first.allocate(Path::new("/repo/wt-a")).unwrap();
        drop(first);

        let reloaded = HostAllocator::load(store).unwrap();
        assert_eq!(reloaded.lookup(Path::new("/repo/wt-a")), Some(host));
        // And the reloaded allocator does not hand that host to someone else.
        let other = reloaded.allocate(Path::new("/repo/wt-b")).unwrap();
        assert_ne!(other, host);
    }
}
