//! Per-conversation turn serialization
//!
//! The tool cannot safely resume one session from two processes at once, so
//! every turn for a conversation runs under that conversation's lock. Locks
//! are created on first use and removed as soon as nobody holds or awaits
//! them, which keeps the table proportional to in-flight conversations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Waiting for the conversation lock took longer than allowed
#[derive(Debug, Error)]
#[error("timed out after {waited:?} waiting for another turn on this conversation")]
pub struct LockTimeout {
    pub waited: Duration,
}

/// Table of per-conversation locks
#[derive(Default)]
pub struct TurnLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TurnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` while holding the lock for `key`.
    ///
    /// `None` runs unserialized. Waiters on the same key are served in
    /// arrival order (tokio's mutex is fair). The lock is released on every
    /// exit path, including when the returned future is dropped.
    pub async fn with_lock<F, T>(
        &self,
        key: Option<&str>,
        wait_limit: Option<Duration>,
        fut: F,
    ) -> Result<T, LockTimeout>
    where
        F: Future<Output = T>,
    {
        let Some(key) = key else {
            return Ok(fut.await);
        };

        let lease = self.lease(key);
        let _guard = match wait_limit {
            Some(limit) => tokio::time::timeout(limit, lease.handle().lock())
                .await
                .map_err(|_| LockTimeout { waited: limit })?,
            None => lease.handle().lock().await,
        };

        Ok(fut.await)
    }

    /// Number of conversations currently holding or awaiting a lock
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop table entries nobody references. Leases already clean up after
    /// themselves; this only catches entries left behind by a panic.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().unwrap();
        let before = locks.len();
        locks.retain(|_, handle| Arc::strong_count(handle) > 1);
        before - locks.len()
    }

    fn lease(&self, key: &str) -> Lease<'_> {
        let handle = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        Lease {
            table: self,
            key: key.to_string(),
            handle: Some(handle),
        }
    }
}

/// One caller's reference to a conversation lock
struct Lease<'a> {
    table: &'a TurnLocks,
    key: String,
    handle: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Lease<'_> {
    fn handle(&self) -> &tokio::sync::Mutex<()> {
        self.handle
            .as_deref()
            .unwrap_or_else(|| unreachable!("lease handle is only taken in drop"))
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let mut locks = self.table.locks.lock().unwrap();
        // Table entry plus ours: no other holder or waiter remains
        if Arc::strong_count(&handle) == 2 {
            locks.remove(&self.key);
        }
    }
}
