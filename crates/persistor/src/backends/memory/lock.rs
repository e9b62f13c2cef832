//! Row locks with waits-for deadlock detection.
//!
//! A connection holds every lock it takes until its transaction ends. A
//! connection that finds a row locked by another waits; if the owner is
//! itself (transitively) waiting on the requester, the requester gets
//! [`BackendError::Deadlock`] instead.

use std::collections::HashMap;
use std::pin::pin;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{BackendError, BackendResult};

pub(crate) type ConnectionId = u64;
type RowKey = (String, String);

#[derive(Debug, Default)]
struct LockTable {
    owners: HashMap<RowKey, ConnectionId>,
    waiting: HashMap<ConnectionId, RowKey>,
}

impl LockTable {
    /// Whether `owner` is waiting, directly or through others, on `requester`.
    fn waits_on(&self, owner: ConnectionId, requester: ConnectionId) -> bool {
        let mut current = owner;
        for _ in 0..=self.waiting.len() {
            if current == requester {
                return true;
            }
            match self.waiting.get(&current).and_then(|key| self.owners.get(key)) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
}

impl LockManager {
    /// Takes the lock on `target/id` for `conn`, waiting up to `timeout`.
    pub(crate) async fn acquire(
        &self,
        conn: ConnectionId,
        target: &str,
        id: &str,
        timeout: Duration,
    ) -> BackendResult<()> {
        let key: RowKey = (target.to_string(), id.to_string());
        let deadline = Instant::now() + timeout;

        loop {
            let mut released = pin!(self.released.notified());
            released.as_mut().enable();

            {
                let mut table = self.table.lock();
                match table.owners.get(&key).copied() {
                    None => {
                        table.owners.insert(key, conn);
                        table.waiting.remove(&conn);
                        return Ok(());
                    }
                    Some(owner) if owner == conn => return Ok(()),
                    Some(owner) => {
                        if table.waits_on(owner, conn) {
                            table.waiting.remove(&conn);
                            tracing::debug!(conn, owner, target = %target, id = %id, "Deadlock detected");
                            return Err(BackendError::Deadlock {
                                target: target.to_string(),
                                id: id.to_string(),
                            });
                        }
                        table.waiting.insert(conn, key.clone());
                    }
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                self.table.lock().waiting.remove(&conn);
                return Err(BackendError::LockTimeout {
                    target: target.to_string(),
                    id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Releases every lock held by `conn` and wakes all waiters.
    pub(crate) fn release_all(&self, conn: ConnectionId) {
        {
            let mut table = self.table.lock();
            table.owners.retain(|_, owner| *owner != conn);
            table.waiting.remove(&conn);
        }
        self.released.notify_waiters();
    }

    #[cfg(test)]
    fn held_by(&self, conn: ConnectionId) -> usize {
        self.table.lock().owners.values().filter(|o| **o == conn).count()
    }
}
