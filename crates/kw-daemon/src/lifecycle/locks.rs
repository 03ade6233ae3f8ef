//! Per-connection serialization

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};

use kw_core::ConnectionId;

/// One async mutex per connection id
///
/// Test, refresh, update and redeploy of the same connection run one at a
/// time; different connections never wait on each other.
#[derive(Debug, Default)]
pub struct ConnectionLocks {
    locks: DashMap<ConnectionId, Arc<Mutex<()>>>,
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a connection
    pub async fn lock(&self, id: ConnectionId) -> OwnedMutexGuard<()> {
        // The map shard guard must be released before awaiting
        let lock = Arc::clone(&self.locks.entry(id).or_default());
        lock.lock_owned().await
    }

    /// Drop the lock of a deleted connection
    pub fn forget(&self, id: ConnectionId) {
        self.locks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Connection ids with a background refresh in flight
#[derive(Debug, Default)]
pub struct InFlight {
    ids: DashSet<ConnectionId>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a connection; `None` if a refresh for it is already running
    pub fn try_claim(self: &Arc<Self>, id: ConnectionId) -> Option<InFlightClaim> {
        if self.ids.insert(id) {
            Some(InFlightClaim {
                set: Arc::clone(self),
                id,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.ids.contains(&id)
    }
}

/// Releases its connection id when dropped
#[derive(Debug)]
pub struct InFlightClaim {
    set: Arc<InFlight>,
    id: ConnectionId,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.set.ids.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let in_flight = Arc::new(InFlight::new());
        let claim = in_flight.try_claim(ConnectionId(1)).unwrap();
        assert!(in_flight.try_claim(ConnectionId(1)).is_none());
        assert!(in_flight.try_claim(ConnectionId(2)).is_some());

        drop(claim);
        assert!(!in_flight.contains(ConnectionId(1)));
        assert!(in_flight.try_claim(ConnectionId(1)).is_some());
    }

    #[tokio::test]
    async fn test_same_connection_serializes() {
        let locks = Arc::new(ConnectionLocks::new());
        let guard = locks.lock(ConnectionId(1)).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(ConnectionId(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Other connections are independent
        let _other = locks.lock(ConnectionId(2)).await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_removes_entry() {
        let locks = ConnectionLocks::new();
        drop(locks.lock(ConnectionId(9)).await);
        assert_eq!(locks.len(), 1);
        locks.forget(ConnectionId(9));
        assert!(locks.is_empty());
    }
}
