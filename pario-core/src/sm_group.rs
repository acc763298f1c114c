// vim: tw=80
//! The lock domain shared by a client's I/O requests

use std::fmt::{self, Debug, Formatter};

use futures_locks::{Mutex, MutexGuard};
use uuid::Uuid;

/// Counters protected by the group lock
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GroupStats {
    /// Requests submitted
    pub requests: u64,
    /// Requests that ended in `Failed`
    pub failed: u64,
    /// State transitions of all requests
    pub transitions: u64,
    /// Protocol requests completed
    pub fops: u64,
}

/// Serializes state changes and completion handling of every request that
/// belongs to one client.
pub struct SmGroup {
    id: Uuid,
    stats: Mutex<GroupStats>,
}

impl SmGroup {
    pub fn new() -> Self {
        SmGroup {
            id: Uuid::new_v4(),
            stats: Mutex::new(GroupStats::default())
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn lock(&self) -> MutexGuard<GroupStats> {
        self.stats.lock().await
    }

    pub async fn stats(&self) -> GroupStats {
        *self.stats.lock().await
    }
}

impl Debug for SmGroup {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SmGroup")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Default for SmGroup {
    fn default() -> Self {
        Self::new()
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;

    #[tokio::test]
    async fn counters() {
        let group = SmGroup::new();
        {
            let mut guard = group.lock().await;
            guard.requests += 1;
            guard.transitions += 3;
        }
        let stats = group.stats().await;
        assert_eq!(stats, GroupStats{requests: 1, transitions: 3,
                                     ..Default::default()});
    }

    #[test]
    fn distinct_ids() {
        assert_ne!(SmGroup::new().id(), SmGroup::new().id());
    }
}
// LCOV_EXCL_STOP
