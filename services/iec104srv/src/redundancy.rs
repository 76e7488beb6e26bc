//! Redundancy groups
//!
//! A group owns one [`PriorityQueuePair`]. Of the group's connections only the
//! most recently started one (the active connection) may drain it. The group
//! wakes the active connection whenever there is something for it to do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::asdu::Asdu;
use crate::connection::ConnectionId;
use crate::queue::{Priority, PriorityQueuePair, QueueStats};

/// How connections are mapped to redundancy groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// All connections share one queue; only one of them receives data
    #[default]
    SingleRedundancyGroup,
    /// Every connection is its own group with its own queue
    ConnectionIsRedundancyGroup,
}

#[derive(Debug)]
struct GroupInner {
    queues: PriorityQueuePair,
    members: HashMap<ConnectionId, Arc<Notify>>,
    /// Started members, oldest first; the last one is active
    started: Vec<ConnectionId>,
}

impl GroupInner {
    fn active(&self) -> Option<ConnectionId> {
        self.started.last().copied()
    }

    fn waker(&self, id: Option<ConnectionId>) -> Option<Arc<Notify>> {
        id.and_then(|id| self.members.get(&id).cloned())
    }
}

#[derive(Debug)]
pub struct RedundancyGroup {
    id: u64,
    inner: Mutex<GroupInner>,
}

impl RedundancyGroup {
    fn new(id: u64, high_capacity: usize, low_capacity: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(GroupInner {
                queues: PriorityQueuePair::new(high_capacity, low_capacity),
                members: HashMap::new(),
                started: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn active(&self) -> Option<ConnectionId> {
        self.inner.lock().active()
    }

    pub fn members(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().queues.stats()
    }

    fn join(&self, conn: ConnectionId, wakeup: Arc<Notify>) {
        self.inner.lock().members.insert(conn, wakeup);
    }

    /// Remove a member; returns the number left
    fn leave(&self, conn: ConnectionId) -> usize {
        let (remaining, wake) = {
            let mut inner = self.inner.lock();
            let before = inner.active();
            inner.members.remove(&conn);
            inner.started.retain(|&id| id != conn);
            let after = inner.active();
            let wake = if before != after {
                inner.waker(after)
            } else {
                None
            };
            (inner.members.len(), wake)
        };
        if let Some(wake) = wake {
            wake.notify_one();
        }
        remaining
    }

    /// The connection entered `Started`; it becomes the active one
    pub fn mark_started(&self, conn: ConnectionId) {
        let wake = {
            let mut inner = self.inner.lock();
            inner.started.retain(|&id| id != conn);
            inner.started.push(conn);
            inner.waker(Some(conn))
        };
        debug!("Group {}: connection {} is active", self.id, conn);
        if let Some(wake) = wake {
            wake.notify_one();
        }
    }

    /// The connection left `Started`; the most recent remaining one takes over
    pub fn mark_stopped(&self, conn: ConnectionId) {
        let (next, wake) = {
            let mut inner = self.inner.lock();
            let was_active = inner.active() == Some(conn);
            inner.started.retain(|&id| id != conn);
            if !was_active {
                return;
            }
            let next = inner.active();
            (next, inner.waker(next))
        };
        match next {
            Some(next) => info!(
                "Group {}: connection {} stopped, failing over to connection {}",
                self.id, conn, next
            ),
            None => debug!("Group {}: no started connection left", self.id),
        }
        if let Some(wake) = wake {
            wake.notify_one();
        }
    }

    /// Queue an ASDU; returns `true` if an older one was evicted
    pub fn enqueue(&self, asdu: Asdu, priority: Priority) -> bool {
        let (evicted, wake) = {
            let mut inner = self.inner.lock();
            let evicted = inner.queues.enqueue(asdu, priority);
            (evicted, inner.waker(inner.active()))
        };
        if let Some(wake) = wake {
            wake.notify_one();
        }
        evicted
    }

    /// Next ASDU for `conn`, or `None` if it is not the active connection
    pub fn next_for(&self, conn: ConnectionId) -> Option<(Asdu, Priority)> {
        let mut inner = self.inner.lock();
        if inner.active() != Some(conn) {
            return None;
        }
        inner.queues.pop_next()
    }
}

/// Assigns connections to groups according to the [`ServerMode`]
#[derive(Debug)]
pub struct RedundancyCoordinator {
    mode: ServerMode,
    high_capacity: usize,
    low_capacity: usize,
    shared: Arc<RedundancyGroup>,
    groups: Mutex<HashMap<ConnectionId, Arc<RedundancyGroup>>>,
    next_group_id: AtomicU64,
    /// Counters of per-connection groups that no longer exist
    retired: Mutex<QueueStats>,
}

impl RedundancyCoordinator {
    pub fn new(mode: ServerMode, high_capacity: usize, low_capacity: usize) -> Self {
        Self {
            mode,
            high_capacity,
            low_capacity,
            shared: Arc::new(RedundancyGroup::new(0, high_capacity, low_capacity)),
            groups: Mutex::new(HashMap::new()),
            next_group_id: AtomicU64::new(1),
            retired: Mutex::new(QueueStats::default()),
        }
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Place a new connection in its group
    pub fn join(&self, conn: ConnectionId, wakeup: Arc<Notify>) -> Arc<RedundancyGroup> {
        let group = match self.mode {
            ServerMode::SingleRedundancyGroup => self.shared.clone(),
            ServerMode::ConnectionIsRedundancyGroup => Arc::new(RedundancyGroup::new(
                self.next_group_id.fetch_add(1, Ordering::Relaxed),
                self.high_capacity,
                self.low_capacity,
            )),
        };
        group.join(conn, wakeup);
        self.groups.lock().insert(conn, group.clone());
        group
    }

    pub fn leave(&self, conn: ConnectionId) {
        let Some(group) = self.groups.lock().remove(&conn) else {
            return;
        };
        let remaining = group.leave(conn);
        if self.mode == ServerMode::ConnectionIsRedundancyGroup && remaining == 0 {
            let stats = group.stats();
            let mut retired = self.retired.lock();
            retired.high_evicted += stats.high_evicted;
            retired.low_evicted += stats.low_evicted;
        }
    }

    /// Queue an ASDU in every group; returns how many groups received it
    pub fn enqueue(&self, asdu: Asdu, priority: Priority) -> usize {
        match self.mode {
            ServerMode::SingleRedundancyGroup => {
                self.shared.enqueue(asdu, priority);
                1
            },
            ServerMode::ConnectionIsRedundancyGroup => {
                let groups: Vec<_> = self.groups.lock().values().cloned().collect();
                for group in &groups {
                    group.enqueue(asdu.clone(), priority);
                }
                groups.len()
            },
        }
    }

    /// Fill levels and overflow counters summed over all groups
    pub fn stats(&self) -> QueueStats {
        match self.mode {
            ServerMode::SingleRedundancyGroup => self.shared.stats(),
            ServerMode::ConnectionIsRedundancyGroup => {
                let groups: Vec<_> = self.groups.lock().values().cloned().collect();
                let retired = *self.retired.lock();
                groups
                    .iter()
                    .fold(retired, |acc, group| acc.merge(group.stats()))
            },
        }
    }
}
