//! Bounded outbound ASDU queues
//!
//! Both queues are lossy: when full, the oldest entry is evicted so the
//! newest process data always gets through.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::asdu::Asdu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Command responses and anything that must not wait behind bulk data
    High,
    /// Periodic and spontaneous reports
    Low,
}

/// FIFO with a fixed capacity and oldest-first eviction
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<Asdu>,
    capacity: usize,
    evicted: u64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append, returning the evicted entry if the queue was full
    pub fn push(&mut self, asdu: Asdu) -> Option<Asdu> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(asdu);
        evicted
    }

    pub fn pop(&mut self) -> Option<Asdu> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// Snapshot of queue fill levels and overflow counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub high_len: usize,
    pub low_len: usize,
    pub high_evicted: u64,
    pub low_evicted: u64,
    /// Dropped from per-connection response queues
    pub response_evicted: u64,
}

impl QueueStats {
    pub fn total_evicted(&self) -> u64 {
        self.high_evicted + self.low_evicted + self.response_evicted
    }

    pub fn merge(self, other: QueueStats) -> QueueStats {
        QueueStats {
            high_len: self.high_len + other.high_len,
            low_len: self.low_len + other.low_len,
            high_evicted: self.high_evicted + other.high_evicted,
            low_evicted: self.low_evicted + other.low_evicted,
            response_evicted: self.response_evicted + other.response_evicted,
        }
    }
}

/// High and low priority queues drained strictly high first
#[derive(Debug)]
pub struct PriorityQueuePair {
    high: MessageQueue,
    low: MessageQueue,
}

impl PriorityQueuePair {
    pub fn new(high_capacity: usize, low_capacity: usize) -> Self {
        Self {
            high: MessageQueue::new(high_capacity),
            low: MessageQueue::new(low_capacity),
        }
    }

    /// Returns `true` if an older entry had to be dropped
    pub fn enqueue(&mut self, asdu: Asdu, priority: Priority) -> bool {
        let queue = match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        };
        match queue.push(asdu) {
            Some(dropped) => {
                debug!(
                    "{:?} priority queue full ({}), dropped oldest ASDU {}",
                    priority,
                    queue.capacity(),
                    dropped
                );
                true
            },
            None => false,
        }
    }

    /// Next ASDU to send: everything high before anything low
    pub fn pop_next(&mut self) -> Option<(Asdu, Priority)> {
        if let Some(asdu) = self.high.pop() {
            return Some((asdu, Priority::High));
        }
        self.low.pop().map(|asdu| (asdu, Priority::Low))
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            high_len: self.high.len(),
            low_len: self.low.len(),
            high_evicted: self.high.evicted(),
            low_evicted: self.low.evicted(),
            response_evicted: 0,
        }
    }
}
