//! Bounded history of recent flow records
//!
//! Fixed capacity with FIFO eviction: when full, the oldest record is
//! dropped to make room. Overflow is the backpressure policy, never an error.

use std::collections::VecDeque;

use crate::models::FlowRecord;

/// Default number of records retained
pub const DEFAULT_RING_CAPACITY: usize = 10_000;

/// Ring buffer of the most recent flow records
#[derive(Debug)]
pub struct FlowRingBuffer {
    records: VecDeque<FlowRecord>,
    capacity: usize,
    /// Records evicted since creation
    dropped: u64,
    /// Records ever pushed
    total: u64,
}

impl FlowRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_RING_CAPACITY)),
            capacity,
            dropped: 0,
            total: 0,
        }
    }

    pub fn push(&mut self, record: FlowRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(record);
        self.total += 1;
    }

    /// Up to `limit` records, newest first
    pub fn recent(&self, limit: usize) -> Vec<FlowRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            entries: self.records.len(),
            capacity: self.capacity,
            dropped: self.dropped,
            total: self.total,
            oldest_timestamp: self.records.front().map(|r| r.timestamp.timestamp()),
            newest_timestamp: self.records.back().map(|r| r.timestamp.timestamp()),
        }
    }
}

impl Default for FlowRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStats {
    pub entries: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub total: u64,
    /// Unix seconds of the oldest retained record
    pub oldest_timestamp: Option<i64>,
    /// Unix seconds of the newest retained record
    pub newest_timestamp: Option<i64>,
}
