//! Partition logs and subscription cursors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use contracts::{InitialPosition, SubscriptionKind};

pub(crate) type ConsumerId = u64;

/// Stored log entry
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub key: Option<String>,
    pub content: Bytes,
    pub publish_time: DateTime<Utc>,
}

/// One topic: partition logs plus the subscriptions reading them
#[derive(Debug)]
pub(crate) struct TopicState {
    partitions: Vec<Vec<Entry>>,
    pub subscriptions: HashMap<String, SubscriptionState>,
}

impl TopicState {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions.max(1) as usize],
            subscriptions: HashMap::new(),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Append to a partition, returning the entry index
    pub fn append(&mut self, partition: u32, entry: Entry) -> u64 {
        let log = &mut self.partitions[partition as usize];
        log.push(entry);
        (log.len() - 1) as u64
    }

    pub fn entry(&self, partition: u32, entry: u64) -> Option<&Entry> {
        self.partitions
            .get(partition as usize)
            .and_then(|log| log.get(entry as usize))
    }

    /// Next append position of every partition
    pub fn end_positions(&self) -> Vec<u64> {
        self.partitions.iter().map(|log| log.len() as u64).collect()
    }

    /// All payloads, partition by partition
    pub fn contents(&self) -> Vec<Bytes> {
        self.partitions
            .iter()
            .flat_map(|log| log.iter().map(|e| e.content.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }
}

#[derive(Debug)]
struct Pending {
    consumer: ConsumerId,
    delivered_at: Instant,
}

/// Cursor of one subscription over one partition
///
/// Entries below `mark` are acknowledged; `acked` holds individually
/// acknowledged entries at or above `mark`.
#[derive(Debug, Default)]
struct PartitionCursor {
    read: u64,
    mark: u64,
    acked: BTreeSet<u64>,
    pending: BTreeMap<u64, Pending>,
    redeliver: BTreeSet<u64>,
    redelivery_counts: HashMap<u64, u32>,
}

impl PartitionCursor {
    fn at(position: u64) -> Self {
        Self {
            read: position,
            mark: position,
            ..Default::default()
        }
    }

    fn is_acked(&self, entry: u64) -> bool {
        entry < self.mark || self.acked.contains(&entry)
    }

    fn advance_mark(&mut self) {
        while self.acked.remove(&self.mark) {
            self.mark += 1;
        }
        self.read = self.read.max(self.mark);
    }

    fn take_next(&mut self, end: u64) -> Option<u64> {
        while let Some(entry) = self.redeliver.pop_first() {
            if !self.is_acked(entry) {
                return Some(entry);
            }
        }
        while self.read < end {
            let entry = self.read;
            self.read += 1;
            if !self.is_acked(entry) {
                return Some(entry);
            }
        }
        None
    }

    fn forget(&mut self, entry: u64, unacked: &mut HashMap<ConsumerId, usize>) {
        if let Some(pending) = self.pending.remove(&entry) {
            decrement(unacked, pending.consumer);
        }
        self.redeliver.remove(&entry);
        self.redelivery_counts.remove(&entry);
    }

    /// Move matching in-flight entries back to the redelivery set
    fn requeue(
        &mut self,
        unacked: &mut HashMap<ConsumerId, usize>,
        filter: impl Fn(u64, &Pending) -> bool,
    ) -> usize {
        let entries: Vec<u64> = self
            .pending
            .iter()
            .filter(|(e, p)| filter(**e, p))
            .map(|(e, _)| *e)
            .collect();
        for entry in &entries {
            if let Some(pending) = self.pending.remove(entry) {
                decrement(unacked, pending.consumer);
                self.redeliver.insert(*entry);
                *self.redelivery_counts.entry(*entry).or_insert(0) += 1;
            }
        }
        entries.len()
    }

    fn reset(&mut self, position: u64, unacked: &mut HashMap<ConsumerId, usize>) {
        for pending in std::mem::take(&mut self.pending).into_values() {
            decrement(unacked, pending.consumer);
        }
        self.redeliver.clear();
        self.redelivery_counts.clear();
        self.acked.clear();
        self.read = position;
        self.mark = position;
    }
}

fn decrement(unacked: &mut HashMap<ConsumerId, usize>, consumer: ConsumerId) {
    if let Some(n) = unacked.get_mut(&consumer) {
        *n = n.saturating_sub(1);
    }
}

/// Entry handed to a consumer
#[derive(Debug, Clone, Copy)]
pub(crate) struct Delivery {
    pub partition: u32,
    pub entry: u64,
    pub redelivery_count: u32,
}

/// Subscription cursor set plus attached consumers
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    pub kind: SubscriptionKind,
    consumers: Vec<ConsumerId>,
    cursors: Vec<PartitionCursor>,
    unacked: HashMap<ConsumerId, usize>,
}

impl SubscriptionState {
    pub fn new(kind: SubscriptionKind, position: InitialPosition, ends: &[u64]) -> Self {
        let cursors = ends
            .iter()
            .map(|&end| match position {
                InitialPosition::Earliest => PartitionCursor::at(0),
                InitialPosition::Latest => PartitionCursor::at(end),
            })
            .collect();
        Self {
            kind,
            consumers: Vec::new(),
            cursors,
            unacked: HashMap::new(),
        }
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    pub fn attach(&mut self, consumer: ConsumerId) -> Result<(), String> {
        if self.kind == SubscriptionKind::Exclusive && self.has_consumers() {
            return Err("exclusive subscription already has an active consumer".to_string());
        }
        let before = self.owners();
        self.consumers.push(consumer);
        self.rebalance(&before);
        Ok(())
    }

    /// Detach a consumer; its in-flight messages become redeliverable
    pub fn detach(&mut self, consumer: ConsumerId) -> usize {
        if !self.consumers.contains(&consumer) {
            return 0;
        }
        let before = self.owners();
        self.consumers.retain(|c| *c != consumer);
        let mut requeued = 0;
        for cursor in &mut self.cursors {
            requeued += cursor.requeue(&mut self.unacked, |_, p| p.consumer == consumer);
        }
        self.unacked.remove(&consumer);
        self.rebalance(&before);
        requeued
    }

    /// Failover owner of a partition
    fn owner_of(&self, partition: usize) -> Option<ConsumerId> {
        match self.kind {
            SubscriptionKind::Failover if !self.consumers.is_empty() => {
                Some(self.consumers[partition % self.consumers.len()])
            }
            _ => None,
        }
    }

    fn owners(&self) -> Vec<Option<ConsumerId>> {
        (0..self.cursors.len()).map(|p| self.owner_of(p)).collect()
    }

    /// Ownership moved: hand the partition's in-flight messages to the new owner
    fn rebalance(&mut self, before: &[Option<ConsumerId>]) {
        if self.kind != SubscriptionKind::Failover {
            return;
        }
        for partition in 0..self.cursors.len() {
            if before.get(partition).copied().flatten() != self.owner_of(partition) {
                self.cursors[partition].requeue(&mut self.unacked, |_, _| true);
            }
        }
    }

    /// Consumers currently receiving messages
    pub fn active_consumers(&self) -> usize {
        match self.kind {
            SubscriptionKind::Failover => self.consumers.len().min(self.cursors.len()),
            _ => self.consumers.len(),
        }
    }

    /// Pick the next entry for `consumer`, starting the partition scan at `start`
    pub fn next_for(
        &mut self,
        consumer: ConsumerId,
        ends: &[u64],
        max_unacked: usize,
        start: usize,
    ) -> Option<Delivery> {
        if max_unacked > 0 && self.unacked.get(&consumer).copied().unwrap_or(0) >= max_unacked {
            return None;
        }

        let n = self.cursors.len();
        for offset in 0..n {
            let partition = (start + offset) % n;
            if self.kind == SubscriptionKind::Failover && self.owner_of(partition) != Some(consumer)
            {
                continue;
            }
            let end = ends.get(partition).copied().unwrap_or(0);
            let cursor = &mut self.cursors[partition];
            let Some(entry) = cursor.take_next(end) else {
                continue;
            };
            cursor.pending.insert(
                entry,
                Pending {
                    consumer,
                    delivered_at: Instant::now(),
                },
            );
            *self.unacked.entry(consumer).or_insert(0) += 1;
            return Some(Delivery {
                partition: partition as u32,
                entry,
                redelivery_count: cursor.redelivery_counts.get(&entry).copied().unwrap_or(0),
            });
        }
        None
    }

    /// Returns true if the entry was not acknowledged before
    pub fn acknowledge(&mut self, partition: u32, entry: u64, end: u64) -> bool {
        let Some(cursor) = self.cursors.get_mut(partition as usize) else {
            return false;
        };
        if entry >= end || cursor.is_acked(entry) {
            return false;
        }
        cursor.forget(entry, &mut self.unacked);
        cursor.acked.insert(entry);
        cursor.advance_mark();
        true
    }

    /// Acknowledge everything up to and including `entry`, returning the newly acknowledged count
    pub fn acknowledge_cumulative(
        &mut self,
        partition: u32,
        entry: u64,
        end: u64,
    ) -> Result<u64, String> {
        if self.kind == SubscriptionKind::Shared {
            return Err("cumulative acknowledgment is not allowed on shared subscriptions".into());
        }
        let Some(cursor) = self.cursors.get_mut(partition as usize) else {
            return Err(format!("unknown partition {partition}"));
        };
        if entry >= end {
            return Err(format!("entry {entry} is beyond the end of partition {partition}"));
        }
        if entry < cursor.mark {
            return Ok(0);
        }

        let mut newly = 0;
        for e in cursor.mark..=entry {
            if !cursor.acked.contains(&e) {
                newly += 1;
            }
            cursor.forget(e, &mut self.unacked);
        }
        cursor.acked.retain(|e| *e > entry);
        cursor.mark = entry + 1;
        cursor.advance_mark();
        Ok(newly)
    }

    /// Returns true if the entry was in flight and is now queued for redelivery
    pub fn negative_acknowledge(&mut self, partition: u32, entry: u64) -> bool {
        let Some(cursor) = self.cursors.get_mut(partition as usize) else {
            return false;
        };
        cursor.requeue(&mut self.unacked, |e, _| e == entry) > 0
    }

    pub fn seek(&mut self, partition: u32, entry: u64, end: u64) -> bool {
        let Some(cursor) = self.cursors.get_mut(partition as usize) else {
            return false;
        };
        cursor.reset(entry.min(end), &mut self.unacked);
        true
    }

    pub fn seek_to_latest(&mut self, ends: &[u64]) {
        for (cursor, &end) in self.cursors.iter_mut().zip(ends) {
            cursor.reset(end, &mut self.unacked);
        }
    }

    /// Requeue in-flight messages older than `timeout`
    pub fn requeue_expired(&mut self, timeout: Duration) -> usize {
        let mut requeued = 0;
        for cursor in &mut self.cursors {
            requeued += cursor.requeue(&mut self.unacked, |_, p| p.delivered_at.elapsed() >= timeout);
        }
        requeued
    }

    /// Entries not yet acknowledged
    pub fn backlog(&self, ends: &[u64]) -> u64 {
        self.cursors
            .iter()
            .zip(ends)
            .map(|(cursor, &end)| end.saturating_sub(cursor.mark) - cursor.acked.len() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(kind: SubscriptionKind, partitions: usize) -> SubscriptionState {
        SubscriptionState::new(kind, InitialPosition::Earliest, &vec![0; partitions])
    }

    #[test]
    fn test_shared_hands_each_entry_out_once() {
        let mut state = sub(SubscriptionKind::Shared, 1);
        state.attach(1).unwrap();
        state.attach(2).unwrap();
        let ends = [3];

        let a = state.next_for(1, &ends, 0, 0).unwrap();
        let b = state.next_for(2, &ends, 0, 0).unwrap();
        let c = state.next_for(1, &ends, 0, 0).unwrap();
        assert_eq!((a.entry, b.entry, c.entry), (0, 1, 2));
        assert!(state.next_for(2, &ends, 0, 0).is_none());
    }

    #[test]
    fn test_failover_assigns_partitions() {
        let mut state = sub(SubscriptionKind::Failover, 2);
        state.attach(1).unwrap();
        state.attach(2).unwrap();
        state.attach(3).unwrap();
        let ends = [1, 1];

        assert_eq!(state.active_consumers(), 2);
        assert_eq!(state.next_for(1, &ends, 0, 0).unwrap().partition, 0);
        assert_eq!(state.next_for(2, &ends, 0, 0).unwrap().partition, 1);
        assert!(state.next_for(3, &ends, 0, 0).is_none());
    }

    #[test]
    fn test_failover_redelivers_in_order_after_detach() {
        let mut state = sub(SubscriptionKind::Failover, 1);
        state.attach(1).unwrap();
        state.attach(2).unwrap();
        let ends = [3];

        assert_eq!(state.next_for(1, &ends, 0, 0).unwrap().entry, 0);
        assert_eq!(state.next_for(1, &ends, 0, 0).unwrap().entry, 1);
        assert!(state.next_for(2, &ends, 0, 0).is_none());

        state.detach(1);
        let first = state.next_for(2, &ends, 0, 0).unwrap();
        assert_eq!(first.entry, 0);
        assert_eq!(first.redelivery_count, 1);
        assert_eq!(state.next_for(2, &ends, 0, 0).unwrap().entry, 1);
        assert_eq!(state.next_for(2, &ends, 0, 0).unwrap().entry, 2);
    }

    #[test]
    fn test_exclusive_rejects_second_consumer() {
        let mut state = sub(SubscriptionKind::Exclusive, 1);
        state.attach(1).unwrap();
        assert!(state.attach(2).is_err());
    }

    #[test]
    fn test_ack_advances_mark_and_backlog() {
        let mut state = sub(SubscriptionKind::Shared, 1);
        state.attach(1).unwrap();
        let ends = [3];
        for _ in 0..3 {
            state.next_for(1, &ends, 0, 0).unwrap();
        }

        assert!(state.acknowledge(0, 1, 3));
        assert!(!state.acknowledge(0, 1, 3));
        assert_eq!(state.backlog(&ends), 2);
        assert!(state.acknowledge(0, 0, 3));
        assert!(state.acknowledge(0, 2, 3));
        assert_eq!(state.backlog(&ends), 0);
    }

    #[test]
    fn test_cumulative_ack_rules() {
        let mut shared = sub(SubscriptionKind::Shared, 1);
        assert!(shared.acknowledge_cumulative(0, 0, 1).is_err());

        let mut ordered = sub(SubscriptionKind::Failover, 1);
        ordered.attach(1).unwrap();
        let ends = [5];
        for _ in 0..5 {
            ordered.next_for(1, &ends, 0, 0).unwrap();
        }
        assert_eq!(ordered.acknowledge_cumulative(0, 3, 5).unwrap(), 4);
        assert_eq!(ordered.backlog(&ends), 1);
    }

    #[test]
    fn test_max_unacked_bound() {
        let mut state = sub(SubscriptionKind::Shared, 1);
        state.attach(1).unwrap();
        let ends = [10];
        assert!(state.next_for(1, &ends, 2, 0).is_some());
        assert!(state.next_for(1, &ends, 2, 0).is_some());
        assert!(state.next_for(1, &ends, 2, 0).is_none());
        state.acknowledge(0, 0, 10);
        assert!(state.next_for(1, &ends, 2, 0).is_some());
    }

    #[test]
    fn test_nack_and_seek() {
        let mut state = sub(SubscriptionKind::Exclusive, 1);
        state.attach(1).unwrap();
        let ends = [4];
        let first = state.next_for(1, &ends, 0, 0).unwrap();
        assert!(state.negative_acknowledge(0, first.entry));
        assert_eq!(state.next_for(1, &ends, 0, 0).unwrap().entry, 0);

        state.seek(0, 3, 4);
        assert_eq!(state.next_for(1, &ends, 0, 0).unwrap().entry, 3);
        state.seek_to_latest(&ends);
        assert!(state.next_for(1, &ends, 0, 0).is_none());
    }
}
