use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use utils::telemetry::QueueMetrics;

use conductor_types::{ExecutionKind, ExecutionPlan, RunId, ServiceId, ShardId};

#[derive(Error, Debug)]
pub enum QueueError {
    /// Two live shards with one id is an invariant breach; the caller logs it
    /// and aborts the operation without crashing the process.
    #[error("shard {0} is already queued")]
    Duplicate(ShardId),
}

/// A pending shard plus everything the scheduler's predicate and the eventual
/// work offer need, so matching never goes back to the store.
#[derive(Clone, Debug)]
pub struct QueuedShard {
    pub shard_id: ShardId,
    pub run_id: RunId,
    pub service_id: ServiceId,
    pub shard_index: u32,
    pub shard_count: u32,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    pub allowed_zones: BTreeSet<String>,
    pub execution: ExecutionKind,
    pub plan: ExecutionPlan,
}

/// Deterministic queue order: priority desc, created_at asc, shard_id asc.
#[derive(Clone, Debug, PartialEq, Eq)]
struct QueueKey {
    priority: u32,
    created_at: DateTime<Utc>,
    shard_id: ShardId,
}

impl QueueKey {
    fn of(entry: &QueuedShard) -> Self {
        Self {
            priority: entry.priority,
            created_at: entry.created_at,
            shard_id: entry.shard_id,
        }
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.created_at.cmp(&other.created_at))
            .then(self.shard_id.cmp(&other.shard_id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    order: BTreeSet<QueueKey>,
    entries: HashMap<ShardId, QueuedShard>,
    by_service: HashMap<ServiceId, HashSet<ShardId>>,
    by_run: HashMap<RunId, HashSet<ShardId>>,
    by_zone: HashMap<String, HashSet<ShardId>>,
}

impl QueueInner {
    fn unlink(&mut self, entry: &QueuedShard) {
        self.order.remove(&QueueKey::of(entry));
        if let Some(ids) = self.by_service.get_mut(&entry.service_id) {
            ids.remove(&entry.shard_id);
            if ids.is_empty() {
                self.by_service.remove(&entry.service_id);
            }
        }
        if let Some(ids) = self.by_run.get_mut(&entry.run_id) {
            ids.remove(&entry.shard_id);
            if ids.is_empty() {
                self.by_run.remove(&entry.run_id);
            }
        }
        for zone in &entry.allowed_zones {
            if let Some(ids) = self.by_zone.get_mut(zone) {
                ids.remove(&entry.shard_id);
                if ids.is_empty() {
                    self.by_zone.remove(zone);
                }
            }
        }
    }
}

/// Holds shards that are pending and not yet assigned. Repopulated from the
/// run store at startup so crash recovery is lossless.
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
    metrics: QueueMetrics,
}

impl PendingQueue {
    pub fn new(metrics: QueueMetrics) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            metrics,
        }
    }

    pub fn admit(&self, entry: QueuedShard) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&entry.shard_id) {
            return Err(QueueError::Duplicate(entry.shard_id));
        }
        inner.order.insert(QueueKey::of(&entry));
        inner
            .by_service
            .entry(entry.service_id)
            .or_default()
            .insert(entry.shard_id);
        inner
            .by_run
            .entry(entry.run_id)
            .or_default()
            .insert(entry.shard_id);
        for zone in &entry.allowed_zones {
            inner
                .by_zone
                .entry(zone.clone())
                .or_default()
                .insert(entry.shard_id);
        }
        inner.entries.insert(entry.shard_id, entry);
        self.metrics.record_admitted();
        Ok(())
    }

    /// Returns the highest-priority shard reachable from `agent_zones` that
    /// satisfies the predicate, removing it from the queue.
    pub fn pop<F>(&self, agent_zones: &BTreeSet<String>, mut predicate: F) -> Option<QueuedShard>
    where
        F: FnMut(&QueuedShard) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();

        let mut reachable: HashSet<ShardId> = HashSet::new();
        for zone in agent_zones {
            if let Some(ids) = inner.by_zone.get(zone) {
                reachable.extend(ids.iter().copied());
            }
        }
        if reachable.is_empty() {
            return None;
        }

        let found = inner
            .order
            .iter()
            .filter(|key| reachable.contains(&key.shard_id))
            .map(|key| key.shard_id)
            .find(|shard_id| {
                inner
                    .entries
                    .get(shard_id)
                    .map(&mut predicate)
                    .unwrap_or(false)
            })?;

        let entry = inner.entries.remove(&found)?;
        inner.unlink(&entry);
        self.metrics.record_popped();
        Some(entry)
    }

    /// Idempotent removal, used on cancellation and reassignment.
    pub fn remove(&self, shard_id: ShardId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.remove(&shard_id) {
            Some(entry) => {
                inner.unlink(&entry);
                self.metrics.record_removed();
                true
            }
            None => false,
        }
    }

    /// Remove every queued shard of a run. Returns the removed entries so the
    /// caller can mark them cancelled.
    pub fn remove_run(&self, run_id: RunId) -> Vec<QueuedShard> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<ShardId> = inner
            .by_run
            .get(&run_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = Vec::with_capacity(ids.len());
        for shard_id in ids {
            if let Some(entry) = inner.entries.remove(&shard_id) {
                inner.unlink(&entry);
                self.metrics.record_removed();
                removed.push(entry);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth by priority bucket, for the queue-depth gauge and the
    /// health report.
    pub fn snapshot(&self) -> BTreeMap<u32, usize> {
        let inner = self.inner.lock().unwrap();
        let mut buckets: BTreeMap<u32, usize> = BTreeMap::new();
        for entry in inner.entries.values() {
            *buckets.entry(entry.priority).or_default() += 1;
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use opentelemetry::global;

    fn queue() -> PendingQueue {
        PendingQueue::new(QueueMetrics::new(&global::meter("test")))
    }

    fn entry(id: u128, priority: u32, created_secs: i64, zones: &[&str]) -> QueuedShard {
        QueuedShard {
            shard_id: ShardId::from_u128(id),
            run_id: RunId::from_u128(id >> 8),
            service_id: ServiceId::from_u128(1),
            shard_index: 0,
            shard_count: 1,
            priority,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
            allowed_zones: zones.iter().map(|z| z.to_string()).collect(),
            execution: ExecutionKind::Process,
            plan: ExecutionPlan {
                git_ref: "main".into(),
                git_sha: "abc123".into(),
                execution: ExecutionKind::Process,
                test_filter: None,
                test_timeout_secs: 600,
            },
        }
    }

    fn zones(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|z| z.to_string()).collect()
    }

    #[test]
    fn pops_in_priority_order() {
        let queue = queue();
        queue.admit(entry(1, 5, 100, &["z1"])).unwrap();
        queue.admit(entry(2, 10, 200, &["z1"])).unwrap();
        queue.admit(entry(3, 10, 150, &["z1"])).unwrap();

        let zones = zones(&["z1"]);
        // higher priority first, then earlier created_at
        assert_eq!(
            queue.pop(&zones, |_| true).unwrap().shard_id,
            ShardId::from_u128(3)
        );
        assert_eq!(
            queue.pop(&zones, |_| true).unwrap().shard_id,
            ShardId::from_u128(2)
        );
        assert_eq!(
            queue.pop(&zones, |_| true).unwrap().shard_id,
            ShardId::from_u128(1)
        );
        assert!(queue.pop(&zones, |_| true).is_none());
    }

    #[test]
    fn shard_id_breaks_ties() {
        let queue = queue();
        queue.admit(entry(9, 5, 100, &["z1"])).unwrap();
        queue.admit(entry(4, 5, 100, &["z1"])).unwrap();

        let zones = zones(&["z1"]);
        assert_eq!(
            queue.pop(&zones, |_| true).unwrap().shard_id,
            ShardId::from_u128(4)
        );
    }

    #[test]
    fn zone_index_filters_unreachable() {
        let queue = queue();
        queue.admit(entry(1, 10, 100, &["z2"])).unwrap();
        queue.admit(entry(2, 5, 100, &["z1"])).unwrap();

        // higher-priority shard lives in an unreachable zone
        let popped = queue.pop(&zones(&["z1"]), |_| true).unwrap();
        assert_eq!(popped.shard_id, ShardId::from_u128(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn predicate_skips_to_next_match() {
        let queue = queue();
        queue.admit(entry(1, 10, 100, &["z1"])).unwrap();
        queue.admit(entry(2, 5, 100, &["z1"])).unwrap();

        let popped = queue
            .pop(&zones(&["z1"]), |e| e.shard_id != ShardId::from_u128(1))
            .unwrap();
        assert_eq!(popped.shard_id, ShardId::from_u128(2));
    }

    #[test]
    fn admit_rejects_duplicates() {
        let queue = queue();
        queue.admit(entry(1, 5, 100, &["z1"])).unwrap();
        assert!(matches!(
            queue.admit(entry(1, 5, 100, &["z1"])),
            Err(QueueError::Duplicate(_))
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let queue = queue();
        queue.admit(entry(1, 5, 100, &["z1"])).unwrap();
        assert!(queue.remove(ShardId::from_u128(1)));
        assert!(!queue.remove(ShardId::from_u128(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_run_clears_all_of_a_run() {
        let queue = queue();
        // ids 0x100 and 0x101 share run id 0x1
        queue.admit(entry(0x100, 5, 100, &["z1"])).unwrap();
        queue.admit(entry(0x101, 5, 100, &["z1"])).unwrap();
        queue.admit(entry(0x200, 5, 100, &["z1"])).unwrap();

        let removed = queue.remove_run(RunId::from_u128(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn snapshot_buckets_by_priority() {
        let queue = queue();
        queue.admit(entry(1, 5, 100, &["z1"])).unwrap();
        queue.admit(entry(2, 5, 101, &["z1"])).unwrap();
        queue.admit(entry(3, 10, 102, &["z1"])).unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.get(&5), Some(&2));
        assert_eq!(snapshot.get(&10), Some(&1));
    }
}
