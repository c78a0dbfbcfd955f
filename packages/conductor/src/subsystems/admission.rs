use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use utils::clock::Clock;
use utils::store::{RunStore, StoreError};
use utils::telemetry::AdmissionMetrics;

use conductor_types::{
    AdmissionRequest, Event, ExecutionPlan, Run, RunCounters, RunId, RunStatus, Schedule, Service,
    TriggerKind,
};

use crate::config::Config;
use crate::subsystems::bus::EventBus;
use crate::subsystems::queue::{PendingQueue, QueuedShard};
use crate::subsystems::scheduler::SchedulerEvent;

#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Rejected before anything is persisted; surfaced to the caller.
    #[error("validation: {0}")]
    Validation(String),

    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AdmissionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AdmissionError::UnknownService(what),
            other => AdmissionError::Store(other),
        }
    }
}

/// Translates the three trigger sources (manual, webhook, schedule) into one
/// admission path: validate, persist the run and its shards, enqueue.
pub struct AdmissionManager {
    store: Arc<dyn RunStore>,
    queue: Arc<PendingQueue>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    metrics: AdmissionMetrics,
    priority_range: (u32, u32),
    default_test_timeout_secs: u64,
}

impl AdmissionManager {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<PendingQueue>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        scheduler_tx: mpsc::Sender<SchedulerEvent>,
        metrics: AdmissionMetrics,
        config: &Config,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            clock,
            scheduler_tx,
            metrics,
            priority_range: config.queue_priority_range,
            default_test_timeout_secs: config.default_test_timeout_secs,
        }
    }

    /// Admit a run: validate, create the run plus its shards, and enqueue
    /// them. Returns the persisted run.
    #[instrument(skip(self, request), fields(subsys = "Admission", service_id = %request.service_id))]
    pub async fn admit(&self, request: AdmissionRequest) -> Result<Run, AdmissionError> {
        let (min_priority, max_priority) = self.priority_range;
        if request.priority < min_priority || request.priority > max_priority {
            self.metrics.increment_rejected();
            return Err(AdmissionError::Validation(format!(
                "priority {} outside [{}, {}]",
                request.priority, min_priority, max_priority
            )));
        }
        if request.git_ref.trim().is_empty() {
            self.metrics.increment_rejected();
            return Err(AdmissionError::Validation("git ref is empty".to_string()));
        }
        let service = match self.store.get_service(request.service_id).await {
            Ok(service) => service,
            Err(err) => {
                self.metrics.increment_rejected();
                return Err(err.into());
            }
        };

        let now = self.clock.now();
        // the hint is a partitioning hint, never a promise of work
        let shard_count = request.shard_count_hint.max(1);

        let run = Run {
            id: RunId::generate(),
            service_id: service.id,
            git_ref: request.git_ref.clone(),
            git_sha: request.git_sha.clone(),
            trigger: request.trigger,
            triggered_by: request.triggered_by.clone(),
            priority: request.priority,
            status: RunStatus::Pending,
            execution: service.execution,
            shard_count,
            test_filter: request.test_filter.clone(),
            created_at: now,
            started_at: None,
            finished_at: None,
            counters: RunCounters::default(),
            error: None,
        };

        self.store.create_run(run.clone()).await?;
        let shards = self.store.create_shards(run.id, shard_count, now).await?;

        let plan = ExecutionPlan {
            git_ref: run.git_ref.clone(),
            git_sha: run.git_sha.clone(),
            execution: run.execution,
            test_filter: run.test_filter.clone(),
            test_timeout_secs: self.default_test_timeout_secs,
        };
        for shard in &shards {
            let entry = QueuedShard {
                shard_id: shard.id,
                run_id: run.id,
                service_id: service.id,
                shard_index: shard.shard_index,
                shard_count,
                priority: run.priority,
                created_at: shard.created_at,
                allowed_zones: service.allowed_zones.clone(),
                execution: run.execution,
                plan: plan.clone(),
            };
            if let Err(err) = self.queue.admit(entry) {
                tracing::error!(shard_id = %shard.id, "enqueue failed: {err}");
            }
        }
        let _ = self.scheduler_tx.send(SchedulerEvent::ShardAdmitted).await;

        self.metrics.increment_admitted();
        self.bus.publish(&Event::RunUpdate { run: run.clone() });
        tracing::info!(
            run_id = %run.id,
            shards = shard_count,
            priority = run.priority,
            trigger = ?run.trigger,
            "run admitted"
        );
        Ok(run)
    }

    /// Webhook admissions must arrive with a provider signature already
    /// verified upstream; unsigned deliveries are refused here.
    pub async fn admit_webhook(
        &self,
        request: AdmissionRequest,
        signature: Option<&str>,
    ) -> Result<Run, AdmissionError> {
        if signature.map(str::is_empty).unwrap_or(true) {
            self.metrics.increment_rejected();
            return Err(AdmissionError::Validation(
                "webhook delivery is unsigned".to_string(),
            ));
        }
        self.admit(AdmissionRequest {
            trigger: TriggerKind::Webhook,
            ..request
        })
        .await
    }

    /// One pass of the schedule evaluator: fire every enabled schedule whose
    /// `next_run_at` is due, and (re)compute the next occurrence.
    pub async fn evaluate_schedules(&self) -> Result<(), AdmissionError> {
        let now = self.clock.now();
        for schedule in self.store.list_schedules().await? {
            if !schedule.enabled {
                continue;
            }
            match schedule.next_run_at {
                None => {
                    // newly enabled: arm without firing
                    let next = next_occurrence(&schedule, now);
                    self.store
                        .set_schedule_next_run(schedule.id, next)
                        .await?;
                }
                Some(due) if due <= now => {
                    let service = self.store.get_service(schedule.service_id).await?;
                    self.fire_schedule(&schedule, &service).await;
                    let next = next_occurrence(&schedule, now);
                    self.store
                        .set_schedule_next_run(schedule.id, next)
                        .await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn fire_schedule(&self, schedule: &Schedule, service: &Service) {
        self.metrics.increment_schedule_fires();
        let request = AdmissionRequest {
            service_id: service.id,
            git_ref: schedule.git_ref.clone(),
            git_sha: String::new(),
            priority: schedule.priority,
            trigger: TriggerKind::Schedule,
            triggered_by: Some(schedule.id.to_string()),
            shard_count_hint: 1,
            test_filter: None,
        };
        if let Err(err) = self.admit(request).await {
            tracing::error!(schedule_id = %schedule.id, "scheduled admission failed: {err}");
        }
    }
}

fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match cron::Schedule::from_str(&schedule.cron) {
        Ok(cron_schedule) => cron_schedule.after(&after).next(),
        Err(err) => {
            tracing::error!(schedule_id = %schedule.id, cron = schedule.cron, "bad cron expression: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use conductor_types::{ExecutionKind, ScheduleId, ServiceId};
    use opentelemetry::global;
    use std::collections::BTreeSet;
    use utils::clock::ManualClock;
    use utils::store::memory::MemoryRunStore;
    use utils::telemetry::{BusMetrics, QueueMetrics};

    struct Harness {
        admission: AdmissionManager,
        store: Arc<MemoryRunStore>,
        queue: Arc<PendingQueue>,
        clock: ManualClock,
        scheduler_rx: mpsc::Receiver<SchedulerEvent>,
    }

    fn service(id: u128) -> Service {
        Service {
            id: ServiceId::from_u128(id),
            name: format!("svc-{id}"),
            git_url: "https://git.example.com/svc.git".into(),
            git_provider: Some("github".into()),
            default_branch: "main".into(),
            allowed_zones: BTreeSet::from(["z1".to_string()]),
            execution: ExecutionKind::Process,
            owner: None,
            contacts: vec![],
        }
    }

    fn request(service: u128) -> AdmissionRequest {
        AdmissionRequest {
            service_id: ServiceId::from_u128(service),
            git_ref: "main".into(),
            git_sha: "abc123".into(),
            priority: 10,
            trigger: TriggerKind::Manual,
            triggered_by: Some("tester".into()),
            shard_count_hint: 2,
            test_filter: None,
        }
    }

    async fn harness() -> Harness {
        let meter = global::meter("test");
        let store = Arc::new(MemoryRunStore::new());
        store.upsert_service(service(1)).await.unwrap();
        let queue = Arc::new(PendingQueue::new(QueueMetrics::new(&meter)));
        let bus = Arc::new(EventBus::new(16, BusMetrics::new(&meter)));
        let clock = ManualClock::new(Utc.timestamp_opt(10_000, 0).unwrap());
        let (scheduler_tx, scheduler_rx) = mpsc::channel(64);
        let config = Config::default();
        let admission = AdmissionManager::new(
            store.clone(),
            queue.clone(),
            bus,
            Arc::new(clock.clone()),
            scheduler_tx,
            AdmissionMetrics::new(&meter),
            &config,
        );
        Harness {
            admission,
            store,
            queue,
            clock,
            scheduler_rx,
        }
    }

    #[tokio::test]
    async fn admit_creates_run_shards_and_queue_entries() {
        let mut harness = harness().await;
        let run = harness.admission.admit(request(1)).await.unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.shard_count, 2);
        assert_eq!(harness.queue.len(), 2);

        let shards = harness.store.list_shards(run.id).await.unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].shard_index, 0);
        assert_eq!(shards[1].shard_index, 1);

        assert!(matches!(
            harness.scheduler_rx.recv().await.unwrap(),
            SchedulerEvent::ShardAdmitted
        ));
    }

    #[tokio::test]
    async fn rejects_bad_priority_and_empty_ref() {
        let harness = harness().await;

        let mut bad = request(1);
        bad.priority = 101;
        assert!(matches!(
            harness.admission.admit(bad).await,
            Err(AdmissionError::Validation(_))
        ));

        let mut bad = request(1);
        bad.git_ref = "  ".into();
        assert!(matches!(
            harness.admission.admit(bad).await,
            Err(AdmissionError::Validation(_))
        ));

        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_service() {
        let harness = harness().await;
        assert!(matches!(
            harness.admission.admit(request(99)).await,
            Err(AdmissionError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn shard_count_hint_is_clamped() {
        let harness = harness().await;
        let mut zero = request(1);
        zero.shard_count_hint = 0;
        let run = harness.admission.admit(zero).await.unwrap();
        assert_eq!(run.shard_count, 1);
    }

    #[tokio::test]
    async fn unsigned_webhooks_are_refused() {
        let harness = harness().await;
        assert!(matches!(
            harness.admission.admit_webhook(request(1), None).await,
            Err(AdmissionError::Validation(_))
        ));
        assert!(matches!(
            harness.admission.admit_webhook(request(1), Some("")).await,
            Err(AdmissionError::Validation(_))
        ));

        let run = harness
            .admission
            .admit_webhook(request(1), Some("sha256=deadbeef"))
            .await
            .unwrap();
        assert_eq!(run.trigger, TriggerKind::Webhook);
    }

    #[tokio::test]
    async fn schedules_fire_when_due() {
        let harness = harness().await;
        let schedule = Schedule {
            id: ScheduleId::from_u128(5),
            service_id: ServiceId::from_u128(1),
            cron: "0 0 * * * *".into(),
            git_ref: "main".into(),
            priority: 3,
            enabled: true,
            next_run_at: None,
        };
        harness.store.upsert_schedule(schedule).await.unwrap();

        // first pass arms the schedule without firing
        harness.admission.evaluate_schedules().await.unwrap();
        assert!(harness.queue.is_empty());
        let armed = harness.store.list_schedules().await.unwrap();
        let due = armed[0].next_run_at.unwrap();
        assert!(due > harness.clock.now());

        // advance past the occurrence and evaluate again
        harness.clock.set(due + Duration::seconds(1));
        harness.admission.evaluate_schedules().await.unwrap();
        assert_eq!(harness.queue.len(), 1);

        let rearmed = harness.store.list_schedules().await.unwrap();
        assert!(rearmed[0].next_run_at.unwrap() > due);

        // nothing double-fires on an immediate re-evaluation
        harness.admission.evaluate_schedules().await.unwrap();
        assert_eq!(harness.queue.len(), 1);
    }

    #[tokio::test]
    async fn disabled_schedules_never_fire() {
        let harness = harness().await;
        let schedule = Schedule {
            id: ScheduleId::from_u128(6),
            service_id: ServiceId::from_u128(1),
            cron: "0 0 * * * *".into(),
            git_ref: "main".into(),
            priority: 3,
            enabled: false,
            next_run_at: Some(harness.clock.now() - Duration::hours(1)),
        };
        harness.store.upsert_schedule(schedule).await.unwrap();

        harness.admission.evaluate_schedules().await.unwrap();
        assert!(harness.queue.is_empty());
    }
}
