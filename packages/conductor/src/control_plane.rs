use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::instrument;

use utils::clock::Clock;
use utils::context::AppContext;
use utils::store::{RunStore, ShardPatch, StoreError};
use utils::telemetry::CoreMetrics;

use conductor_types::{
    Page, PageRequest, Run, RunFilter, RunId, RunStatus, ServiceId, ShardId, ShardStatus,
    StreamErrorCode,
};

use crate::config::Config;
use crate::subsystems::admission::AdmissionManager;
use crate::subsystems::aggregator::{AggregatorEvent, RunAggregator};
use crate::subsystems::bus::EventBus;
use crate::subsystems::queue::{PendingQueue, QueuedShard};
use crate::subsystems::registry::AgentRegistry;
use crate::subsystems::scheduler::{Scheduler, SchedulerConfig, SchedulerEvent};
use crate::subsystems::session::SessionManager;

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const SCHEDULE_EVAL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const SHUTDOWN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("already started")]
    AlreadyStarted,
}

/// Wires the run-lifecycle subsystems together: the queue, agent registry,
/// dispatch sessions, scheduler, aggregator, event bus, and admission.
///
/// The scheduler and aggregator are single-writer loops fed by bounded
/// channels; everything else is shared state reachable from the HTTP layer.
pub struct ControlPlane {
    pub config: Config,
    pub store: Arc<dyn RunStore>,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<PendingQueue>,
    pub registry: Arc<AgentRegistry>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
    pub admission: Arc<AdmissionManager>,

    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    aggregator_tx: mpsc::Sender<AggregatorEvent>,
    scheduler_rx: Mutex<Option<mpsc::Receiver<SchedulerEvent>>>,
    aggregator_rx: Mutex<Option<mpsc::Receiver<AggregatorEvent>>>,
    metrics: CoreMetrics,
}

impl ControlPlane {
    pub fn new(
        config: Config,
        metrics: CoreMetrics,
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (scheduler_tx, scheduler_rx) = mpsc::channel(config.result_stream_buffer.max(16));
        let (aggregator_tx, aggregator_rx) = mpsc::channel(config.result_stream_buffer.max(16));

        let queue = Arc::new(PendingQueue::new(metrics.queue.clone()));
        let bus = Arc::new(EventBus::new(config.subscriber_buffer, metrics.bus.clone()));
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            clock.clone(),
            bus.clone(),
            metrics.registry.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            scheduler_tx.clone(),
            aggregator_tx.clone(),
            metrics.session.clone(),
        ));
        let admission = Arc::new(AdmissionManager::new(
            store.clone(),
            queue.clone(),
            bus.clone(),
            clock.clone(),
            scheduler_tx.clone(),
            metrics.admission.clone(),
            &config,
        ));

        Self {
            config,
            store,
            clock,
            queue,
            registry,
            sessions,
            bus,
            admission,
            scheduler_tx,
            aggregator_tx,
            scheduler_rx: Mutex::new(Some(scheduler_rx)),
            aggregator_rx: Mutex::new(Some(aggregator_rx)),
            metrics,
        }
    }

    /// Recover from the store, then spawn the subsystem loops. Called once.
    #[instrument(skip(self, ctx), fields(subsys = "ControlPlane"))]
    pub async fn start(self: &Arc<Self>, ctx: AppContext) -> Result<(), ControlPlaneError> {
        let scheduler_rx = self
            .scheduler_rx
            .lock()
            .await
            .take()
            .ok_or(ControlPlaneError::AlreadyStarted)?;
        let aggregator_rx = self
            .aggregator_rx
            .lock()
            .await
            .take()
            .ok_or(ControlPlaneError::AlreadyStarted)?;

        let (recovered_in_flight, recovered_running) = self.recover().await?;

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            self.sessions.clone(),
            self.clock.clone(),
            self.aggregator_tx.clone(),
            self.metrics.scheduler.clone(),
            SchedulerConfig {
                offer_timeout: self.config.offer_timeout(),
                start_timeout: self.config.start_timeout(),
                cancel_grace: self.config.cancel_grace(),
                service_quota: self.config.service_quota,
            },
            recovered_in_flight,
        );
        let mut aggregator = RunAggregator::new(
            self.store.clone(),
            self.bus.clone(),
            self.clock.clone(),
            self.scheduler_tx.clone(),
            self.metrics.aggregator.clone(),
            self.config.max_test_timeout(),
        );
        for (run_id, deadline) in recovered_running {
            aggregator.arm_deadline(run_id, deadline);
        }

        ctx.rt.spawn(scheduler.run(scheduler_rx));
        ctx.rt.spawn(aggregator.run(aggregator_rx));

        // liveness sweep at heartbeat_timeout / 3
        ctx.rt.spawn({
            let control = self.clone();
            let mut shutdown = ctx.on_shutdown();
            let period =
                std::time::Duration::from_secs((self.config.heartbeat_timeout_secs / 3).max(1));
            async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = interval.tick() => {
                            let expired = control.registry.expired_agents(control.config.heartbeat_timeout());
                            for agent_id in expired {
                                control.sessions.expire_agent(agent_id).await;
                            }
                        }
                    }
                }
            }
        });

        // deadline ticks for the scheduler and aggregator
        ctx.rt.spawn({
            let scheduler_tx = self.scheduler_tx.clone();
            let aggregator_tx = self.aggregator_tx.clone();
            let mut shutdown = ctx.on_shutdown();
            async move {
                let mut interval = tokio::time::interval(TICK_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = interval.tick() => {
                            let _ = scheduler_tx.send(SchedulerEvent::Tick).await;
                            let _ = aggregator_tx.send(AggregatorEvent::Tick).await;
                        }
                    }
                }
            }
        });

        // schedule evaluator
        ctx.rt.spawn({
            let admission = self.admission.clone();
            let mut shutdown = ctx.on_shutdown();
            async move {
                let mut interval = tokio::time::interval(SCHEDULE_EVAL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = interval.tick() => {
                            if let Err(err) = admission.evaluate_schedules().await {
                                tracing::error!("schedule evaluation failed: {err}");
                            }
                        }
                    }
                }
            }
        });

        tracing::info!(
            queue_depth = self.queue.len(),
            "control plane started"
        );
        Ok(())
    }

    /// Rebuild in-memory state from the store: re-admit recoverable shards
    /// and reconstruct quota accounting and run deadlines for work that was
    /// in flight when the process stopped.
    async fn recover(
        &self,
    ) -> Result<
        (
            HashMap<ShardId, ServiceId>,
            Vec<(RunId, chrono::DateTime<chrono::Utc>)>,
        ),
        ControlPlaneError,
    > {
        // assigned-but-unstarted shards lost their agent with the process
        for shard in self.store.list_recoverable_shards().await? {
            let shard = if shard.status == ShardStatus::Assigned {
                match self
                    .store
                    .update_shard_status(
                        shard.id,
                        ShardStatus::Assigned,
                        ShardStatus::Pending,
                        ShardPatch {
                            agent_id: Some(None),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(shard) => shard,
                    Err(StoreError::Conflict(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            } else {
                shard
            };

            let run = self.store.get_run(shard.run_id).await?;
            let service = self.store.get_service(run.service_id).await?;
            let entry = QueuedShard {
                shard_id: shard.id,
                run_id: run.id,
                service_id: service.id,
                shard_index: shard.shard_index,
                shard_count: run.shard_count,
                priority: run.priority,
                created_at: shard.created_at,
                allowed_zones: service.allowed_zones.clone(),
                execution: run.execution,
                plan: conductor_types::ExecutionPlan {
                    git_ref: run.git_ref.clone(),
                    git_sha: run.git_sha.clone(),
                    execution: run.execution,
                    test_filter: run.test_filter.clone(),
                    test_timeout_secs: self.config.default_test_timeout_secs,
                },
            };
            if let Err(err) = self.queue.admit(entry) {
                tracing::warn!(shard_id = %shard.id, "recovery enqueue skipped: {err}");
            }
        }

        // running shards survive a restart; their agents will reconnect and
        // replay, but quotas and run deadlines must be rebuilt now
        let mut in_flight = HashMap::new();
        let mut running_runs = Vec::new();
        let running = self
            .store
            .list_runs(
                &RunFilter {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
                PageRequest {
                    offset: 0,
                    limit: usize::MAX,
                },
            )
            .await?;
        for run in running.items {
            if let Some(started_at) = run.started_at {
                running_runs.push((run.id, started_at + self.config.max_test_timeout()));
            }
            for shard in self.store.list_shards(run.id).await? {
                if matches!(shard.status, ShardStatus::Assigned | ShardStatus::Running) {
                    in_flight.insert(shard.id, run.service_id);
                }
            }
        }

        if !self.queue.is_empty() || !in_flight.is_empty() {
            tracing::info!(
                requeued = self.queue.len(),
                in_flight = in_flight.len(),
                "recovered state from store"
            );
        }
        Ok((in_flight, running_runs))
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.store.get_run(run_id).await
    }

    pub async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<Page<Run>, StoreError> {
        self.store.list_runs(filter, page).await
    }

    /// Operator cancellation: verified against the store, then handed to the
    /// scheduler which owns the shard-level teardown.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), StoreError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "run {} is already {}",
                run_id, run.status
            )));
        }
        let _ = self
            .scheduler_tx
            .send(SchedulerEvent::CancelRun {
                run_id,
                reason: "cancelled by operator".to_string(),
            })
            .await;
        Ok(())
    }

    /// Graceful shutdown: stop offering, drain agents, wait for in-flight
    /// shards, then force whatever remains into `error(shutdown)`.
    /// Returns true when everything finished inside the window.
    #[instrument(skip(self), fields(subsys = "ControlPlane"))]
    pub async fn shutdown(&self) -> bool {
        tracing::info!("shutting down: draining agents");
        let _ = self.scheduler_tx.send(SchedulerEvent::Drain).await;
        if let Err(err) = self.registry.drain_all().await {
            tracing::warn!("drain_all failed: {err}");
        }
        self.sessions.broadcast_drain().await;

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        loop {
            let in_flight = match self.running_shards().await {
                Ok(in_flight) => in_flight,
                Err(err) => {
                    tracing::error!("shutdown poll failed: {err}");
                    return false;
                }
            };
            if in_flight.is_empty() {
                tracing::info!("all shards settled, shutdown clean");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = in_flight.len(),
                    "shutdown window elapsed, failing remaining shards"
                );
                for shard_id in in_flight {
                    let _ = self
                        .aggregator_tx
                        .send(AggregatorEvent::ShardInfraFailure {
                            shard_id,
                            error: "shutdown".to_string(),
                        })
                        .await;
                }
                // let the aggregator commit before the process exits
                tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    /// Tear down an agent that the sweep or an operator declared dead.
    pub fn close_session(&self, agent_id: conductor_types::AgentId) {
        self.sessions.close(agent_id, StreamErrorCode::Shutdown);
    }

    async fn running_shards(&self) -> Result<Vec<ShardId>, StoreError> {
        let mut in_flight = Vec::new();
        let running = self
            .store
            .list_runs(
                &RunFilter {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
                PageRequest {
                    offset: 0,
                    limit: usize::MAX,
                },
            )
            .await?;
        for run in running.items {
            for shard in self.store.list_shards(run.id).await? {
                if shard.status == ShardStatus::Running {
                    in_flight.push(shard.id);
                }
            }
        }
        Ok(in_flight)
    }
}
