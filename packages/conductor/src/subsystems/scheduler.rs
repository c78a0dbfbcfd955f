use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use utils::clock::Clock;
use utils::store::{RunStore, ShardPatch, StoreError};
use utils::telemetry::SchedulerMetrics;

use conductor_types::{
    Agent, AgentId, ExecutionKind, RunId, ServerFrame, ServiceId, ShardId, ShardStatus,
};

use crate::subsystems::aggregator::AggregatorEvent;
use crate::subsystems::queue::{PendingQueue, QueuedShard};
use crate::subsystems::registry::AgentRegistry;
use crate::subsystems::session::SessionManager;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Inputs to the single matching thread: capacity events, offer outcomes,
/// shard lifecycle notifications from the aggregator, agent loss, and
/// cancellation.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// New pending work was enqueued.
    ShardAdmitted,
    /// An agent registered or otherwise gained capacity.
    AgentAvailable { agent_id: AgentId },
    OfferAck {
        agent_id: AgentId,
        shard_id: ShardId,
    },
    OfferNack {
        agent_id: AgentId,
        shard_id: ShardId,
        reason: String,
    },
    /// The aggregator committed the shard's start; stop the start timer.
    ShardStarted {
        shard_id: ShardId,
        agent_id: AgentId,
    },
    /// The aggregator committed a terminal shard state; free capacity.
    ShardTerminal {
        shard_id: ShardId,
        run_id: RunId,
        agent_id: Option<AgentId>,
    },
    /// An agent went offline; decide requeue vs. error per shard.
    ShardsReleased {
        agent_id: AgentId,
        shard_ids: Vec<ShardId>,
    },
    /// Operator cancellation of a whole run.
    CancelRun { run_id: RunId, reason: String },
    /// Cancel a run's in-flight shards without touching the run state (used
    /// by the run-timeout path, where the aggregator already closed the run).
    CancelShardsForRun { run_id: RunId, reason: String },
    /// Graceful shutdown: stop making offers.
    Drain,
    Tick,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub offer_timeout: Duration,
    pub start_timeout: Duration,
    pub cancel_grace: Duration,
    /// Optional cap on concurrently assigned shards per service.
    pub service_quota: Option<u32>,
}

struct PendingAssignment {
    agent_id: AgentId,
    entry: QueuedShard,
    deadline: DateTime<Utc>,
}

struct PendingCancel {
    agent_id: Option<AgentId>,
    reason: String,
    deadline: DateTime<Utc>,
}

enum AssignOutcome {
    Offered,
    /// The shard was dropped or requeued without consuming the agent; try
    /// the next queue entry.
    Skip,
    /// The agent cannot take work right now; stop matching against it.
    AgentUnavailable,
}

/// The single logical control thread driving all matching decisions.
///
/// Owns its bookkeeping exclusively; every input arrives through the event
/// channel, so scheduling is deterministic given a fixed event order. The
/// store CAS (`pending -> assigned`) is what guarantees a shard is never
/// dispatched twice.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    queue: Arc<PendingQueue>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    aggregator_tx: mpsc::Sender<AggregatorEvent>,
    metrics: SchedulerMetrics,
    config: SchedulerConfig,

    outstanding_offers: HashMap<ShardId, PendingAssignment>,
    awaiting_start: HashMap<ShardId, PendingAssignment>,
    cancelling: HashMap<ShardId, PendingCancel>,
    /// service of every shard currently assigned or running, for quotas
    assigned_services: HashMap<ShardId, ServiceId>,
    service_counts: HashMap<ServiceId, u32>,
    draining: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<PendingQueue>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        aggregator_tx: mpsc::Sender<AggregatorEvent>,
        metrics: SchedulerMetrics,
        config: SchedulerConfig,
        recovered_in_flight: HashMap<ShardId, ServiceId>,
    ) -> Self {
        let mut service_counts: HashMap<ServiceId, u32> = HashMap::new();
        for service_id in recovered_in_flight.values() {
            *service_counts.entry(*service_id).or_default() += 1;
        }
        Self {
            store,
            queue,
            registry,
            sessions,
            clock,
            aggregator_tx,
            metrics,
            config,
            outstanding_offers: HashMap::new(),
            awaiting_start: HashMap::new(),
            cancelling: HashMap::new(),
            assigned_services: recovered_in_flight,
            service_counts,
            draining: false,
        }
    }

    /// Runs until the event channel closes.
    #[instrument(skip(self, rx), fields(subsys = "Scheduler"))]
    pub async fn run(mut self, mut rx: mpsc::Receiver<SchedulerEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.handle(event).await {
                self.metrics.increment_total_errors();
                tracing::error!("scheduler event failed: {err}");
            }
            self.drain_matches().await;
        }
        tracing::debug!("scheduler channel closed");
    }

    async fn handle(&mut self, event: SchedulerEvent) -> Result<(), SchedulerError> {
        match event {
            SchedulerEvent::ShardAdmitted | SchedulerEvent::AgentAvailable { .. } => Ok(()),
            SchedulerEvent::OfferAck { agent_id, shard_id } => {
                if let Some(pending) = self.outstanding_offers.remove(&shard_id) {
                    if pending.agent_id != agent_id {
                        // stale ack from a previous assignment round
                        self.outstanding_offers.insert(shard_id, pending);
                        return Ok(());
                    }
                    let deadline = self.clock.now() + self.config.start_timeout;
                    self.awaiting_start.insert(
                        shard_id,
                        PendingAssignment {
                            deadline,
                            ..pending
                        },
                    );
                }
                Ok(())
            }
            SchedulerEvent::OfferNack {
                agent_id,
                shard_id,
                reason,
            } => {
                if let Some(pending) = self.outstanding_offers.remove(&shard_id) {
                    if pending.agent_id != agent_id {
                        self.outstanding_offers.insert(shard_id, pending);
                        return Ok(());
                    }
                    tracing::debug!(shard_id = %shard_id, agent_id = %agent_id, reason, "offer refused");
                    self.release_assignment(shard_id, pending).await?;
                }
                Ok(())
            }
            SchedulerEvent::ShardStarted { shard_id, .. } => {
                // the ack may have been lost; either map can hold the timer
                self.outstanding_offers.remove(&shard_id);
                self.awaiting_start.remove(&shard_id);
                Ok(())
            }
            SchedulerEvent::ShardTerminal {
                shard_id,
                agent_id,
                ..
            } => {
                self.outstanding_offers.remove(&shard_id);
                self.awaiting_start.remove(&shard_id);
                self.cancelling.remove(&shard_id);
                self.forget_assignment(shard_id);
                if let Some(agent_id) = agent_id {
                    let _ = self.registry.remove_assignment(agent_id, shard_id).await;
                }
                Ok(())
            }
            SchedulerEvent::ShardsReleased {
                agent_id,
                shard_ids,
            } => self.shards_released(agent_id, shard_ids).await,
            SchedulerEvent::CancelRun { run_id, reason } => {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::RunCancelled {
                        run_id,
                        reason: reason.clone(),
                    })
                    .await;
                self.cancel_shards(run_id, reason).await
            }
            SchedulerEvent::CancelShardsForRun { run_id, reason } => {
                self.cancel_shards(run_id, reason).await
            }
            SchedulerEvent::Drain => {
                tracing::info!("scheduler draining, no further offers");
                self.draining = true;
                Ok(())
            }
            SchedulerEvent::Tick => self.tick().await,
        }
    }

    /// Agent loss. Shards with no events yet go back to pending; shards that
    /// already started become `error(agent_lost)` and are not retried.
    async fn shards_released(
        &mut self,
        agent_id: AgentId,
        shard_ids: Vec<ShardId>,
    ) -> Result<(), SchedulerError> {
        for shard_id in shard_ids {
            if let Some(pending) = self
                .outstanding_offers
                .remove(&shard_id)
                .or_else(|| self.awaiting_start.remove(&shard_id))
            {
                tracing::info!(shard_id = %shard_id, agent_id = %agent_id, "requeueing shard from lost agent");
                self.release_assignment(shard_id, pending).await?;
            } else {
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::ShardInfraFailure {
                        shard_id,
                        error: "agent_lost".to_string(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn cancel_shards(&mut self, run_id: RunId, reason: String) -> Result<(), SchedulerError> {
        // queued shards are cancelled outright
        for entry in self.queue.remove_run(run_id) {
            let _ = self
                .aggregator_tx
                .send(AggregatorEvent::ShardCancelled {
                    shard_id: entry.shard_id,
                    reason: reason.clone(),
                })
                .await;
        }

        let shards = match self.store.list_shards(run_id).await {
            Ok(shards) => shards,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for shard in shards {
            if shard.status.is_terminal() || self.cancelling.contains_key(&shard.id) {
                continue;
            }
            match shard.status {
                ShardStatus::Assigned => {
                    if let Some(pending) = self
                        .outstanding_offers
                        .remove(&shard.id)
                        .or_else(|| self.awaiting_start.remove(&shard.id))
                    {
                        let _ = self.sessions.try_send(
                            pending.agent_id,
                            ServerFrame::Cancel {
                                shard_id: shard.id,
                                reason: reason.clone(),
                            },
                        );
                        self.forget_assignment(shard.id);
                        let _ = self
                            .registry
                            .remove_assignment(pending.agent_id, shard.id)
                            .await;
                    }
                    let _ = self
                        .aggregator_tx
                        .send(AggregatorEvent::ShardCancelled {
                            shard_id: shard.id,
                            reason: reason.clone(),
                        })
                        .await;
                }
                ShardStatus::Running => {
                    // best-effort cancel; the grace timer forces the issue
                    if let Some(agent_id) = shard.agent_id {
                        let _ = self.sessions.try_send(
                            agent_id,
                            ServerFrame::Cancel {
                                shard_id: shard.id,
                                reason: reason.clone(),
                            },
                        );
                    }
                    self.cancelling.insert(
                        shard.id,
                        PendingCancel {
                            agent_id: shard.agent_id,
                            reason: reason.clone(),
                            deadline: self.clock.now() + self.config.cancel_grace,
                        },
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Deadline enforcement for offers, starts, and cancels.
    async fn tick(&mut self) -> Result<(), SchedulerError> {
        let now = self.clock.now();

        let expired_offers: Vec<ShardId> = self
            .outstanding_offers
            .iter()
            .filter(|(_, pending)| now > pending.deadline)
            .map(|(shard_id, _)| *shard_id)
            .collect();
        for shard_id in expired_offers {
            if let Some(pending) = self.outstanding_offers.remove(&shard_id) {
                tracing::warn!(shard_id = %shard_id, agent_id = %pending.agent_id, "offer timed out");
                self.metrics.increment_offer_timeouts();
                self.release_assignment(shard_id, pending).await?;
            }
        }

        let expired_starts: Vec<ShardId> = self
            .awaiting_start
            .iter()
            .filter(|(_, pending)| now > pending.deadline)
            .map(|(shard_id, _)| *shard_id)
            .collect();
        for shard_id in expired_starts {
            if let Some(pending) = self.awaiting_start.remove(&shard_id) {
                tracing::warn!(shard_id = %shard_id, agent_id = %pending.agent_id, "shard never started");
                self.metrics.increment_start_timeouts();
                let _ = self.sessions.try_send(
                    pending.agent_id,
                    ServerFrame::Cancel {
                        shard_id,
                        reason: "start timeout".to_string(),
                    },
                );
                self.release_assignment(shard_id, pending).await?;
            }
        }

        let expired_cancels: Vec<ShardId> = self
            .cancelling
            .iter()
            .filter(|(_, cancel)| now > cancel.deadline)
            .map(|(shard_id, _)| *shard_id)
            .collect();
        for shard_id in expired_cancels {
            if let Some(cancel) = self.cancelling.remove(&shard_id) {
                tracing::warn!(shard_id = %shard_id, "cancel grace elapsed, cancelling unilaterally");
                if let Some(agent_id) = cancel.agent_id {
                    let _ = self.registry.remove_assignment(agent_id, shard_id).await;
                }
                let _ = self
                    .aggregator_tx
                    .send(AggregatorEvent::ShardCancelled {
                        shard_id,
                        reason: cancel.reason,
                    })
                    .await;
            }
        }

        Ok(())
    }

    /// Return an assigned-but-unstarted shard to the queue. If the CAS loses
    /// to a concurrent start, the assignment stands and only the timer state
    /// is dropped.
    async fn release_assignment(
        &mut self,
        shard_id: ShardId,
        pending: PendingAssignment,
    ) -> Result<(), SchedulerError> {
        match self
            .store
            .update_shard_status(
                shard_id,
                ShardStatus::Assigned,
                ShardStatus::Pending,
                ShardPatch {
                    agent_id: Some(None),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => {
                let _ = self
                    .registry
                    .remove_assignment(pending.agent_id, shard_id)
                    .await;
                self.forget_assignment(shard_id);
                if let Err(err) = self.queue.admit(pending.entry) {
                    self.metrics.increment_total_errors();
                    tracing::error!("requeue failed: {err}");
                }
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                let shard = self.store.get_shard(shard_id).await?;
                if shard.status == ShardStatus::Running {
                    tracing::debug!(shard_id = %shard_id, "release lost to a concurrent start");
                } else {
                    self.forget_assignment(shard_id);
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Match pending shards to eligible agents until no further pair exists.
    async fn drain_matches(&mut self) {
        if self.draining {
            return;
        }
        for agent in self.registry.eligible_agents() {
            let mut agent = agent;
            loop {
                if !agent.has_capacity() {
                    break;
                }
                let quota = self.config.service_quota;
                let counts = &self.service_counts;
                let container_capable = agent.container_capable;
                let entry = self.queue.pop(&agent.zones, |entry| {
                    (entry.execution != ExecutionKind::Container || container_capable)
                        && quota
                            .map(|quota| {
                                counts.get(&entry.service_id).copied().unwrap_or(0) < quota
                            })
                            .unwrap_or(true)
                });
                let Some(entry) = entry else {
                    break;
                };
                match self.assign(&agent, entry).await {
                    AssignOutcome::Skip => continue,
                    AssignOutcome::AgentUnavailable => break,
                    AssignOutcome::Offered => match self.registry.get(agent.id) {
                        Some(updated) => agent = updated,
                        None => break,
                    },
                }
            }
        }
    }

    /// One matching decision: CAS the shard onto the agent, then offer it.
    async fn assign(&mut self, agent: &Agent, entry: QueuedShard) -> AssignOutcome {
        let started = Instant::now();
        let shard_id = entry.shard_id;

        let mut attempts = 0;
        loop {
            match self
                .store
                .update_shard_status(
                    shard_id,
                    ShardStatus::Pending,
                    ShardStatus::Assigned,
                    ShardPatch {
                        agent_id: Some(Some(agent.id)),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => break,
                Err(StoreError::Conflict(_)) => {
                    self.metrics.increment_conflicts();
                    attempts += 1;
                    let still_pending = self
                        .store
                        .get_shard(shard_id)
                        .await
                        .map(|shard| shard.status == ShardStatus::Pending)
                        .unwrap_or(false);
                    if !still_pending || attempts >= 3 {
                        tracing::warn!(shard_id = %shard_id, "dropping assignment after CAS conflict");
                        return AssignOutcome::Skip;
                    }
                }
                Err(err) if err.is_retriable() && attempts < 3 => {
                    attempts += 1;
                    tracing::warn!(shard_id = %shard_id, "transient store failure while assigning: {err}");
                }
                Err(err) => {
                    self.metrics.increment_total_errors();
                    tracing::error!(shard_id = %shard_id, "assignment failed: {err}");
                    // reconsidered next tick
                    let _ = self.queue.admit(entry);
                    return AssignOutcome::AgentUnavailable;
                }
            }
        }

        if self.registry.add_assignment(agent.id, shard_id).await.is_err() {
            self.revert_assignment(agent.id, entry).await;
            return AssignOutcome::AgentUnavailable;
        }
        self.assigned_services.insert(shard_id, entry.service_id);
        *self.service_counts.entry(entry.service_id).or_default() += 1;

        let offer = ServerFrame::WorkOffer {
            shard_id,
            run_id: entry.run_id,
            shard_index: entry.shard_index,
            shard_count: entry.shard_count,
            plan: entry.plan.clone(),
        };
        if let Err(err) = self.sessions.try_send(agent.id, offer) {
            tracing::warn!(agent_id = %agent.id, "offer not deliverable: {err}");
            let _ = self.registry.remove_assignment(agent.id, shard_id).await;
            self.forget_assignment(shard_id);
            self.revert_assignment(agent.id, entry).await;
            return AssignOutcome::AgentUnavailable;
        }

        let deadline = self.clock.now() + self.config.offer_timeout;
        self.outstanding_offers.insert(
            shard_id,
            PendingAssignment {
                agent_id: agent.id,
                entry,
                deadline,
            },
        );

        self.metrics
            .record_decision(started.elapsed().as_secs_f64());
        tracing::info!(shard_id = %shard_id, agent_id = %agent.id, "work offered");
        AssignOutcome::Offered
    }

    /// Undo a CAS that could not be followed by a deliverable offer.
    async fn revert_assignment(&mut self, agent_id: AgentId, entry: QueuedShard) {
        let shard_id = entry.shard_id;
        let result = self
            .store
            .update_shard_status(
                shard_id,
                ShardStatus::Assigned,
                ShardStatus::Pending,
                ShardPatch {
                    agent_id: Some(None),
                    ..Default::default()
                },
            )
            .await;
        if let Err(err) = result {
            self.metrics.increment_total_errors();
            tracing::error!(shard_id = %shard_id, agent_id = %agent_id, "failed to revert assignment: {err}");
            return;
        }
        if let Err(err) = self.queue.admit(entry) {
            self.metrics.increment_total_errors();
            tracing::error!("requeue failed: {err}");
        }
    }

    fn forget_assignment(&mut self, shard_id: ShardId) {
        if let Some(service_id) = self.assigned_services.remove(&shard_id) {
            if let Some(count) = self.service_counts.get_mut(&service_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.service_counts.remove(&service_id);
                }
            }
        }
    }
}
