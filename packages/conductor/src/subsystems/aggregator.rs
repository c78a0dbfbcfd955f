use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use utils::clock::Clock;
use utils::store::{RunPatch, RunStore, ShardPatch, StoreError};
use utils::telemetry::AggregatorMetrics;

use conductor_types::{
    AgentId, Artifact, Event, LogStream, RunCounters, RunId, RunStatus, Shard, ShardId,
    ShardStatus, TestResult, TestStatus,
};

use crate::subsystems::bus::EventBus;
use crate::subsystems::scheduler::SchedulerEvent;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Everything the aggregator absorbs: per-shard frames forwarded by the
/// session layer, release decisions from the scheduler, and explicit run
/// cancellation. Order within one shard is preserved end to end.
#[derive(Debug)]
pub enum AggregatorEvent {
    ShardStarted {
        shard_id: ShardId,
        agent_id: AgentId,
        ts: DateTime<Utc>,
    },
    Result {
        shard_id: ShardId,
        result: TestResult,
    },
    LogChunk {
        shard_id: ShardId,
        seq: u64,
        stream: LogStream,
        data: String,
    },
    ArtifactUploaded {
        shard_id: ShardId,
        artifact: Artifact,
    },
    ShardFinished {
        shard_id: ShardId,
        status: ShardStatus,
        counters: RunCounters,
        error: Option<String>,
    },
    /// Infrastructure fault on an in-flight shard (agent lost, forced
    /// shutdown). Not retried; the shard ends in `error`.
    ShardInfraFailure {
        shard_id: ShardId,
        error: String,
    },
    ShardCancelled {
        shard_id: ShardId,
        reason: String,
    },
    RunCancelled {
        run_id: RunId,
        reason: String,
    },
    Tick,
}

/// Single-writer derivation of authoritative run state from shard events.
///
/// Every state change writes through the run store before it is published on
/// the event bus, so subscribers never observe a state that is not durable.
/// Duplicate deliveries are no-ops: terminal shards reject transitions,
/// results dedup by id, log chunks by `(shard_id, seq)`.
pub struct RunAggregator {
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    scheduler_tx: mpsc::Sender<SchedulerEvent>,
    metrics: AggregatorMetrics,
    max_test_timeout: Duration,

    /// running runs and their wall-clock deadlines
    run_deadlines: HashMap<RunId, DateTime<Utc>>,
    /// highest log seq seen per in-flight shard
    log_seqs: HashMap<ShardId, u64>,
    /// shard -> run cache so log fan-out avoids a store read per chunk
    shard_runs: HashMap<ShardId, RunId>,
}

impl RunAggregator {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        scheduler_tx: mpsc::Sender<SchedulerEvent>,
        metrics: AggregatorMetrics,
        max_test_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            scheduler_tx,
            metrics,
            max_test_timeout,
            run_deadlines: HashMap::new(),
            log_seqs: HashMap::new(),
            shard_runs: HashMap::new(),
        }
    }

    /// Re-arm a recovered running run's wall-clock deadline.
    pub fn arm_deadline(&mut self, run_id: RunId, deadline: DateTime<Utc>) {
        self.run_deadlines.insert(run_id, deadline);
    }

    /// Runs until the event channel closes.
    #[instrument(skip(self, rx), fields(subsys = "RunAggregator"))]
    pub async fn run(mut self, mut rx: mpsc::Receiver<AggregatorEvent>) {
        while let Some(event) = rx.recv().await {
            self.metrics.increment_events();
            if let Err(err) = self.handle(event).await {
                tracing::error!("aggregator event failed: {err}");
            }
        }
        tracing::debug!("aggregator channel closed");
    }

    async fn handle(&mut self, event: AggregatorEvent) -> Result<(), AggregatorError> {
        match event {
            AggregatorEvent::ShardStarted {
                shard_id,
                agent_id,
                ts,
            } => self.shard_started(shard_id, agent_id, ts).await,
            AggregatorEvent::Result { shard_id, result } => {
                self.result(shard_id, result).await
            }
            AggregatorEvent::LogChunk {
                shard_id,
                seq,
                stream,
                data,
            } => self.log_chunk(shard_id, seq, stream, data).await,
            AggregatorEvent::ArtifactUploaded { shard_id, artifact } => {
                self.artifact(shard_id, artifact).await
            }
            AggregatorEvent::ShardFinished {
                shard_id,
                status,
                counters,
                error,
            } => self.shard_finished(shard_id, status, counters, error).await,
            AggregatorEvent::ShardInfraFailure { shard_id, error } => {
                self.shard_terminal(shard_id, ShardStatus::Error, Some(error))
                    .await
            }
            AggregatorEvent::ShardCancelled { shard_id, reason } => {
                self.shard_terminal(shard_id, ShardStatus::Cancelled, Some(reason))
                    .await
            }
            AggregatorEvent::RunCancelled { run_id, reason } => {
                self.run_cancelled(run_id, reason).await
            }
            AggregatorEvent::Tick => self.tick().await,
        }
    }

    async fn shard_started(
        &mut self,
        shard_id: ShardId,
        agent_id: AgentId,
        ts: DateTime<Utc>,
    ) -> Result<(), AggregatorError> {
        let shard = match self.live_shard(shard_id).await? {
            Some(shard) => shard,
            None => return Ok(()),
        };

        if shard.status != ShardStatus::Assigned || shard.agent_id != Some(agent_id) {
            // released, reassigned, or an agent speaking out of turn
            self.metrics.increment_invalid_transitions();
            tracing::debug!(shard_id = %shard_id, status = %shard.status, "dropping stale ShardStarted");
            return Ok(());
        }

        let shard = self
            .store
            .update_shard_status(
                shard_id,
                ShardStatus::Assigned,
                ShardStatus::Running,
                ShardPatch {
                    started_at: Some(ts),
                    ..Default::default()
                },
            )
            .await?;
        self.shard_runs.insert(shard_id, shard.run_id);

        // first shard to start moves the run to running and arms its deadline
        let run = self.store.get_run(shard.run_id).await?;
        if run.status == RunStatus::Pending {
            let now = self.clock.now();
            let run = self
                .store
                .update_run_status(
                    run.id,
                    RunStatus::Pending,
                    RunStatus::Running,
                    RunPatch {
                        started_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            self.run_deadlines.insert(run.id, now + self.max_test_timeout);
            self.bus.publish(&Event::RunUpdate { run });
        }

        let _ = self
            .scheduler_tx
            .send(SchedulerEvent::ShardStarted { shard_id, agent_id })
            .await;
        Ok(())
    }

    async fn result(
        &mut self,
        shard_id: ShardId,
        result: TestResult,
    ) -> Result<(), AggregatorError> {
        let shard = match self.live_shard(shard_id).await? {
            Some(shard) => shard,
            None => return Ok(()),
        };

        if self.store.append_result(result.clone()).await? {
            self.bus.publish(&Event::TestResult {
                run_id: shard.run_id,
                result,
            });
        } else {
            self.metrics.increment_duplicate();
        }
        Ok(())
    }

    async fn log_chunk(
        &mut self,
        shard_id: ShardId,
        seq: u64,
        stream: LogStream,
        data: String,
    ) -> Result<(), AggregatorError> {
        let run_id = match self.shard_runs.get(&shard_id) {
            Some(run_id) => *run_id,
            None => match self.live_shard(shard_id).await? {
                Some(shard) => {
                    self.shard_runs.insert(shard_id, shard.run_id);
                    shard.run_id
                }
                None => return Ok(()),
            },
        };

        // chunks are totally ordered per shard; anything at or below the
        // watermark is a replay
        if let Some(last) = self.log_seqs.get(&shard_id) {
            if seq <= *last {
                self.metrics.increment_duplicate();
                return Ok(());
            }
        }
        self.log_seqs.insert(shard_id, seq);

        self.bus.publish(&Event::LogChunk {
            run_id,
            shard_id,
            seq,
            stream,
            data,
        });
        Ok(())
    }

    async fn artifact(
        &mut self,
        shard_id: ShardId,
        artifact: Artifact,
    ) -> Result<(), AggregatorError> {
        if self.live_shard(shard_id).await?.is_none() {
            return Ok(());
        }
        if !self.store.append_artifact(artifact).await? {
            self.metrics.increment_duplicate();
        }
        Ok(())
    }

    async fn shard_finished(
        &mut self,
        shard_id: ShardId,
        status: ShardStatus,
        reported: RunCounters,
        error: Option<String>,
    ) -> Result<(), AggregatorError> {
        if !status.is_terminal() {
            self.metrics.increment_invalid_transitions();
            tracing::warn!(shard_id = %shard_id, %status, "agent reported a non-terminal shard status");
            return Ok(());
        }
        let shard = match self.live_shard(shard_id).await? {
            Some(shard) => shard,
            None => return Ok(()),
        };
        if shard.status != ShardStatus::Running {
            self.metrics.increment_invalid_transitions();
            tracing::debug!(shard_id = %shard_id, status = %shard.status, "dropping ShardFinished before ShardStarted");
            return Ok(());
        }

        let counters = self.derived_counters(&shard).await?;
        if counters != reported {
            tracing::debug!(
                shard_id = %shard_id,
                derived = ?counters,
                reported = ?reported,
                "agent counters disagree with recorded results"
            );
        }

        self.finish_shard(shard, status, counters, error).await
    }

    /// Terminal transition driven by the control plane itself rather than the
    /// agent: infrastructure failure or cancellation.
    async fn shard_terminal(
        &mut self,
        shard_id: ShardId,
        status: ShardStatus,
        error: Option<String>,
    ) -> Result<(), AggregatorError> {
        let shard = match self.live_shard(shard_id).await? {
            Some(shard) => shard,
            None => return Ok(()),
        };
        let counters = self.derived_counters(&shard).await?;
        self.finish_shard(shard, status, counters, error).await
    }

    async fn finish_shard(
        &mut self,
        shard: Shard,
        status: ShardStatus,
        counters: RunCounters,
        error: Option<String>,
    ) -> Result<(), AggregatorError> {
        if !shard.status.can_transition(status) {
            self.metrics.increment_invalid_transitions();
            tracing::warn!(
                shard_id = %shard.id,
                from = %shard.status,
                to = %status,
                "rejected shard transition"
            );
            return Ok(());
        }

        let shard = self
            .store
            .update_shard_status(
                shard.id,
                shard.status,
                status,
                ShardPatch {
                    finished_at: Some(self.clock.now()),
                    counters: Some(counters),
                    error,
                    ..Default::default()
                },
            )
            .await?;

        self.log_seqs.remove(&shard.id);
        self.shard_runs.remove(&shard.id);

        // counters are recomputed on every shard-terminal event
        let run = self.store.recompute_run_counters(shard.run_id).await?;

        let _ = self
            .scheduler_tx
            .send(SchedulerEvent::ShardTerminal {
                shard_id: shard.id,
                run_id: shard.run_id,
                agent_id: shard.agent_id,
            })
            .await;

        self.bus.publish(&Event::RunUpdate { run: run.clone() });
        self.maybe_finalize_run(run.id).await
    }

    /// Classify and close the run once every shard is terminal.
    async fn maybe_finalize_run(&mut self, run_id: RunId) -> Result<(), AggregatorError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let shards = self.store.list_shards(run_id).await?;
        if shards.is_empty() || !shards.iter().all(|shard| shard.status.is_terminal()) {
            return Ok(());
        }

        let results = self.store.list_results(run_id).await?;
        let blocking_result_failure = results
            .iter()
            .any(|r| r.status == TestStatus::Fail && !r.allow_failure && !r.quarantined);
        let has_failed = shards
            .iter()
            .any(|s| matches!(s.status, ShardStatus::Failed | ShardStatus::Timeout));
        let has_error = shards.iter().any(|s| s.status == ShardStatus::Error);
        let has_cancelled = shards.iter().any(|s| s.status == ShardStatus::Cancelled);

        // failed dominates error; cancellation only classifies the run when
        // nothing failed or errored
        let to = if has_failed || blocking_result_failure {
            RunStatus::Failed
        } else if has_error {
            RunStatus::Error
        } else if has_cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Passed
        };

        if !run.status.can_transition(to) {
            self.metrics.increment_invalid_transitions();
            tracing::warn!(run_id = %run_id, from = %run.status, to = %to, "rejected run transition");
            return Ok(());
        }

        let error = match to {
            RunStatus::Error => Some(
                shards
                    .iter()
                    .filter_map(|s| s.error.clone())
                    .next()
                    .unwrap_or_else(|| "shard infrastructure failure".to_string()),
            ),
            _ => None,
        };

        let run = self
            .store
            .update_run_status(
                run_id,
                run.status,
                to,
                RunPatch {
                    finished_at: Some(self.clock.now()),
                    error,
                    ..Default::default()
                },
            )
            .await?;

        self.run_deadlines.remove(&run_id);
        self.metrics.increment_terminal_runs();
        tracing::info!(run_id = %run_id, status = %to, total = run.counters.total, "run finished");
        self.bus.publish(&Event::RunUpdate { run });
        Ok(())
    }

    async fn run_cancelled(
        &mut self,
        run_id: RunId,
        reason: String,
    ) -> Result<(), AggregatorError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let run = self
            .store
            .update_run_status(
                run_id,
                run.status,
                RunStatus::Cancelled,
                RunPatch {
                    finished_at: Some(self.clock.now()),
                    error: Some(reason),
                    ..Default::default()
                },
            )
            .await?;
        self.run_deadlines.remove(&run_id);
        self.metrics.increment_terminal_runs();
        self.bus.publish(&Event::RunUpdate { run });
        Ok(())
    }

    /// Enforce run-level wall-clock deadlines.
    async fn tick(&mut self) -> Result<(), AggregatorError> {
        let now = self.clock.now();
        let expired: Vec<RunId> = self
            .run_deadlines
            .iter()
            .filter(|(_, deadline)| now > **deadline)
            .map(|(run_id, _)| *run_id)
            .collect();

        for run_id in expired {
            self.run_deadlines.remove(&run_id);
            let run = self.store.get_run(run_id).await?;
            if run.status != RunStatus::Running {
                continue;
            }
            let run = self
                .store
                .update_run_status(
                    run_id,
                    RunStatus::Running,
                    RunStatus::Timeout,
                    RunPatch {
                        finished_at: Some(now),
                        error: Some("run exceeded max_test_timeout".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            self.metrics.increment_terminal_runs();
            tracing::warn!(run_id = %run_id, "run timed out");
            self.bus.publish(&Event::RunUpdate { run });

            // in-flight shards are cancelled via the scheduler
            let _ = self
                .scheduler_tx
                .send(SchedulerEvent::CancelShardsForRun {
                    run_id,
                    reason: "run timeout".to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Fetch a shard unless it is already terminal; late frames for terminal
    /// shards are dropped with a counter increment.
    async fn live_shard(&mut self, shard_id: ShardId) -> Result<Option<Shard>, AggregatorError> {
        match self.store.get_shard(shard_id).await {
            Ok(shard) if shard.status.is_terminal() => {
                self.metrics.increment_late_frames();
                Ok(None)
            }
            Ok(shard) => Ok(Some(shard)),
            Err(StoreError::NotFound(_)) => {
                self.metrics.increment_invalid_transitions();
                tracing::warn!(shard_id = %shard_id, "event for unknown shard");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Shard counters derived from the results actually recorded for it.
    /// Quarantined failures count as skipped in the aggregate while the
    /// result itself keeps its real status.
    async fn derived_counters(&self, shard: &Shard) -> Result<RunCounters, AggregatorError> {
        let results = self.store.list_results(shard.run_id).await?;
        let mut counters = RunCounters::default();
        for result in results.iter().filter(|r| r.shard_id == shard.id) {
            counters.total += 1;
            match result.status {
                TestStatus::Pass => counters.passed += 1,
                TestStatus::Skip => counters.skipped += 1,
                TestStatus::Fail if result.quarantined => counters.skipped += 1,
                TestStatus::Fail => counters.failed += 1,
                TestStatus::Error => counters.errored += 1,
            }
        }
        Ok(counters)
    }
}
