pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use conductor_types::{
    Agent, AgentId, AgentStatus, Artifact, Page, PageRequest, Run, RunCounters, RunFilter, RunId,
    RunStatus, Schedule, ScheduleId, Service, ServiceId, Shard, ShardId, ShardStatus, TestResult,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The conditional update's predicate did not match the stored value.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retriable I/O-class failure.
    #[error("transient store failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Fields applied alongside a shard status transition. `agent_id` uses the
/// outer Option as "change or leave", the inner as the new value, so an
/// assignment can be cleared in the same CAS that releases the shard.
#[derive(Clone, Debug, Default)]
pub struct ShardPatch {
    pub agent_id: Option<Option<AgentId>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: Option<RunCounters>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RunPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: Option<RunCounters>,
    pub error: Option<String>,
}

/// The persisted view of runs, shards, results, artifacts, agents, services,
/// and schedules. The single source of truth across restarts: the in-memory
/// queue and registry are rebuilt from here at startup.
///
/// Status updates are compare-and-swap: callers state the status they believe
/// the entity has, and a mismatch returns [`StoreError::Conflict`]. The
/// scheduler depends on this to never double-dispatch a shard.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<(), StoreError>;
    async fn get_run(&self, id: RunId) -> Result<Run, StoreError>;
    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<Page<Run>, StoreError>;
    async fn update_run_status(
        &self,
        id: RunId,
        from: RunStatus,
        to: RunStatus,
        patch: RunPatch,
    ) -> Result<Run, StoreError>;

    /// Create `count` shards for a run, indexed `0..count`, all pending.
    async fn create_shards(
        &self,
        run_id: RunId,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Shard>, StoreError>;
    async fn get_shard(&self, id: ShardId) -> Result<Shard, StoreError>;
    async fn list_shards(&self, run_id: RunId) -> Result<Vec<Shard>, StoreError>;
    async fn update_shard_status(
        &self,
        id: ShardId,
        from: ShardStatus,
        to: ShardStatus,
        patch: ShardPatch,
    ) -> Result<Shard, StoreError>;

    /// Append-only; returns false when the result id was already recorded
    /// (replayed frame).
    async fn append_result(&self, result: TestResult) -> Result<bool, StoreError>;
    async fn append_artifact(&self, artifact: Artifact) -> Result<bool, StoreError>;
    async fn list_results(&self, run_id: RunId) -> Result<Vec<TestResult>, StoreError>;
    async fn list_artifacts(&self, run_id: RunId) -> Result<Vec<Artifact>, StoreError>;

    /// Re-derive the run's aggregate counters as the sum over its shards.
    async fn recompute_run_counters(&self, run_id: RunId) -> Result<Run, StoreError>;

    /// Shards that must be re-queued after a restart: `pending`, plus
    /// `assigned` ones that never produced a start event.
    async fn list_recoverable_shards(&self) -> Result<Vec<Shard>, StoreError>;

    async fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError>;
    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError>;
    async fn list_agents(
        &self,
        zone: Option<&str>,
        status: Option<AgentStatus>,
    ) -> Result<Vec<Agent>, StoreError>;
    /// Deleting an agent nulls `agent_id` on its shards but preserves them.
    async fn delete_agent(&self, id: AgentId) -> Result<(), StoreError>;

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError>;
    async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError>;
    async fn list_services(&self) -> Result<Vec<Service>, StoreError>;

    async fn upsert_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;
    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;
    async fn set_schedule_next_run(
        &self,
        id: ScheduleId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}
