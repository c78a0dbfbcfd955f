use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conductor_types::{
    Agent, AgentId, AgentStatus, Artifact, ArtifactId, Page, PageRequest, ResultId, Run,
    RunCounters, RunFilter, RunId, RunStatus, Schedule, ScheduleId, Service, ServiceId, Shard,
    ShardId, ShardStatus, TestResult,
};

use super::{RunPatch, RunStore, ShardPatch, StoreError};

/// In-memory [`RunStore`]. The store used by tests and the default binary
/// profile; a relational implementation lives behind the same trait in the
/// deployment repo.
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, Run>,
    shards: HashMap<ShardId, Shard>,
    run_shards: HashMap<RunId, Vec<ShardId>>,
    results: HashMap<ResultId, TestResult>,
    run_results: HashMap<RunId, Vec<ResultId>>,
    artifacts: HashMap<ArtifactId, Artifact>,
    run_artifacts: HashMap<RunId, Vec<ArtifactId>>,
    agents: HashMap<AgentId, Agent>,
    services: HashMap<ServiceId, Service>,
    schedules: HashMap<ScheduleId, Schedule>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Transient("store lock poisoned".to_string())
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} exists", run.id)));
        }
        inner.run_shards.entry(run.id).or_default();
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Run, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run {}", id)))
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<Page<Run>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| {
                filter
                    .service_id
                    .map(|service_id| run.service_id == service_id)
                    .unwrap_or(true)
                    && filter
                        .status
                        .map(|status| run.status == status)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        // newest first, stable under equal timestamps
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = runs.len();
        let items = runs
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(Page {
            items,
            total,
            offset: page.offset,
        })
    }

    async fn update_run_status(
        &self,
        id: RunId,
        from: RunStatus,
        to: RunStatus,
        patch: RunPatch,
    ) -> Result<Run, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", id)))?;
        if run.status != from {
            return Err(StoreError::Conflict(format!(
                "run {} is {}, expected {}",
                id, run.status, from
            )));
        }
        run.status = to;
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            run.finished_at = Some(finished_at);
        }
        if let Some(counters) = patch.counters {
            run.counters = counters;
        }
        if let Some(error) = patch.error {
            run.error = Some(error);
        }
        Ok(run.clone())
    }

    async fn create_shards(
        &self,
        run_id: RunId,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Shard>, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if !inner.runs.contains_key(&run_id) {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        if !inner
            .run_shards
            .get(&run_id)
            .map(|ids| ids.is_empty())
            .unwrap_or(true)
        {
            return Err(StoreError::Conflict(format!(
                "run {} already has shards",
                run_id
            )));
        }

        let mut created = Vec::with_capacity(count as usize);
        for shard_index in 0..count {
            let shard = Shard {
                id: ShardId::generate(),
                run_id,
                shard_index,
                status: ShardStatus::Pending,
                agent_id: None,
                created_at: now,
                started_at: None,
                finished_at: None,
                counters: Default::default(),
                error: None,
            };
            inner.run_shards.entry(run_id).or_default().push(shard.id);
            inner.shards.insert(shard.id, shard.clone());
            created.push(shard);
        }
        Ok(created)
    }

    async fn get_shard(&self, id: ShardId) -> Result<Shard, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .shards
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("shard {}", id)))
    }

    async fn list_shards(&self, run_id: RunId) -> Result<Vec<Shard>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let ids = inner
            .run_shards
            .get(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.shards.get(id).cloned())
            .collect())
    }

    async fn update_shard_status(
        &self,
        id: ShardId,
        from: ShardStatus,
        to: ShardStatus,
        patch: ShardPatch,
    ) -> Result<Shard, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let shard = inner
            .shards
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("shard {}", id)))?;
        if shard.status != from {
            return Err(StoreError::Conflict(format!(
                "shard {} is {}, expected {}",
                id, shard.status, from
            )));
        }
        shard.status = to;
        if let Some(agent_id) = patch.agent_id {
            shard.agent_id = agent_id;
        }
        if let Some(started_at) = patch.started_at {
            shard.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            shard.finished_at = Some(finished_at);
        }
        if let Some(counters) = patch.counters {
            shard.counters = counters;
        }
        if let Some(error) = patch.error {
            shard.error = Some(error);
        }
        Ok(shard.clone())
    }

    async fn append_result(&self, result: TestResult) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.results.contains_key(&result.id) {
            return Ok(false);
        }
        if !inner.shards.contains_key(&result.shard_id) {
            return Err(StoreError::NotFound(format!("shard {}", result.shard_id)));
        }
        inner
            .run_results
            .entry(result.run_id)
            .or_default()
            .push(result.id);
        inner.results.insert(result.id, result);
        Ok(true)
    }

    async fn append_artifact(&self, artifact: Artifact) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.artifacts.contains_key(&artifact.id) {
            return Ok(false);
        }
        inner
            .run_artifacts
            .entry(artifact.run_id)
            .or_default()
            .push(artifact.id);
        inner.artifacts.insert(artifact.id, artifact);
        Ok(true)
    }

    async fn list_results(&self, run_id: RunId) -> Result<Vec<TestResult>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .run_results
            .get(&run_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.results.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_artifacts(&self, run_id: RunId) -> Result<Vec<Artifact>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .run_artifacts
            .get(&run_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.artifacts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recompute_run_counters(&self, run_id: RunId) -> Result<Run, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let shard_ids = inner
            .run_shards
            .get(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?
            .clone();
        let mut counters = RunCounters::default();
        for shard_id in &shard_ids {
            if let Some(shard) = inner.shards.get(shard_id) {
                counters.add(&shard.counters);
            }
        }
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?;
        run.counters = counters;
        Ok(run.clone())
    }

    async fn list_recoverable_shards(&self) -> Result<Vec<Shard>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .shards
            .values()
            .filter(|shard| {
                shard.status == ShardStatus::Pending
                    || (shard.status == ShardStatus::Assigned && shard.started_at.is_none())
            })
            .cloned()
            .collect())
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {}", id)))
    }

    async fn list_agents(
        &self,
        zone: Option<&str>,
        status: Option<AgentStatus>,
    ) -> Result<Vec<Agent>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .agents
            .values()
            .filter(|agent| {
                zone.map(|zone| agent.in_zone(zone)).unwrap_or(true)
                    && status.map(|status| agent.status == status).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn delete_agent(&self, id: AgentId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.agents.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("agent {}", id)));
        }
        // weak relation: the shard survives, the assignment does not
        for shard in inner.shards.values_mut() {
            if shard.agent_id == Some(id) {
                shard.agent_id = None;
            }
        }
        Ok(())
    }

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.services.insert(service.id, service);
        Ok(())
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .services
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("service {}", id)))
    }

    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.services.values().cloned().collect())
    }

    async fn upsert_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.schedules.values().cloned().collect())
    }

    async fn set_schedule_next_run(
        &self,
        id: ScheduleId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let schedule = inner
            .schedules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {}", id)))?;
        schedule.next_run_at = next_run_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    fn run(id: u128) -> Run {
        Run {
            id: RunId::from_u128(id),
            service_id: ServiceId::from_u128(1),
            git_ref: "main".into(),
            git_sha: "abc".into(),
            trigger: conductor_types::TriggerKind::Manual,
            triggered_by: None,
            priority: 10,
            status: RunStatus::Pending,
            execution: conductor_types::ExecutionKind::Process,
            shard_count: 2,
            test_filter: None,
            created_at: now(),
            started_at: None,
            finished_at: None,
            counters: RunCounters::default(),
            error: None,
        }
    }

    fn agent(id: u128) -> Agent {
        Agent {
            id: AgentId::from_u128(id),
            name: format!("agent-{id}"),
            status: AgentStatus::Idle,
            zones: BTreeSet::from(["z1".to_string()]),
            max_parallel: 1,
            container_capable: false,
            version: "1.0.0".into(),
            last_heartbeat: now(),
            registered_at: now(),
            assignments: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn shard_cas_rejects_stale_predicates() {
        let store = MemoryRunStore::new();
        store.create_run(run(1)).await.unwrap();
        let shards = store
            .create_shards(RunId::from_u128(1), 2, now())
            .await
            .unwrap();

        let agent_id = AgentId::from_u128(9);
        store
            .update_shard_status(
                shards[0].id,
                ShardStatus::Pending,
                ShardStatus::Assigned,
                ShardPatch {
                    agent_id: Some(Some(agent_id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // a second assignment against the same predicate loses
        let err = store
            .update_shard_status(
                shards[0].id,
                ShardStatus::Pending,
                ShardStatus::Assigned,
                ShardPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let shard = store.get_shard(shards[0].id).await.unwrap();
        assert_eq!(shard.status, ShardStatus::Assigned);
        assert_eq!(shard.agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn recompute_sums_shard_counters() {
        let store = MemoryRunStore::new();
        store.create_run(run(1)).await.unwrap();
        let shards = store
            .create_shards(RunId::from_u128(1), 2, now())
            .await
            .unwrap();

        for (i, shard) in shards.iter().enumerate() {
            store
                .update_shard_status(
                    shard.id,
                    ShardStatus::Pending,
                    ShardStatus::Cancelled,
                    ShardPatch {
                        counters: Some(RunCounters {
                            total: (i + 1) as u64,
                            passed: (i + 1) as u64,
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let run = store.recompute_run_counters(RunId::from_u128(1)).await.unwrap();
        assert_eq!(run.counters.total, 3);
        assert_eq!(run.counters.passed, 3);
    }

    #[tokio::test]
    async fn recoverable_shards_are_pending_or_unstarted() {
        let store = MemoryRunStore::new();
        store.create_run(run(1)).await.unwrap();
        let shards = store
            .create_shards(RunId::from_u128(1), 3, now())
            .await
            .unwrap();

        // one assigned but unstarted, one running
        store
            .update_shard_status(
                shards[0].id,
                ShardStatus::Pending,
                ShardStatus::Assigned,
                ShardPatch::default(),
            )
            .await
            .unwrap();
        store
            .update_shard_status(
                shards[1].id,
                ShardStatus::Pending,
                ShardStatus::Assigned,
                ShardPatch::default(),
            )
            .await
            .unwrap();
        store
            .update_shard_status(
                shards[1].id,
                ShardStatus::Assigned,
                ShardStatus::Running,
                ShardPatch {
                    started_at: Some(now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let recoverable = store.list_recoverable_shards().await.unwrap();
        let ids: Vec<ShardId> = recoverable.iter().map(|s| s.id).collect();
        assert_eq!(recoverable.len(), 2);
        assert!(ids.contains(&shards[0].id));
        assert!(ids.contains(&shards[2].id));
    }

    #[tokio::test]
    async fn append_result_dedups_by_id() {
        let store = MemoryRunStore::new();
        store.create_run(run(1)).await.unwrap();
        let shards = store
            .create_shards(RunId::from_u128(1), 1, now())
            .await
            .unwrap();

        let result = TestResult {
            id: ResultId::from_u128(7),
            run_id: RunId::from_u128(1),
            shard_id: shards[0].id,
            name: "test_a".into(),
            suite: None,
            status: conductor_types::TestStatus::Pass,
            duration_ms: 1,
            stdout: None,
            stderr: None,
            error: None,
            retry_count: 0,
            allow_failure: false,
            quarantined: false,
        };
        assert!(store.append_result(result.clone()).await.unwrap());
        assert!(!store.append_result(result).await.unwrap());
        assert_eq!(store.list_results(RunId::from_u128(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_an_agent_nulls_shard_assignments() {
        let store = MemoryRunStore::new();
        store.create_run(run(1)).await.unwrap();
        let shards = store
            .create_shards(RunId::from_u128(1), 1, now())
            .await
            .unwrap();
        store.upsert_agent(agent(9)).await.unwrap();
        store
            .update_shard_status(
                shards[0].id,
                ShardStatus::Pending,
                ShardStatus::Assigned,
                ShardPatch {
                    agent_id: Some(Some(AgentId::from_u128(9))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.delete_agent(AgentId::from_u128(9)).await.unwrap();

        let shard = store.get_shard(shards[0].id).await.unwrap();
        assert_eq!(shard.agent_id, None);
        assert_eq!(shard.status, ShardStatus::Assigned);
    }

    #[tokio::test]
    async fn list_runs_filters_and_pages() {
        let store = MemoryRunStore::new();
        for i in 1..=5 {
            let mut r = run(i);
            r.created_at = Utc.timestamp_opt(1_000 + i as i64, 0).unwrap();
            store.create_run(r).await.unwrap();
        }

        let page = store
            .list_runs(
                &RunFilter::default(),
                PageRequest {
                    offset: 0,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        // newest first
        assert_eq!(page.items[0].id, RunId::from_u128(5));

        let filtered = store
            .list_runs(
                &RunFilter {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert!(filtered.items.is_empty());
    }
}
