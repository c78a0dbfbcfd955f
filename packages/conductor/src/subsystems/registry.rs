use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use thiserror::Error;
use tracing::instrument;

use utils::clock::Clock;
use utils::store::{RunStore, StoreError};
use utils::telemetry::RegistryMetrics;

use conductor_types::{Agent, AgentId, AgentStatus, Event, HeartbeatTelemetry, ShardId};

use crate::subsystems::bus::EventBus;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("agent {0} is not registered")]
    UnknownAgent(AgentId),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Fields an agent publishes when it registers.
#[derive(Clone, Debug)]
pub struct Registration {
    pub agent_id: AgentId,
    pub name: String,
    pub zones: BTreeSet<String>,
    pub max_parallel: u32,
    pub container_capable: bool,
    pub version: String,
}

/// Tracks connected agents, their capabilities, health, and assignments.
///
/// Pure state plus the run store write-through; liveness decisions are made by
/// the sweep task in the control plane, and session teardown by the session
/// manager, both of which call back in here.
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    metrics: RegistryMetrics,
}

impl AgentRegistry {
    pub fn new(
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        metrics: RegistryMetrics,
    ) -> Self {
        Self {
            agents: DashMap::new(),
            store,
            clock,
            bus,
            metrics,
        }
    }

    /// Register or re-register an agent. A reconnect within the heartbeat
    /// window keeps the agent's assignment set so replayed frames still land;
    /// an agent coming back from offline starts clean.
    #[instrument(skip(self, registration), fields(subsys = "AgentRegistry", agent_id = %registration.agent_id))]
    pub async fn register(&self, registration: Registration) -> Result<Agent, RegistryError> {
        let now = self.clock.now();

        let previous = self.agents.get(&registration.agent_id).map(|a| a.value().clone());
        let (registered_at, assignments) = match previous {
            Some(prev) if prev.status != AgentStatus::Offline => {
                (prev.registered_at, prev.assignments)
            }
            _ => {
                self.metrics.increment_connected();
                (now, BTreeSet::new())
            }
        };

        let max_parallel = registration.max_parallel.max(1);
        let status = if assignments.is_empty() {
            AgentStatus::Idle
        } else {
            AgentStatus::Busy
        };
        let agent = Agent {
            id: registration.agent_id,
            name: registration.name,
            status,
            zones: registration.zones,
            max_parallel,
            container_capable: registration.container_capable,
            version: registration.version,
            last_heartbeat: now,
            registered_at,
            assignments,
        };

        self.agents.insert(agent.id, agent.clone());
        self.store.upsert_agent(agent.clone()).await?;
        self.bus.publish(&Event::AgentUpdate {
            agent: agent.clone(),
        });

        tracing::info!(
            zones = ?agent.zones,
            max_parallel = agent.max_parallel,
            "Agent registered"
        );
        Ok(agent)
    }

    pub fn heartbeat(
        &self,
        agent_id: AgentId,
        telemetry: HeartbeatTelemetry,
    ) -> Result<(), RegistryError> {
        let mut agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::UnknownAgent(agent_id))?;
        agent.last_heartbeat = self.clock.now();
        self.metrics.increment_heartbeats();
        tracing::trace!(
            agent_id = %agent_id,
            active_jobs = telemetry.active_jobs,
            cpu = telemetry.cpu_percent,
            "heartbeat"
        );
        Ok(())
    }

    pub fn get(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.get(&agent_id).map(|a| a.value().clone())
    }

    /// Agents the scheduler may offer work to, in deterministic order:
    /// least-loaded first, then earliest registered, then id.
    pub fn eligible_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|entry| {
                matches!(entry.status, AgentStatus::Idle | AgentStatus::Busy)
                    && entry.has_capacity()
            })
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| {
            a.load()
                .cmp(&b.load())
                .then(a.registered_at.cmp(&b.registered_at))
                .then(a.id.cmp(&b.id))
        });
        agents
    }

    pub async fn add_assignment(
        &self,
        agent_id: AgentId,
        shard_id: ShardId,
    ) -> Result<(), RegistryError> {
        let agent = {
            let mut agent = self
                .agents
                .get_mut(&agent_id)
                .ok_or(RegistryError::UnknownAgent(agent_id))?;
            agent.assignments.insert(shard_id);
            if agent.status == AgentStatus::Idle {
                agent.status = AgentStatus::Busy;
            }
            agent.clone()
        };
        self.store.upsert_agent(agent.clone()).await?;
        self.bus.publish(&Event::AgentUpdate { agent });
        Ok(())
    }

    pub async fn remove_assignment(
        &self,
        agent_id: AgentId,
        shard_id: ShardId,
    ) -> Result<(), RegistryError> {
        let agent = {
            let mut agent = self
                .agents
                .get_mut(&agent_id)
                .ok_or(RegistryError::UnknownAgent(agent_id))?;
            agent.assignments.remove(&shard_id);
            if agent.status == AgentStatus::Busy && agent.assignments.is_empty() {
                agent.status = AgentStatus::Idle;
            }
            agent.clone()
        };
        self.store.upsert_agent(agent.clone()).await?;
        self.bus.publish(&Event::AgentUpdate { agent });
        Ok(())
    }

    /// Stop offering new work to this agent; in-flight shards keep streaming.
    #[instrument(skip(self), fields(subsys = "AgentRegistry"))]
    pub async fn drain(&self, agent_id: AgentId) -> Result<(), RegistryError> {
        let agent = {
            let mut agent = self
                .agents
                .get_mut(&agent_id)
                .ok_or(RegistryError::UnknownAgent(agent_id))?;
            agent.status = AgentStatus::Draining;
            agent.clone()
        };
        self.store.upsert_agent(agent.clone()).await?;
        self.bus.publish(&Event::AgentUpdate { agent });
        Ok(())
    }

    pub async fn drain_all(&self) -> Result<(), RegistryError> {
        let ids: Vec<AgentId> = self.agents.iter().map(|a| a.id).collect();
        for agent_id in ids {
            if let Some(agent) = self.agents.get(&agent_id) {
                if agent.status == AgentStatus::Offline {
                    continue;
                }
            }
            self.drain(agent_id).await?;
        }
        Ok(())
    }

    /// Transition an agent offline, returning the shard ids it was holding so
    /// the scheduler can release them.
    #[instrument(skip(self), fields(subsys = "AgentRegistry"))]
    pub async fn mark_offline(&self, agent_id: AgentId) -> Result<Vec<ShardId>, RegistryError> {
        let (agent, released) = {
            let mut agent = self
                .agents
                .get_mut(&agent_id)
                .ok_or(RegistryError::UnknownAgent(agent_id))?;
            if agent.status == AgentStatus::Offline {
                return Ok(Vec::new());
            }
            let released: Vec<ShardId> = agent.assignments.iter().copied().collect();
            agent.assignments.clear();
            agent.status = AgentStatus::Offline;
            (agent.clone(), released)
        };
        self.metrics.decrement_connected();
        self.store.upsert_agent(agent.clone()).await?;
        self.bus.publish(&Event::AgentUpdate { agent });
        Ok(released)
    }

    /// Agents whose heartbeat is older than the timeout. The sweep task turns
    /// each of these into an agent-loss event; the scheduler then takes them
    /// offline and releases their work.
    pub fn expired_agents(&self, heartbeat_timeout: Duration) -> Vec<AgentId> {
        let now = self.clock.now();
        let expired: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|agent| {
                agent.status != AgentStatus::Offline
                    && now - agent.last_heartbeat > heartbeat_timeout
            })
            .map(|agent| agent.id)
            .collect();
        for agent_id in &expired {
            tracing::warn!(agent_id = %agent_id, "agent heartbeat expired");
            self.metrics.increment_expired();
        }
        expired
    }

    pub fn agent_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|agent| agent.status != AgentStatus::Offline)
            .count()
    }
}
