use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{AgentId, ShardId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Registering,
    Idle,
    Busy,
    /// No new work is offered, but event streams for in-flight shards are
    /// still accepted.
    Draining,
    Offline,
}

/// A remote worker process that executes shards and streams events back.
///
/// Assignments are shard ids, never shard references; the shard side of the
/// relation lives in the run store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    /// Network zones this agent can reach.
    pub zones: BTreeSet<String>,
    /// Maximum concurrent shards. Always >= 1.
    pub max_parallel: u32,
    pub container_capable: bool,
    pub version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub assignments: BTreeSet<ShardId>,
}

impl Agent {
    /// Offers outstanding plus shards running; the scheduler never lets this
    /// exceed `max_parallel`.
    pub fn load(&self) -> u32 {
        self.assignments.len() as u32
    }

    pub fn has_capacity(&self) -> bool {
        self.load() < self.max_parallel
    }

    pub fn in_zone(&self, zone: &str) -> bool {
        self.zones.contains(zone)
    }
}
