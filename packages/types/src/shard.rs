use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{AgentId, RunCounters, RunId, ShardId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Pending,
    Assigned,
    Running,
    Passed,
    Failed,
    Error,
    Timeout,
    Cancelled,
}

impl ShardStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShardStatus::Passed
                | ShardStatus::Failed
                | ShardStatus::Error
                | ShardStatus::Timeout
                | ShardStatus::Cancelled
        )
    }

    /// Shard transitions are monotone with one deliberate exception:
    /// `assigned -> pending` is the reassignment path, taken when an agent is
    /// lost (or refuses the offer) before the shard produced any event.
    pub fn can_transition(self, to: ShardStatus) -> bool {
        use ShardStatus::*;
        match (self, to) {
            (Pending, Assigned) => true,
            (Pending, Cancelled) | (Pending, Error) | (Pending, Timeout) => true,
            (Assigned, Running) => true,
            (Assigned, Pending) => true,
            (Assigned, Error) | (Assigned, Timeout) | (Assigned, Cancelled) => true,
            (Running, Passed)
            | (Running, Failed)
            | (Running, Error)
            | (Running, Timeout)
            | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShardStatus::Pending => "pending",
            ShardStatus::Assigned => "assigned",
            ShardStatus::Running => "running",
            ShardStatus::Passed => "passed",
            ShardStatus::Failed => "failed",
            ShardStatus::Error => "error",
            ShardStatus::Timeout => "timeout",
            ShardStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A partition of a run, dispatched as one unit of work to one agent.
///
/// `(run_id, shard_index)` is unique, and at most one agent holds an
/// assignment at any time. The agent reference is an id, never a pointer, so
/// reassignment is a field update.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Shard {
    pub id: ShardId,
    pub run_id: RunId,
    pub shard_index: u32,
    pub status: ShardStatus,
    pub agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassignment_is_the_only_backward_edge() {
        use ShardStatus::*;
        assert!(Assigned.can_transition(Pending));
        assert!(!Running.can_transition(Pending));
        assert!(!Running.can_transition(Assigned));
        for terminal in [Passed, Failed, Error, Timeout, Cancelled] {
            assert!(!terminal.can_transition(Pending));
            assert!(!terminal.can_transition(Running));
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        use ShardStatus::*;
        assert!(Pending.can_transition(Assigned));
        assert!(Assigned.can_transition(Running));
        assert!(Running.can_transition(Passed));
    }
}
