use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{RunId, ServiceId};

/// How a run came to exist.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Schedule,
}

/// How a service's shards are executed on an agent. Container shards can only
/// be matched to container-capable agents.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Process,
    Container,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Passed
                | RunStatus::Failed
                | RunStatus::Error
                | RunStatus::Timeout
                | RunStatus::Cancelled
        )
    }

    /// The run state graph. Transitions are monotone: once terminal, nothing
    /// moves, and nothing ever returns to `pending`.
    pub fn can_transition(self, to: RunStatus) -> bool {
        use RunStatus::*;
        match (self, to) {
            (Pending, Running) => true,
            // a run whose shards all die before any of them starts
            (Pending, Error) | (Pending, Timeout) | (Pending, Cancelled) => true,
            (Running, Passed)
            | (Running, Failed)
            | (Running, Error)
            | (Running, Timeout)
            | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate test counters, shared by runs and shards. A run's counters are
/// the sum over its shards once the run is terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, ToSchema)]
pub struct RunCounters {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errored: u64,
}

impl RunCounters {
    pub fn add(&mut self, other: &RunCounters) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errored += other.errored;
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.passed + self.failed + self.skipped + self.errored
    }
}

/// One end-to-end test execution for one service at one git sha.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Run {
    pub id: RunId,
    pub service_id: ServiceId,
    pub git_ref: String,
    pub git_sha: String,
    pub trigger: TriggerKind,
    /// Who or what asked for this run (username, webhook delivery id, schedule id).
    pub triggered_by: Option<String>,
    /// Higher first. Always within the configured priority range.
    pub priority: u32,
    pub status: RunStatus,
    pub execution: ExecutionKind,
    /// Number of shards the run was split into. Always >= 1.
    pub shard_count: u32,
    pub test_filter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub error: Option<String>,
}

impl Run {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_do_not_move() {
        for terminal in [
            RunStatus::Passed,
            RunStatus::Failed,
            RunStatus::Error,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for to in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Passed,
                RunStatus::Failed,
                RunStatus::Error,
                RunStatus::Timeout,
                RunStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition(to),
                    "{terminal:?} -> {to:?} should be rejected"
                );
            }
        }
    }

    #[test]
    fn no_regression_to_pending() {
        assert!(!RunStatus::Running.can_transition(RunStatus::Pending));
    }

    #[test]
    fn pending_to_running_to_passed() {
        assert!(RunStatus::Pending.can_transition(RunStatus::Running));
        assert!(RunStatus::Running.can_transition(RunStatus::Passed));
        assert!(!RunStatus::Pending.can_transition(RunStatus::Passed));
    }

    #[test]
    fn counters_sum() {
        let mut total = RunCounters::default();
        total.add(&RunCounters {
            total: 3,
            passed: 2,
            failed: 1,
            skipped: 0,
            errored: 0,
        });
        total.add(&RunCounters {
            total: 3,
            passed: 3,
            failed: 0,
            skipped: 0,
            errored: 0,
        });
        assert_eq!(total.total, 6);
        assert_eq!(total.passed, 5);
        assert!(total.is_consistent());
    }
}
