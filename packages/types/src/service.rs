use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{ExecutionKind, ScheduleId, ServiceId};

/// A service under test. Runs inherit their allowed-zone set and execution
/// kind from here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Service {
    pub id: ServiceId,
    /// Unique, human-facing name.
    pub name: String,
    pub git_url: String,
    pub git_provider: Option<String>,
    pub default_branch: String,
    /// Zones an agent must advertise to be offered this service's shards.
    pub allowed_zones: BTreeSet<String>,
    pub execution: ExecutionKind,
    pub owner: Option<String>,
    pub contacts: Vec<String>,
}

/// A cron schedule that admits runs for a service. Evaluated periodically;
/// fires when enabled and `next_run_at <= now`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Schedule {
    pub id: ScheduleId,
    pub service_id: ServiceId,
    /// Standard cron expression.
    pub cron: String,
    pub git_ref: String,
    pub priority: u32,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
}
