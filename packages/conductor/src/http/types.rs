use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use conductor_types::{AdmissionRequest, RunId, RunStatus, ServiceId, TriggerKind};

/// Body for `POST /runs`. The trigger kind is fixed server-side per route
/// (manual for the API, webhook for the webhook receiver).
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct SubmitRunRequest {
    pub service_id: ServiceId,
    pub git_ref: String,
    pub git_sha: String,
    #[serde(default)]
    pub priority: u32,
    pub triggered_by: Option<String>,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    pub test_filter: Option<String>,
}

fn default_shard_count() -> u32 {
    1
}

impl SubmitRunRequest {
    pub fn into_admission(self, trigger: TriggerKind) -> AdmissionRequest {
        AdmissionRequest {
            service_id: self.service_id,
            git_ref: self.git_ref,
            git_sha: self.git_sha,
            priority: self.priority,
            trigger,
            triggered_by: self.triggered_by,
            shard_count_hint: self.shard_count,
            test_filter: self.test_filter,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct SubmitRunResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct ListRunsQuery {
    pub service_id: Option<ServiceId>,
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct InfoResponse {
    pub name: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct SubscribeQuery {
    /// Comma-separated topic list, e.g. `run:<uuid>,global`
    pub topics: String,
    pub token: Option<String>,
}
