use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{RunStatus, ServiceId, TriggerKind};

/// The single admission shape all trigger sources reduce to: manual API
/// calls, verified webhooks, and due schedules.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct AdmissionRequest {
    pub service_id: ServiceId,
    pub git_ref: String,
    pub git_sha: String,
    /// Higher first; validated against the configured priority range.
    pub priority: u32,
    pub trigger: TriggerKind,
    pub triggered_by: Option<String>,
    /// Requested partitioning. Clamped to >= 1 at admission.
    pub shard_count_hint: u32,
    pub test_filter: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, ToSchema)]
pub struct RunFilter {
    pub service_id: Option<ServiceId>,
    pub status: Option<RunStatus>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, ToSchema)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
}
