use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::control_plane::ControlPlane;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    pub queue_depth: usize,
    pub queue_by_priority: BTreeMap<u32, usize>,
    pub live_agents: usize,
    pub open_sessions: usize,
    pub subscribers: usize,
}

impl HealthStatus {
    pub fn snapshot(control: &ControlPlane) -> Self {
        let queue_by_priority = control.queue.snapshot();
        Self {
            timestamp: control.clock.now(),
            queue_depth: control.queue.len(),
            queue_by_priority,
            live_agents: control.registry.agent_count(),
            open_sessions: control.sessions.session_count(),
            subscribers: control.bus.subscriber_count(),
        }
    }
}
