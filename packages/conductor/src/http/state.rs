use std::sync::Arc;
use std::time::Instant;

use utils::telemetry::HttpMetrics;

use crate::config::Config;
use crate::control_plane::ControlPlane;

#[derive(Clone)]
pub struct HttpState {
    pub config: Config,
    pub control: Arc<ControlPlane>,
    pub metrics: HttpMetrics,
    pub started_at: Instant,
}

impl HttpState {
    pub fn new(config: Config, control: Arc<ControlPlane>, metrics: HttpMetrics) -> Self {
        Self {
            config,
            control,
            metrics,
            started_at: Instant::now(),
        }
    }
}
