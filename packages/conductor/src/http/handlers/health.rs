use axum::{extract::State, Json};
use tracing::instrument;

use crate::health::HealthStatus;
use crate::http::state::HttpState;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health snapshot", body = HealthStatus),
    ),
    description = "Get a snapshot of queue depth, agents, sessions, and subscribers"
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_health(State(state): State<HttpState>) -> Json<HealthStatus> {
    Json(HealthStatus::snapshot(&state.control))
}
