use axum::{extract::State, Json};
use tracing::instrument;

use crate::http::state::HttpState;
use crate::http::types::InfoResponse;

#[utoipa::path(
    get,
    path = "/info",
    responses(
        (status = 200, description = "Build and uptime info", body = InfoResponse),
    ),
    description = "Get server build info"
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_info(State(state): State<HttpState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
