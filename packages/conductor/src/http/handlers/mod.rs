pub mod agents;
mod health;
mod info;
pub(crate) mod openapi;
pub mod runs;
pub mod subscribe;

pub use agents::handle_agent_session;
pub use health::handle_health;
pub use info::handle_info;
pub use runs::{
    handle_cancel_run, handle_get_run, handle_list_runs, handle_submit_run, handle_submit_webhook,
};
pub use subscribe::handle_subscribe;

use axum::http::StatusCode;
use axum::response::IntoResponse;

pub async fn handle_not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
