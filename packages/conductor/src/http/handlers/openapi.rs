use super::*;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        runs::handle_submit_run,
        runs::handle_submit_webhook,
        runs::handle_cancel_run,
        runs::handle_get_run,
        runs::handle_list_runs,
        health::handle_health,
        info::handle_info,
    ),
    info(
        title = "Conductor API",
        description = "API documentation for the Conductor control plane"
    )
)]
pub struct ApiDoc;
