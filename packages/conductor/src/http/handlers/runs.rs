use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use tracing::instrument;

use conductor_types::{Page, PageRequest, Run, RunFilter, RunId, TriggerKind};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::{ListRunsQuery, SubmitRunRequest, SubmitRunResponse};

#[utoipa::path(
    post,
    path = "/runs",
    request_body = SubmitRunRequest,
    responses(
        (status = 200, description = "Run admitted", body = SubmitRunResponse),
        (status = 400, description = "Validation failure"),
        (status = 404, description = "Unknown service"),
    ),
    description = "Admit a manually triggered run"
)]
#[axum::debug_handler]
#[instrument(level = "debug", skip(state, request))]
pub async fn handle_submit_run(
    State(state): State<HttpState>,
    Json(request): Json<SubmitRunRequest>,
) -> impl IntoResponse {
    match submit_run_inner(state, request, TriggerKind::Manual, None).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/webhooks",
    request_body = SubmitRunRequest,
    responses(
        (status = 200, description = "Run admitted", body = SubmitRunResponse),
        (status = 400, description = "Unsigned or invalid delivery"),
    ),
    description = "Admit a run from a signature-verified webhook delivery"
)]
#[axum::debug_handler]
#[instrument(level = "debug", skip(state, headers, request))]
pub async fn handle_submit_webhook(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRunRequest>,
) -> impl IntoResponse {
    // signature verification happens at the edge; an unsigned delivery is
    // refused regardless
    let signature = headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-conductor-signature"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    match submit_run_inner(state, request, TriggerKind::Webhook, signature).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn submit_run_inner(
    state: HttpState,
    request: SubmitRunRequest,
    trigger: TriggerKind,
    signature: Option<String>,
) -> HttpResult<SubmitRunResponse> {
    let admission_request = request.into_admission(trigger);
    let run = match trigger {
        TriggerKind::Webhook => {
            state
                .control
                .admission
                .admit_webhook(admission_request, signature.as_deref())
                .await?
        }
        _ => state.control.admission.admit(admission_request).await?,
    };
    state.metrics.increment_runs_submitted();
    Ok(SubmitRunResponse {
        run_id: run.id,
        status: run.status,
    })
}

#[utoipa::path(
    post,
    path = "/runs/{run_id}/cancel",
    params(("run_id" = String, Path, description = "Run id")),
    responses(
        (status = 204, description = "Cancellation accepted"),
        (status = 404, description = "Unknown run"),
        (status = 409, description = "Run already terminal"),
    ),
    description = "Cancel a run"
)]
#[axum::debug_handler]
#[instrument(level = "debug", skip(state))]
pub async fn handle_cancel_run(
    State(state): State<HttpState>,
    Path(run_id): Path<RunId>,
) -> impl IntoResponse {
    match state.control.cancel_run(run_id).await {
        Ok(()) => {
            state.metrics.increment_runs_cancelled();
            axum::http::StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => HttpError::from(err).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/runs/{run_id}",
    params(("run_id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "The run", body = Run),
        (status = 404, description = "Unknown run"),
    ),
    description = "Fetch one run"
)]
#[axum::debug_handler]
#[instrument(level = "debug", skip(state))]
pub async fn handle_get_run(
    State(state): State<HttpState>,
    Path(run_id): Path<RunId>,
) -> impl IntoResponse {
    match state.control.get_run(run_id).await {
        Ok(run) => Json(run).into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/runs",
    responses(
        (status = 200, description = "Matching runs, newest first", body = Page<Run>),
    ),
    description = "List runs with optional service/status filters"
)]
#[axum::debug_handler]
#[instrument(level = "debug", skip(state))]
pub async fn handle_list_runs(
    State(state): State<HttpState>,
    Query(query): Query<ListRunsQuery>,
) -> impl IntoResponse {
    let filter = RunFilter {
        service_id: query.service_id,
        status: query.status,
    };
    let page = PageRequest {
        offset: query.offset,
        limit: query.limit.unwrap_or(50).min(500),
    };
    match state.control.list_runs(&filter, page).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}
