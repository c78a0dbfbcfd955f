use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utils::telemetry::HttpMetrics;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use wildmatch::WildMatch;

use crate::{config::Config, control_plane::ControlPlane};
use utils::context::AppContext;

use super::{
    auth::{require_bearer, BearerAuth},
    handlers::{
        handle_agent_session, handle_cancel_run, handle_get_run, handle_health, handle_info,
        handle_list_runs, handle_not_found, handle_submit_run, handle_submit_webhook,
        handle_subscribe, openapi::ApiDoc,
    },
    state::HttpState,
};

// this is called from run_server, once the control plane is started
pub fn start(
    ctx: AppContext,
    config: Config,
    control: Arc<ControlPlane>,
    metrics: HttpMetrics,
) -> anyhow::Result<()> {
    // The server runs within the tokio runtime
    ctx.rt.clone().block_on(async move {
        let (host, port) = (config.host.clone(), config.port);

        let mut shutdown_signal = ctx.on_shutdown();

        let router = make_router(config, control, metrics)?;

        let listener = tokio::net::TcpListener::bind(&format!("{}:{}", host, port)).await?;

        tracing::info!("Http server starting on: {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.recv().await.ok();

                tracing::debug!("Http server shutting down");
            })
            .await?;

        anyhow::Ok(())
    })?;

    Ok(())
}

// this is called from run_server and tests
pub fn make_router(
    config: Config,
    control: Arc<ControlPlane>,
    metrics: HttpMetrics,
) -> anyhow::Result<axum::Router> {
    let state = HttpState::new(config.clone(), control, metrics);

    // public routes
    let public = axum::Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(OtelAxumLayer::default())
        .route("/health", get(handle_health))
        .route("/info", get(handle_info))
        .route("/runs", get(handle_list_runs))
        .route("/runs/{run_id}", get(handle_get_run))
        // streaming endpoints carry their own auth in stream metadata
        .route("/agents/session", get(handle_agent_session))
        .route("/subscribe", get(handle_subscribe))
        // webhook deliveries authenticate by provider signature
        .route("/webhooks", post(handle_submit_webhook));

    // protected routes (mutations)
    let protected = axum::Router::new()
        .route("/runs", post(handle_submit_run))
        .route("/runs/{run_id}/cancel", post(handle_cancel_run));

    let public = public.with_state(state.clone());
    let protected = protected.with_state(state.clone());

    // apply bearer auth to protected routes if configured
    let mut router = public
        .merge(match &state.config.bearer_token {
            Some(token) => protected.layer(middleware::from_fn_with_state(
                BearerAuth::new(token),
                require_bearer,
            )),
            None => protected,
        })
        .fallback(handle_not_found);

    if let Some(cors) = cors_layer(&state.config) {
        router = router.layer(cors);
    }

    Ok(router)
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        None
    } else {
        let allowed_origins: Vec<WildMatch> = config
            .cors_allowed_origins
            .iter()
            .map(|s| WildMatch::new(s))
            .collect();

        Some(
            CorsLayer::new()
                // using a predicate so we have more flexibility over wildcard patterns
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    move |origin, _parts| {
                        origin
                            .to_str()
                            .map(|origin| {
                                allowed_origins
                                    .iter()
                                    .any(|allowed_origin| allowed_origin.matches(origin))
                            })
                            .unwrap_or(false)
                    },
                ))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
    }
}
