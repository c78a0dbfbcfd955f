#![allow(clippy::uninlined_format_args)]

pub mod args;
pub mod config;
pub mod control_plane; // where the subsystems are wired together
pub mod health;
pub mod http;
pub mod subsystems; // subsystems: queue, registry, session, scheduler, aggregator, bus, admission

use std::sync::Arc;

use config::Config;
use control_plane::ControlPlane;
use utils::context::AppContext;
use utils::telemetry::HttpMetrics;

/// Entry point to start up the whole server.
/// Called from main and end-to-end tests. Returns true when shutdown was
/// clean (all in-flight shards settled inside the shutdown window).
pub fn run_server(
    ctx: AppContext,
    config: Config,
    control: Arc<ControlPlane>,
    metrics: HttpMetrics,
) -> anyhow::Result<bool> {
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.request_shutdown();
        }
    });

    ctx.rt.block_on({
        let control = control.clone();
        let ctx = ctx.clone();
        async move { control.start(ctx).await }
    })?;

    // the http server owns the calling thread until the kill signal
    http::server::start(ctx.clone(), config, control.clone(), metrics)?;

    // admissions stop with the server; now drain the agents
    let clean = ctx.rt.block_on(async move { control.shutdown().await });
    Ok(clean)
}

// the test version of init_tracing does not take a config
// since config itself is tested and modified from different parallel tests
// therefore, this only uses the default tracing settings
pub fn init_tracing_tests() {
    utils::init_tracing_tests();
}
