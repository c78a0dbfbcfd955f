use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::{
    clock::SystemClock,
    config::{ConfigBuilder, ConfigExt},
    context::AppContext,
    store::memory::MemoryRunStore,
    telemetry::{setup_metrics, setup_tracing, Metrics},
};

use conductor::{args::CliArgs, config::Config, control_plane::ControlPlane};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config: Config = match ConfigBuilder::new(args).build() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err:#}");
            return ExitCode::from(1);
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("invalid config: {err:#}");
        return ExitCode::from(1);
    }

    let ctx = AppContext::new();

    // setup tracing
    let filters = match config.tracing_env_filter() {
        Ok(filters) => filters,
        Err(err) => {
            eprintln!("bad log directives: {err:#}");
            return ExitCode::from(1);
        }
    };
    let tracer_provider = match config.trace_export() {
        Some(export) => match setup_tracing(export, filters) {
            Ok(provider) => Some(provider),
            Err(err) => {
                eprintln!("trace export setup failed: {err:#}");
                return ExitCode::from(1);
            }
        },
        None => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .without_time()
                        .with_target(false),
                )
                .with(filters)
                .try_init()
                .ok();
            None
        }
    };

    let meter_provider = match config.metric_export() {
        Some(export) => match setup_metrics(export) {
            Ok(provider) => Some(provider),
            Err(err) => {
                tracing::error!("metric export setup failed: {err:#}");
                return ExitCode::from(1);
            }
        },
        None => None,
    };
    let meter = global::meter("conductor_metrics");
    let metrics = Metrics::new(&meter);

    let store = Arc::new(MemoryRunStore::new());
    let clock = Arc::new(SystemClock);
    let control = Arc::new(ControlPlane::new(
        config.clone(),
        metrics.core,
        store,
        clock,
    ));

    let exit = match conductor::run_server(ctx, config, control, metrics.http) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            tracing::error!("startup failed: {err:#}");
            ExitCode::from(1)
        }
    };

    if let Some(tracer) = tracer_provider {
        let _ = tracer.shutdown();
    }
    if let Some(meter) = meter_provider {
        let _ = meter.shutdown();
    }

    exit
}
