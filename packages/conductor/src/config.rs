use anyhow::{bail, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use utils::config::ConfigExt;

/// The fully parsed and validated config struct we use in the application.
/// Built from the utils ConfigBuilder, which loads from multiple sources
/// (in order of preference):
///
/// 1. cli args
/// 2. environment variables
/// 3. config file
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// The port to bind the server to.
    /// Default is `8000`
    pub port: u32,
    /// The host to bind the server to
    /// Default is `localhost`
    pub host: String,
    /// The log-level to use, in the format of [tracing directives](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives).
    /// Default is `["info"]`
    pub log_level: Vec<String>,
    /// The allowed cors origins
    /// Default is empty
    pub cors_allowed_origins: Vec<String>,
    /// Bearer token required on mutating routes and non-global subscriptions
    pub bearer_token: Option<String>,
    /// OTLP collector endpoint for trace export
    pub jaeger: Option<String>,
    /// Fraction of root spans to sample when trace export is on, in (0, 1]
    pub trace_sample_ratio: f64,
    /// OTLP collector endpoint for metric export
    pub prometheus: Option<String>,
    /// Seconds between metric export batches
    pub metric_interval_secs: u64,

    /// Seconds without a heartbeat before an agent is considered offline.
    /// Minimum 10.
    pub heartbeat_timeout_secs: u64,
    /// Seconds a work offer may stay unanswered before it counts as refused
    pub offer_timeout_secs: u64,
    /// Seconds between an acked offer and the shard's start event
    pub start_timeout_secs: u64,
    /// Seconds a cancelled shard gets to report before it is closed unilaterally
    pub cancel_grace_secs: u64,
    /// Wall-clock ceiling for one run
    pub max_test_timeout_secs: u64,
    /// Per-shard execution budget handed to agents
    pub default_test_timeout_secs: u64,
    /// Seconds graceful shutdown waits for in-flight shards
    pub shutdown_timeout_secs: u64,

    /// Capacity of the result/event channel into the aggregator
    pub result_stream_buffer: usize,
    /// Per-subscriber event buffer; overflow disconnects the subscriber
    pub subscriber_buffer: usize,
    /// Accepted admission priorities, inclusive
    pub queue_priority_range: (u32, u32),
    /// Optional cap on concurrently assigned shards per service
    pub service_quota: Option<u32>,
}

/// Default values for the config struct
/// these are only used to fill in holes after all the parsing and loading is done
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "localhost".to_string(),
            log_level: vec!["info".to_string()],
            cors_allowed_origins: Vec::new(),
            bearer_token: None,
            jaeger: None,
            trace_sample_ratio: 1.0,
            prometheus: None,
            metric_interval_secs: 60,
            heartbeat_timeout_secs: 90,
            offer_timeout_secs: 10,
            start_timeout_secs: 120,
            cancel_grace_secs: 60,
            max_test_timeout_secs: 4 * 60 * 60,
            default_test_timeout_secs: 60 * 60,
            shutdown_timeout_secs: 30,
            result_stream_buffer: 100,
            subscriber_buffer: 256,
            queue_priority_range: (0, 100),
            service_quota: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout_secs < 10 {
            bail!(
                "heartbeat_timeout must be at least 10s, got {}s",
                self.heartbeat_timeout_secs
            );
        }
        if self.max_test_timeout_secs < self.default_test_timeout_secs {
            bail!(
                "max_test_timeout ({}s) must be >= default_test_timeout ({}s)",
                self.max_test_timeout_secs,
                self.default_test_timeout_secs
            );
        }
        let (min, max) = self.queue_priority_range;
        if min >= max {
            bail!("queue_priority_range [{min}, {max}] is empty");
        }
        if self.result_stream_buffer == 0 || self.subscriber_buffer == 0 {
            bail!("stream buffers must be non-zero");
        }
        if !(self.trace_sample_ratio > 0.0 && self.trace_sample_ratio <= 1.0) {
            bail!(
                "trace_sample_ratio must be in (0, 1], got {}",
                self.trace_sample_ratio
            );
        }
        Ok(())
    }

    pub fn trace_export(&self) -> Option<utils::telemetry::TraceExport> {
        self.jaeger
            .as_ref()
            .map(|collector| utils::telemetry::TraceExport {
                collector: collector.clone(),
                service_name: "conductor".to_string(),
                sample_ratio: self.trace_sample_ratio,
            })
    }

    pub fn metric_export(&self) -> Option<utils::telemetry::MetricExport> {
        self.prometheus
            .as_ref()
            .map(|collector| utils::telemetry::MetricExport {
                collector: collector.clone(),
                service_name: "conductor".to_string(),
                interval_secs: self.metric_interval_secs,
            })
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::seconds(self.offer_timeout_secs as i64)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::seconds(self.start_timeout_secs as i64)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::seconds(self.cancel_grace_secs as i64)
    }

    pub fn max_test_timeout(&self) -> Duration {
        Duration::seconds(self.max_test_timeout_secs as i64)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl ConfigExt for Config {
    const FILENAME: &'static str = "conductor.toml";
    const DIRNAME: &'static str = "conductor";
    const HIDDEN_DIRNAME: &'static str = ".conductor";

    fn log_directives(&self) -> &[String] {
        &self.log_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn heartbeat_floor_is_enforced() {
        let config = Config {
            heartbeat_timeout_secs: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sample_ratio_must_be_a_usable_fraction() {
        for bad in [0.0, -0.5, 1.5] {
            let config = Config {
                trace_sample_ratio: bad,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn run_timeout_must_cover_test_timeout() {
        let config = Config {
            max_test_timeout_secs: 60,
            default_test_timeout_secs: 120,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
