use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use utils::config::CliEnvExt;

/// This struct is used for both args and environment variables
/// the basic idea is that every env var can be overriden by a cli arg
/// and these override the config file
/// env vars follow the pattern of CONDUCTOR_{UPPERCASE_ARG_NAME}
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// The home directory of the application, where the conductor.toml
    /// configuration file is stored
    /// if not provided here or in an env var, a series of default directories will be tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load
    /// if not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// The port to bind the server to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// The host to bind the server to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Log level in the format of comma-separated tracing directives.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "comma_split_list")]
    pub log_level: Vec<String>,

    /// The allowed cors origins
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "comma_split_list")]
    pub cors_allowed_origins: Vec<String>,

    /// Bearer token for mutating routes (usually leave this unset and
    /// provide it via env)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    /// OTLP collector endpoint for traces
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger: Option<String>,

    /// OTLP collector endpoint for metrics
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<String>,

    /// Seconds without a heartbeat before an agent is considered offline
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Seconds a work offer may stay unanswered before it counts as refused
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_timeout_secs: Option<u64>,

    /// Seconds between an acked offer and the shard's start event
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timeout_secs: Option<u64>,

    /// Seconds a cancelled shard gets to report before it is closed unilaterally
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_grace_secs: Option<u64>,

    /// Wall-clock ceiling for one run, in seconds
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_test_timeout_secs: Option<u64>,

    /// Seconds graceful shutdown waits for in-flight shards
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout_secs: Option<u64>,

    /// Optional cap on concurrently assigned shards per service
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_quota: Option<u32>,
}

/// List-valued args arrive two ways: as a real sequence (from the serialized
/// cli struct) or as one comma-joined string (from env vars like
/// `CONDUCTOR_LOG_LEVEL=info,conductor=debug`). Normalize both, dropping
/// empty segments.
fn comma_split_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match ListOrString::deserialize(deserializer)? {
        ListOrString::List(items) => items,
        ListOrString::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

impl CliEnvExt for CliArgs {
    const ENV_VAR_PREFIX: &'static str = "CONDUCTOR";

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn dotenv_path(&self) -> Option<PathBuf> {
        self.dotenv.clone()
    }
}
