use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{ArtifactId, ResultId, RunId, ShardId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

/// One test outcome, as parsed and normalized by the agent. Append-only.
///
/// Retries happen inside the agent per the test definition's `retries`; the
/// control plane only ever sees the final outcome with its `retry_count`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct TestResult {
    pub id: ResultId,
    pub run_id: RunId,
    pub shard_id: ShardId,
    pub name: String,
    pub suite: Option<String>,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Error message / stack text for failed or errored tests.
    pub error: Option<String>,
    pub retry_count: u32,
    /// Copied from the test definition: a failing result does not fail the run.
    pub allow_failure: bool,
    /// Copied from the test definition: the result records its real status but
    /// counts as skipped in the run aggregate.
    pub quarantined: bool,
}

/// A file produced by a shard, already uploaded to the object store by the
/// agent. The control plane tracks the reference, not the bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Artifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub shard_id: ShardId,
    pub name: String,
    /// Content-addressable path in the object store.
    pub path: String,
    pub content_type: String,
    pub size_bytes: u64,
}
