use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{AgentId, Artifact, ExecutionKind, RunCounters, RunId, ShardId, ShardStatus, TestResult};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Resource telemetry piggybacked on heartbeats.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
pub struct HeartbeatTelemetry {
    pub active_jobs: u32,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub disk_percent: f32,
}

/// Everything an agent needs to execute one shard.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct ExecutionPlan {
    pub git_ref: String,
    pub git_sha: String,
    pub execution: ExecutionKind,
    pub test_filter: Option<String>,
    pub test_timeout_secs: u64,
}

/// Client half of the dispatch stream. Every frame is wrapped in a
/// [`ClientEnvelope`] carrying the `frame_id` the server echoes in `Ack`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        agent_id: AgentId,
        name: String,
        zones: BTreeSet<String>,
        max_parallel: u32,
        container_capable: bool,
        version: String,
    },
    Heartbeat {
        telemetry: HeartbeatTelemetry,
    },
    WorkAck {
        shard_id: ShardId,
    },
    WorkNack {
        shard_id: ShardId,
        reason: String,
    },
    ShardStarted {
        shard_id: ShardId,
        ts: DateTime<Utc>,
    },
    ShardFinished {
        shard_id: ShardId,
        status: ShardStatus,
        counters: RunCounters,
        error: Option<String>,
    },
    Result {
        shard_id: ShardId,
        result: TestResult,
    },
    LogChunk {
        shard_id: ShardId,
        /// Totally ordered per shard; the server dedups on `(shard_id, seq)`.
        seq: u64,
        stream: LogStream,
        data: String,
    },
    ArtifactUploaded {
        shard_id: ShardId,
        artifact: Artifact,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClientEnvelope {
    pub frame_id: u64,
    #[serde(flatten)]
    pub frame: ClientFrame,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorCode {
    ProtocolViolation,
    /// A newer session registered with the same agent id.
    Superseded,
    Shutdown,
}

/// Server half of the dispatch stream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    WorkOffer {
        shard_id: ShardId,
        run_id: RunId,
        shard_index: u32,
        shard_count: u32,
        plan: ExecutionPlan,
    },
    Cancel {
        shard_id: ShardId,
        reason: String,
    },
    Drain {},
    Ack {
        frame_id: u64,
    },
    StreamError {
        code: StreamErrorCode,
        retry_after_secs: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flattens_the_tag() {
        let envelope = ClientEnvelope {
            frame_id: 7,
            frame: ClientFrame::WorkAck {
                shard_id: ShardId::from_u128(3),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["frame_id"], 7);
        assert_eq!(json["type"], "work_ack");

        let back: ClientEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn server_frames_roundtrip() {
        let frames = vec![
            ServerFrame::Drain {},
            ServerFrame::Ack { frame_id: 42 },
            ServerFrame::Cancel {
                shard_id: ShardId::from_u128(9),
                reason: "run cancelled".into(),
            },
            ServerFrame::StreamError {
                code: StreamErrorCode::Superseded,
                retry_after_secs: Some(5),
            },
        ];
        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let back: ServerFrame = serde_json::from_str(&json).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn log_chunk_keeps_seq() {
        let envelope = ClientEnvelope {
            frame_id: 1,
            frame: ClientFrame::LogChunk {
                shard_id: ShardId::from_u128(1),
                seq: 12,
                stream: LogStream::Stderr,
                data: "oh no".into(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 12);
        assert_eq!(json["stream"], "stderr");
    }
}
