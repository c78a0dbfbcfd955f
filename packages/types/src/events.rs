use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::{Agent, AgentId, LogStream, Run, RunId, Service, ServiceId, ShardId, TestResult};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum TopicError {
    #[error("unknown topic kind \"{0}\"")]
    UnknownKind(String),
    #[error("invalid topic id \"{0}\"")]
    InvalidId(String),
}

/// A subscription address: `run:<uuid>`, `agent:<uuid>`, `service:<uuid>`, or
/// `global`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Run(RunId),
    Agent(AgentId),
    Service(ServiceId),
    Global,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Run(id) => write!(f, "run:{}", id),
            Topic::Agent(id) => write!(f, "agent:{}", id),
            Topic::Service(id) => write!(f, "service:{}", id),
            Topic::Global => write!(f, "global"),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Topic::Global);
        }
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| TopicError::UnknownKind(s.to_string()))?;
        let invalid = || TopicError::InvalidId(id.to_string());
        match kind {
            "run" => Ok(Topic::Run(id.parse().map_err(|_| invalid())?)),
            "agent" => Ok(Topic::Agent(id.parse().map_err(|_| invalid())?)),
            "service" => Ok(Topic::Service(id.parse().map_err(|_| invalid())?)),
            other => Err(TopicError::UnknownKind(other.to_string())),
        }
    }
}

impl serde::Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A delta pushed to subscribers. Entity updates carry the whole entity so a
/// late subscriber does not need a second read to catch up.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunUpdate {
        run: Run,
    },
    AgentUpdate {
        agent: Agent,
    },
    ServiceUpdate {
        service: Service,
    },
    LogChunk {
        run_id: RunId,
        shard_id: ShardId,
        seq: u64,
        stream: LogStream,
        data: String,
    },
    TestResult {
        run_id: RunId,
        result: TestResult,
    },
}

impl Event {
    /// The entity topic this event belongs to. Entity updates are also
    /// mirrored onto `global`; high-volume log/result events are not.
    pub fn topic(&self) -> Topic {
        match self {
            Event::RunUpdate { run } => Topic::Run(run.id),
            Event::AgentUpdate { agent } => Topic::Agent(agent.id),
            Event::ServiceUpdate { service } => Topic::Service(service.id),
            Event::LogChunk { run_id, .. } => Topic::Run(*run_id),
            Event::TestResult { run_id, .. } => Topic::Run(*run_id),
        }
    }

    pub fn mirrors_to_global(&self) -> bool {
        matches!(
            self,
            Event::RunUpdate { .. } | Event::AgentUpdate { .. } | Event::ServiceUpdate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_roundtrip() {
        for topic in [
            Topic::Run(RunId::from_u128(1)),
            Topic::Agent(AgentId::from_u128(2)),
            Topic::Service(ServiceId::from_u128(3)),
            Topic::Global,
        ] {
            let parsed: Topic = topic.to_string().parse().unwrap();
            assert_eq!(parsed, topic);
        }
    }

    #[test]
    fn topic_rejects_unknown_kind() {
        assert!(matches!(
            "shard:whatever".parse::<Topic>(),
            Err(TopicError::UnknownKind(_))
        ));
        assert!(matches!(
            "run:not-a-uuid".parse::<Topic>(),
            Err(TopicError::InvalidId(_))
        ));
    }

    #[test]
    fn log_chunks_stay_off_global() {
        let event = Event::LogChunk {
            run_id: RunId::from_u128(1),
            shard_id: ShardId::from_u128(2),
            seq: 0,
            stream: LogStream::Stdout,
            data: "hello".into(),
        };
        assert!(!event.mirrors_to_global());
        assert_eq!(event.topic(), Topic::Run(RunId::from_u128(1)));
    }
}
