use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IdError {
    #[error("invalid id \"{0}\"")]
    Parse(String),
}

/// Macro for generating new ID-like types.
///
/// Every entity id is an opaque 128-bit value. On the wire and in logs they
/// render as hyphenated UUIDs; internally they are ordered, hashable values
/// so they can serve as deterministic tie-breakers.
macro_rules! new_uuid_id_type {
    ($type_name:ident) => {
        #[derive(
            Serialize,
            Deserialize,
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ToSchema,
        )]
        #[serde(transparent)]
        pub struct $type_name(Uuid);

        impl $type_name {
            /// Mint a fresh id. V7 keeps ids roughly time-ordered, which makes
            /// the queue tie-break stable across restarts.
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            /// Construct from a raw 128-bit value. Tests use this to get
            /// deterministic ids.
            pub const fn from_u128(value: u128) -> Self {
                Self(Uuid::from_u128(value))
            }

            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl FromStr for $type_name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| IdError::Parse(s.to_string()))
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$type_name> for Uuid {
            fn from(id: $type_name) -> Uuid {
                id.0
            }
        }
    };
}

new_uuid_id_type!(RunId);
new_uuid_id_type!(ShardId);
new_uuid_id_type!(AgentId);
new_uuid_id_type!(ServiceId);
new_uuid_id_type!(ResultId);
new_uuid_id_type!(ArtifactId);
new_uuid_id_type!(ScheduleId);
new_uuid_id_type!(SubscriberId);
