//! Resource identifiers.
//!
//! Every identifier is a UUIDv7 so ids sort by creation time.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Raw bytes of the id, used as the job queue payload.
            pub fn to_bytes(&self) -> Vec<u8> {
                self.0.to_string().into_bytes()
            }

            pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| crate::Error::InvalidInput(e.to_string()))?;
                text.parse()
                    .map_err(|e: uuid::Error| crate::Error::InvalidInput(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

resource_id!(
    /// Identifies one job (one execution of a flow).
    JobId
);
resource_id!(
    /// Identifies a flow definition.
    FlowId
);
resource_id!(
    /// Identifies an agent.
    AgentId
);
