//! Opaque, time-ordered 128-bit identifiers.
//!
//! Chunk, vault, source and node identifiers are all UUIDv7-like: natural
//! (lexicographic / `Ord`) order approximates creation order because the
//! high bits of a v7 UUID are a millisecond timestamp.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new time-ordered id.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(ChunkId);
opaque_id!(SourceId);
opaque_id!(VaultId);
opaque_id!(NodeId);

/// Ingester identifiers are operator-assigned names, not generated ids.
pub type IngesterId = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_ordered() {
        let a = ChunkId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ChunkId::new();
        assert!(a < b);
    }

    #[test]
    fn roundtrips_through_string() {
        let id = VaultId::new();
        let s = id.to_string();
        let parsed: VaultId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
