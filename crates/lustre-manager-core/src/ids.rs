//! Core identifier types.
//!
//! Persistent records (entities, commands, jobs, step results, alerts) carry
//! stable 64-bit ids allocated by the store. Agent sessions and RPCs carry
//! random UUIDs since they never outlive the process that minted them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Return the raw id.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Big-endian encoding, used for ordered storage keys.
            #[must_use]
            pub const fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            /// Decode from an 8-byte big-endian slice.
            ///
            /// # Errors
            ///
            /// Returns an error if the slice is not exactly 8 bytes.
            pub fn from_be_slice(bytes: &[u8]) -> Result<Self, IdError> {
                let arr: [u8; 8] = bytes.try_into().map_err(|_| IdError::InvalidLength {
                    expected: 8,
                    got: bytes.len(),
                })?;
                Ok(Self(u64::from_be_bytes(arr)))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self).map_err(|_| IdError::InvalidNumber)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

numeric_id!(
    /// Identity of a persistent entity (host, target, filesystem, ...).
    ///
    /// Ids are unique within a class; use [`crate::EntityRef`] to identify an
    /// entity across classes.
    EntityId
);

numeric_id!(
    /// Identity of a user-originated command.
    CommandId
);

numeric_id!(
    /// Identity of a job. Job ids are allocated monotonically, so id order is
    /// also creation order and write-lock order.
    JobId
);

numeric_id!(
    /// Identity of a step execution record.
    StepResultId
);

numeric_id!(
    /// Identity of an alert record.
    AlertId
);

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a new random id.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }
    };
}

uuid_id!(
    /// An agent session identifier.
    ///
    /// Minted by the messenger when it answers a `SESSION_CREATE_REQUEST`.
    SessionId
);

uuid_id!(
    /// Identity of one agent RPC; echoed back in `ACTION_COMPLETE`.
    RpcId
);

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a decimal integer.
    #[error("invalid numeric id")]
    InvalidNumber,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,

    /// The input does not name a known entity class.
    #[error("unknown class tag: {0}")]
    UnknownClass(String),

    /// An entity reference is not of the form `class:id`.
    #[error("malformed entity reference: {0}")]
    MalformedRef(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_order_by_value() {
        assert!(JobId::new(2) < JobId::new(10));
        let mut ids = vec![JobId::new(9), JobId::new(1), JobId::new(4)];
        ids.sort();
        assert_eq!(ids, vec![JobId::new(1), JobId::new(4), JobId::new(9)]);
    }

    #[test]
    fn big_endian_keys_sort_like_ids() {
        let a = JobId::new(255).to_be_bytes();
        let b = JobId::new(256).to_be_bytes();
        assert!(a < b);
        assert_eq!(JobId::from_be_slice(&b).unwrap(), JobId::new(256));
    }

    #[test]
    fn from_be_slice_rejects_short_input() {
        let result = EntityId::from_be_slice(&[1, 2, 3]);
        assert!(matches!(result, Err(IdError::InvalidLength { expected: 8, got: 3 })));
    }

    #[test]
    fn numeric_id_serializes_as_number() {
        let json = serde_json::to_string(&CommandId::new(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: CommandId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, CommandId::new(42));
    }

    #[test]
    fn numeric_id_parse_error() {
        assert_eq!("abc".parse::<JobId>(), Err(IdError::InvalidNumber));
    }

    #[test]
    fn session_id_serde_json() {
        let id = SessionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rpc_id_invalid_uuid() {
        let result = RpcId::from_str("not-a-uuid");
        assert!(matches!(result, Err(IdError::InvalidUuid)));
    }

    #[test]
    fn generated_session_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
