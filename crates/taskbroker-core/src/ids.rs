//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Broker-generated identifier of a matched task.
    TaskId
);

string_id!(
    /// Identifier of a runner connection, stable across reconnects.
    RunnerId
);

string_id!(
    /// Identifier of a requester connection.
    RequesterId
);

string_id!(
    /// Runner-generated identifier of a task offer.
    OfferId
);

string_id!(
    /// Correlation id chosen by the sender: a requester's task request id,
    /// or a runner's per-task data request id.
    RequestId
);

string_id!(
    /// Runner-generated correlation id of a single RPC call.
    CallId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generate() {
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_display() {
        let id = RunnerId::new("runner-123");
        assert_eq!(format!("{}", id), "runner-123");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = OfferId::new("offer-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""offer-1""#);
    }
}
