//! Branded ID newtypes.
//!
//! Connections, principals and projects are all addressed by strings on the
//! wire. Wrapping them keeps a project id from being passed where a principal
//! id is expected. Connection ids are generated here (UUID v7, prefixed);
//! principal and project ids always come from outside.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id is empty or whitespace only.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
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

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a live connection.
    ConnectionId
}

branded_id! {
    /// Already-authenticated identity owning a connection.
    PrincipalId
}

branded_id! {
    /// Identifier of a project channel.
    ProjectId
}

impl ConnectionId {
    /// Create a new random connection ID (`conn_` + UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix_and_v7() {
        let id = ConnectionId::new();
        let raw = id.as_str().strip_prefix("conn_").expect("prefix");
        let parsed = Uuid::parse_str(raw).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn blank_detection() {
        assert!(PrincipalId::from("").is_blank());
        assert!(PrincipalId::from("   ").is_blank());
        assert!(!PrincipalId::from("3").is_blank());
    }

    #[test]
    fn deref_and_display() {
        let id = ProjectId::from("7");
        let s: &str = &id;
        assert_eq!(s, "7");
        assert_eq!(format!("{id}"), "7");
    }

    #[test]
    fn serde_is_transparent() {
        let id = PrincipalId::from("user-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"user-42\"");
        let back: PrincipalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn into_string() {
        let s: String = ProjectId::from("p1").into();
        assert_eq!(s, "p1");
    }
}
