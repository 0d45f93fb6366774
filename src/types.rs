//! NewType wrappers for the identifiers that cross the wire.
//!
//! Node ids, step ids and task ids are all plain strings on the wire; the
//! wrappers keep them from being mixed up inside the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// True when the identifier is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Identifier a worker node registers under.
    ///
    /// Unique within a registry. Re-registering the same id replaces the
    /// previous entry.
    NodeId
);

newtype_string!(
    /// Identifier of a step inside one plan (e.g. "reasoning").
    StepId
);

newtype_string!(
    /// Identifier of a submitted task. Generated as a v4 UUID when the
    /// caller does not supply one.
    TaskId
);

impl TaskId {
    /// Generate a fresh random task id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_creation() {
        let id = NodeId::new("reasoning-1");
        assert_eq!(id.as_str(), "reasoning-1");
        assert_eq!(id.to_string(), "reasoning-1");
    }

    #[test]
    fn test_step_id_from_string() {
        let id: StepId = "reasoning".into();
        assert_eq!(id.as_str(), "reasoning");

        let id: StepId = String::from("memory_read").into();
        assert_eq!(id.into_inner(), "memory_read");
    }

    #[test]
    fn test_node_id_serde_is_transparent() {
        let id = NodeId::new("mem-a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"mem-a\"");

        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut ids = vec![NodeId::new("r2"), NodeId::new("r10"), NodeId::new("r1")];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(ordered, vec!["r1", "r10", "r2"]);
    }

    #[test]
    fn test_blank_detection() {
        assert!(NodeId::new("  ").is_blank());
        assert!(!NodeId::new("n").is_blank());
    }

    #[test]
    fn test_generated_task_ids_are_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_borrow() {
        use std::borrow::Borrow;
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(StepId::new("reasoning"), 1);
        let key = StepId::new("reasoning");
        let s: &str = key.borrow();
        assert_eq!(map.get(s), Some(&1));
    }
}
