//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(TaskId, "tsk");
define_id!(RunId, "run");
define_id!(DispatchId, "dsp");

macro_rules! define_name_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

define_name_id!(AgentId);
define_name_id!(NodeId);

/// Target of a status query or cancellation: a single task or a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Task(TaskId),
    Run(RunId),
}

impl From<TaskId> for Target {
    fn from(id: TaskId) -> Self {
        Target::Task(id)
    }
}

impl From<RunId> for Target {
    fn from(id: RunId) -> Self {
        Target::Run(id)
    }
}

impl std::str::FromStr for Target {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.starts_with("run_") {
            Ok(Target::Run(s.parse()?))
        } else {
            Ok(Target::Task(s.parse()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new();
        assert!(id.to_string().starts_with("tsk_"));
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_target_parse_by_prefix() {
        let run = RunId::new();
        let task = TaskId::new();
        assert_eq!(run.to_string().parse::<Target>().unwrap(), Target::Run(run));
        assert_eq!(task.to_string().parse::<Target>().unwrap(), Target::Task(task));
    }

    #[test]
    fn test_agent_id_ordering_is_lexicographic() {
        let mut ids = vec![AgentId::new("b"), AgentId::new("a"), AgentId::new("c")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "a");
    }
}
