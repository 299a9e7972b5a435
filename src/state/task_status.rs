/// Task lifecycle states
///
/// This module defines every state a harvest task can be in and which moves
/// between them are legal.
use std::fmt;

/// Represents the current state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    // ===== Active States =====
    /// Task is waiting in the dispatch queue
    Pending,

    /// Task has a live worker pool
    Running,

    /// Task stopped at an item boundary and can be resumed
    Paused,

    // ===== Terminal States =====
    /// Every work item finished (completed or failed with a placeholder)
    Completed,

    /// Task hit an error unrelated to credential exhaustion
    Failed,

    /// Task was cancelled by the user
    Cancelled,
}

impl TaskStatus {
    /// Returns true if this is a terminal state (no further processing)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if this task may still make progress
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if moving from `self` to `next` is a legal transition
    ///
    /// ```text
    /// pending -> running <-> paused -> { completed | failed | cancelled }
    /// ```
    ///
    /// A paused task re-enters through `pending` when it is queued for resume.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Paused)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Pending)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a status from its database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns all possible task statuses
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Running,
            Self::Paused,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_string(s).ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());

        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_db_string_roundtrip() {
        for status in TaskStatus::all_states() {
            let db_str = status.to_db_string();
            assert_eq!(TaskStatus::from_db_string(db_str), Some(status));
        }
        assert_eq!(TaskStatus::from_db_string("unknown"), None);
    }

    #[test]
    fn test_running_and_paused_alternate() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for from in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for to in TaskStatus::all_states() {
                assert!(
                    !from.can_transition_to(to),
                    "{} -> {} should be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_from_str() {
        assert_eq!("paused".parse::<TaskStatus>(), Ok(TaskStatus::Paused));
        assert!("sleeping".parse::<TaskStatus>().is_err());
    }
}
