//! Task lease state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a row in the task list.
///
/// Stored in the database as the variant name (`Pending`, `Running`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Leased by exactly one worker.
    Running,
    /// Simulation succeeded and the artifact was written.
    Finished,
    /// Simulation failed; the comment column says why.
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [Self::Pending, Self::Running, Self::Finished, Self::Error];

    /// Statuses allowed to move to `target`.
    pub fn sources_of(target: TaskStatus) -> impl Iterator<Item = TaskStatus> {
        Self::ALL.into_iter().filter(move |s| s.can_transition_to(target))
    }

    /// Check if this status allows transitioning to another status.
    ///
    /// The edges back to `Pending` exist only for operator requeue.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running)
                | (Running, Finished)
                | (Running, Error)
                // Operator requeue
                | (Running, Pending)
                | (Error, Pending)
        )
    }

    /// Text stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Finished" => Ok(Self::Finished),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown task status {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Finished));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Error));
        assert!(TaskStatus::Error.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Finished));
        assert!(!TaskStatus::Finished.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Finished.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Error.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn sources_follow_the_edges() {
        let into = |target| TaskStatus::sources_of(target).collect::<Vec<_>>();
        assert_eq!(into(TaskStatus::Running), vec![TaskStatus::Pending]);
        assert_eq!(into(TaskStatus::Finished), vec![TaskStatus::Running]);
        assert_eq!(into(TaskStatus::Error), vec![TaskStatus::Running]);
        assert_eq!(into(TaskStatus::Pending), vec![TaskStatus::Running, TaskStatus::Error]);
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Finished,
            TaskStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }
}
