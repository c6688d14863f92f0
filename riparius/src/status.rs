//! Status vocabularies for workflows, steps, and stages

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance.
///
/// Transitions:
/// - start of workflow: NEW -> ACTIVE
/// - active workflow: ACTIVE -> COMPLETED | CANCELLED | DEGRADED | PAUSED
/// - degraded workflow: DEGRADED -> ACTIVE | FAILED
/// - terminal: COMPLETED | CANCELLED | FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// No step created yet, workflow not yet active
    New,
    /// Steps are either active or finished
    Active,
    /// Suspended by an operator; the pre-pause status is remembered
    Paused,
    /// One or more steps are in error state
    Degraded,
    /// An unrecoverable error was acknowledged by an operator
    Failed,
    /// All steps finished
    Completed,
    /// Cancelled by an operator without an error
    Cancelled,
}

impl WorkflowStatus {
    /// Statuses in which the workflow accepts external events
    pub const RUNNING: &'static [WorkflowStatus] =
        &[WorkflowStatus::Active, WorkflowStatus::Degraded];

    /// Statuses in which participants and structure may still be edited
    pub const EDITABLE: &'static [WorkflowStatus] = &[
        WorkflowStatus::New,
        WorkflowStatus::Active,
        WorkflowStatus::Degraded,
    ];

    /// Whether the workflow accepts external events
    pub fn is_active(self) -> bool {
        Self::RUNNING.contains(&self)
    }

    /// Whether participants and structure may still be edited
    pub fn is_editable(self) -> bool {
        Self::EDITABLE.contains(&self)
    }

    /// Whether the workflow has reached a terminal status
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled | WorkflowStatus::Failed
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::New => "NEW",
            WorkflowStatus::Active => "ACTIVE",
            WorkflowStatus::Paused => "PAUSED",
            WorkflowStatus::Degraded => "DEGRADED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a step within a workflow instance.
///
/// A step in ERROR state is an expected business condition: it can be
/// recovered back to ACTIVE, skipped, or the whole workflow aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Ready to accept events
    Active,
    /// Encountered an error, waiting for operator confirmation
    Error,
    /// Terminated together with an aborted workflow
    Aborted,
    /// Completed successfully
    Completed,
    /// Operator skipped the step; the workflow continues without it
    Skipped,
}

impl StepStatus {
    /// Whether the step no longer counts toward remaining work
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Aborted
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Active => "ACTIVE",
            StepStatus::Error => "ERROR",
            StepStatus::Aborted => "ABORTED",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// Status of a stage, derived from the statuses of its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// There are remaining unfinished steps
    #[default]
    Active,
    /// One or more steps are in error state
    Error,
    /// Everything finished
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_status_predicates() {
        assert!(WorkflowStatus::Completed.is_finished());
        assert!(WorkflowStatus::Cancelled.is_finished());
        assert!(WorkflowStatus::Failed.is_finished());
        assert!(!WorkflowStatus::Degraded.is_finished());

        assert!(WorkflowStatus::New.is_editable());
        assert!(!WorkflowStatus::New.is_active());
        assert!(WorkflowStatus::Degraded.is_active());
    }

    #[test]
    fn step_status_finished_set() {
        assert!(StepStatus::Completed.is_finished());
        assert!(StepStatus::Skipped.is_finished());
        assert!(StepStatus::Aborted.is_finished());
        assert!(!StepStatus::Active.is_finished());
        assert!(!StepStatus::Error.is_finished());
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let s = serde_json::to_string(&WorkflowStatus::Degraded).unwrap();
        assert_eq!(s, "\"DEGRADED\"");
        let s = serde_json::to_string(&StepStatus::Skipped).unwrap();
        assert_eq!(s, "\"SKIPPED\"");
    }
}
