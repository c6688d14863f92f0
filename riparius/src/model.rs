//! Persistent data records for workflow instances
//!
//! These records are what the manager writes through the data-manager
//! boundary. The runner mutates them exclusively through actions inside a
//! transaction; nothing in the engine hard-deletes a row.

use crate::status::{StageStatus, StepStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Key/value memory attached to a workflow or a step
pub type Memory = HashMap<String, Value>;

/// Per-step memory, keyed by the step id rendered as a string
pub type StepMemory = HashMap<String, Memory>;

/// The durable row describing one workflow instance.
///
/// The embedded collections at the bottom are populated when an instance is
/// loaded back from storage; they are excluded from the row serialization
/// (steps, stages and memory live in their own collections).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowData {
    /// Immutable instance identity
    pub id: Uuid,
    /// Human title, defaulted from the definition
    pub title: String,
    /// Key of the workflow definition this instance was created from
    pub wfdef_key: String,
    /// Revision of the definition at creation time
    #[serde(default)]
    pub wfdef_rev: u32,
    /// Namespace of the owning definition
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the external resource the workflow is attached to
    pub resource_name: String,
    /// Identity of the external resource the workflow is attached to
    pub resource_id: Uuid,
    /// Current lifecycle status
    pub status: WorkflowStatus,
    /// The status to restore after `resume`
    #[serde(default)]
    pub paused: Option<WorkflowStatus>,
    /// Completion ratio in 0..1, recomputed by reconciliation
    #[serde(default)]
    pub progress: f64,
    /// Optimistic concurrency tag maintained by the storage layer
    #[serde(default)]
    pub etag: Option<String>,
    /// When the workflow was started
    #[serde(default)]
    pub ts_start: Option<DateTime<Utc>>,
    /// When the workflow expires, if an expiry is set
    #[serde(default)]
    pub ts_expire: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal status
    #[serde(default)]
    pub ts_finish: Option<DateTime<Utc>>,

    /// Steps loaded alongside the instance (not part of the row)
    #[serde(skip)]
    pub steps: Vec<StepData>,
    /// Stages loaded alongside the instance (not part of the row)
    #[serde(skip)]
    pub stages: Vec<StageData>,
    /// Creation parameters loaded alongside the instance
    #[serde(skip)]
    pub params: Memory,
    /// Workflow memory loaded alongside the instance
    #[serde(skip)]
    pub memory: Memory,
    /// Per-step memory loaded alongside the instance
    #[serde(skip)]
    pub stepsm: StepMemory,
}

/// The durable row describing one step of a workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    /// Step identity, derived deterministically from the step key
    pub id: Uuid,
    /// Creation ordinal within the instance, starting at 1
    pub index: u32,
    /// Human title, defaulted from the step definition
    pub title: String,
    /// Description taken from the step definition
    #[serde(default)]
    pub desc: Option<String>,
    /// Externally addressable correlation key, unique within the instance
    pub selector: Uuid,
    /// The owning workflow instance
    pub workflow_id: Uuid,
    /// The step-type identifier from the definition
    pub step_key: String,
    /// The stage this step belongs to
    pub stage_key: String,
    /// The step that spawned this one, if any
    #[serde(default)]
    pub src_step: Option<Uuid>,
    /// Free-form state-machine label scoped to the step type
    pub stm_state: String,
    /// Display label for the current state
    #[serde(default)]
    pub stm_label: Option<String>,
    /// Operator-facing message, typically set on error
    #[serde(default)]
    pub message: Option<String>,
    /// Current lifecycle status
    pub status: StepStatus,
    /// When the step is due
    #[serde(default)]
    pub ts_due: Option<DateTime<Utc>>,
    /// When the step was created
    #[serde(default)]
    pub ts_start: Option<DateTime<Utc>>,
    /// When the step reached a terminal status
    #[serde(default)]
    pub ts_finish: Option<DateTime<Utc>>,
    /// When the step last transitioned
    #[serde(default)]
    pub ts_transit: Option<DateTime<Utc>>,
}

/// The durable row describing one stage of a workflow instance.
///
/// Stages are created once per definition stage during `initialize` and are
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageData {
    /// Stage row identity
    pub id: Uuid,
    /// The owning workflow instance
    pub workflow_id: Uuid,
    /// Stage key, unique within the instance
    pub key: String,
    /// Human name
    pub stage_name: String,
    /// Free-form stage classification
    pub stage_type: String,
    /// Display ordering
    pub order: u32,
    /// Description from the definition
    #[serde(default)]
    pub desc: Option<String>,
    /// Status derived from the stage's steps
    #[serde(default)]
    pub status: StageStatus,
}

/// Audit record of one high-level action that ran against an instance.
///
/// Activities share the mutation counter, so interleaving them with the
/// mutation log reconstructs exactly what each action changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowActivity {
    /// The workflow the action ran against
    pub workflow_id: Uuid,
    /// The transaction the action ran inside
    pub transaction_id: Uuid,
    /// The action name
    pub activity_name: String,
    /// The action's arguments, when the action carries any
    #[serde(default)]
    pub activity_data: Option<Value>,
    /// The step the action was bound to, if any
    #[serde(default)]
    pub step_id: Option<Uuid>,
    /// The mutation counter value after the action's last mutation
    pub order: u64,
}

/// Free-text operator/workflow notification emitted by a lifecycle hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMessage {
    /// The workflow the message belongs to
    pub workflow_id: Uuid,
    /// When the message was emitted
    pub timestamp: DateTime<Utc>,
    /// The hook that produced the message
    pub source: String,
    /// The message text
    pub content: String,
}

/// The side record holding workflow parameters and memory, upserted by
/// `set-memory` mutations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMemory {
    /// Record identity (same as the workflow id)
    pub id: Uuid,
    /// The owning workflow instance
    pub workflow_id: Uuid,
    /// Creation parameters
    #[serde(default)]
    pub params: Memory,
    /// Workflow-level memory
    #[serde(default)]
    pub memory: Memory,
    /// Per-step memory
    #[serde(default)]
    pub stepsm: StepMemory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_row_excludes_embedded_collections() {
        let wf = WorkflowData {
            id: Uuid::new_v4(),
            title: "Review".to_string(),
            wfdef_key: "doc-review".to_string(),
            wfdef_rev: 1,
            namespace: None,
            resource_name: "document".to_string(),
            resource_id: Uuid::new_v4(),
            status: WorkflowStatus::New,
            paused: None,
            progress: 0.0,
            etag: None,
            ts_start: None,
            ts_expire: None,
            ts_finish: None,
            steps: Vec::new(),
            stages: Vec::new(),
            params: Memory::new(),
            memory: Memory::new(),
            stepsm: StepMemory::new(),
        };

        let row = serde_json::to_value(&wf).unwrap();
        assert!(row.get("steps").is_none());
        assert!(row.get("memory").is_none());
        assert_eq!(row["status"], "NEW");
        assert_eq!(row["wfdef_key"], "doc-review");
    }

    #[test]
    fn step_row_round_trips() {
        let step = StepData {
            id: Uuid::new_v4(),
            index: 1,
            title: "Prepare".to_string(),
            desc: None,
            selector: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            step_key: "prepare".to_string(),
            stage_key: "intake".to_string(),
            src_step: None,
            stm_state: "_CREATED".to_string(),
            stm_label: Some("NEW".to_string()),
            message: None,
            status: StepStatus::Active,
            ts_due: None,
            ts_start: Some(Utc::now()),
            ts_finish: None,
            ts_transit: None,
        };

        let json = serde_json::to_string(&step).unwrap();
        let back: StepData = serde_json::from_str(&json).unwrap();
        assert_eq!(step, back);
    }
}
