//! The closed set of mutations a workflow instance can emit
//!
//! Every change to durable workflow state is expressed as one of these
//! payloads, wrapped in an envelope that stamps provenance and ordering.
//! The enum is closed on purpose: an unknown mutation name cannot be
//! constructed, so the persistence dispatch table is total.

use crate::model::{Memory, StageData, StepData, StepMemory, WorkflowData};
use crate::status::{StepStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single durable state change, tagged by mutation name.
///
/// Serialized with the discriminant in a `name` field so the envelope's
/// flattened payload carries the name at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Mutation {
    /// Creates the workflow row itself; the first mutation of every instance
    InitializeWorkflow {
        /// The full initial workflow record
        workflow: Box<WorkflowData>,
    },

    /// Updates status, pause bookkeeping, progress, and lifecycle timestamps
    /// on the workflow row
    SetState {
        /// New lifecycle status, if changing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<WorkflowStatus>,
        /// Pre-pause status to remember, wrapped so `resume` can clear it
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "double_option"
        )]
        paused: Option<Option<WorkflowStatus>>,
        /// Recomputed completion ratio
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        /// Start timestamp, set once by `start`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_start: Option<DateTime<Utc>>,
        /// Expiry timestamp
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_expire: Option<DateTime<Utc>>,
        /// Finish timestamp, set when a terminal status is reached
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_finish: Option<DateTime<Utc>>,
    },

    /// Inserts a new step row
    AddStep {
        /// The full initial step record
        step: Box<StepData>,
    },

    /// Updates mutable fields of an existing step row
    UpdateStep {
        /// The step being updated
        step_id: Uuid,
        /// New step status
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<StepStatus>,
        /// New state-machine state
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stm_state: Option<String>,
        /// New display label
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stm_label: Option<String>,
        /// New operator-facing message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Transition timestamp
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_transit: Option<DateTime<Utc>>,
        /// Finish timestamp for terminal statuses
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_finish: Option<DateTime<Utc>>,
    },

    /// Upserts the workflow memory side record
    SetMemory {
        /// Creation parameters, when written
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Memory>,
        /// Workflow-level memory entries to merge
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<Memory>,
        /// Per-step memory entries to merge
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stepsm: Option<StepMemory>,
    },

    /// Adds a participant under a declared role
    AddParticipant {
        /// The participant user
        user_id: Uuid,
        /// The role the user is added under
        role: String,
    },

    /// Removes one participant record matching the given fields
    DelParticipant {
        /// Restrict the removal to one user
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
        /// Restrict the removal to one role
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },

    /// Inserts a stage row during initialization
    AddStage {
        /// The full stage record
        stage: Box<StageData>,
    },
}

/// Distinguishes an absent field from an explicit `null`: a present
/// `null` means "clear the value", absence means "leave it alone".
fn double_option<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl Mutation {
    /// The mutation's wire name, matching the serde tag
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::InitializeWorkflow { .. } => "initialize-workflow",
            Mutation::SetState { .. } => "set-state",
            Mutation::AddStep { .. } => "add-step",
            Mutation::UpdateStep { .. } => "update-step",
            Mutation::SetMemory { .. } => "set-memory",
            Mutation::AddParticipant { .. } => "add-participant",
            Mutation::DelParticipant { .. } => "del-participant",
            Mutation::AddStage { .. } => "add-stage",
        }
    }
}

/// A mutation plus the provenance needed to audit and replay it.
///
/// `order` is strictly increasing within one workflow instance across all
/// transactions; the first mutation of an instance has `order == 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    /// The instance the mutation applies to
    pub workflow_id: Uuid,
    /// The transaction that produced the mutation
    pub transaction_id: Uuid,
    /// The action that produced the mutation
    pub action: String,
    /// The step the producing action was bound to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    /// Position in the instance's total mutation order
    pub order: u64,
    /// The mutation payload; its `name` tag lands at the envelope level
    #[serde(flatten)]
    pub mutation: Mutation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_names_match_serde_tags() {
        let m = Mutation::SetMemory {
            params: None,
            memory: Some(Memory::new()),
            stepsm: None,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["name"], m.name());
        assert_eq!(v["name"], "set-memory");

        let m = Mutation::DelParticipant {
            user_id: None,
            role: None,
        };
        assert_eq!(serde_json::to_value(&m).unwrap()["name"], "del-participant");
    }

    #[test]
    fn envelope_flattens_the_payload_tag() {
        let env = MutationEnvelope {
            workflow_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            action: "add_participant".to_string(),
            step_id: None,
            order: 7,
            mutation: Mutation::AddParticipant {
                user_id: Uuid::new_v4(),
                role: "reviewer".to_string(),
            },
        };

        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["name"], "add-participant");
        assert_eq!(v["order"], 7);
        assert_eq!(v["role"], "reviewer");

        let back: MutationEnvelope = serde_json::from_value(v).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn paused_null_survives_a_round_trip() {
        // resume clears the pause marker with an explicit null; replaying
        // the envelope must reproduce the clear, not a no-op
        let m = Mutation::SetState {
            status: Some(WorkflowStatus::Active),
            paused: Some(None),
            progress: None,
            ts_start: None,
            ts_expire: None,
            ts_finish: None,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("paused").is_some_and(|p| p.is_null()));

        let back: Mutation = serde_json::from_value(v).unwrap();
        assert_eq!(back, m);

        // an absent field still deserializes to "leave it alone"
        let absent: Mutation =
            serde_json::from_value(serde_json::json!({"name": "set-state"})).unwrap();
        let Mutation::SetState { paused, .. } = absent else {
            panic!("wrong variant");
        };
        assert_eq!(paused, None);
    }

    #[test]
    fn set_state_omits_unset_fields() {
        let m = Mutation::SetState {
            status: Some(WorkflowStatus::Active),
            paused: None,
            progress: None,
            ts_start: None,
            ts_expire: None,
            ts_finish: None,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["status"], "ACTIVE");
        assert!(v.get("progress").is_none());
        assert!(v.get("ts_finish").is_none());
    }
}
