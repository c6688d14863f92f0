//! The workflow runner: a single instance's in-memory state machine
//!
//! A runner owns one workflow instance. Every change goes through an action
//! invoked inside an open transaction; actions emit mutations that are
//! applied to the in-memory state immediately and queued for persistence.
//! The runner itself is fully synchronous and never talks to storage; the
//! manager drains its queues through [`WorkflowRunner::commit`].

use crate::definition::{
    EventBinding, LifecycleHook, StepDef, WorkflowDefinition, BEGIN_LABEL, BEGIN_STATE,
    FINISH_STATE,
};
use crate::error::{ConfigurationError, ExecutionError, Result};
use crate::model::{
    Memory, StageData, StepData, WorkflowActivity, WorkflowData, WorkflowMessage,
};
use crate::mutation::{Mutation, MutationEnvelope};
use crate::status::{StepStatus, WorkflowStatus};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A participant attached to the workflow under a role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// The participant user
    pub user_id: Uuid,
    /// The role the user was added under
    pub role: String,
}

struct ActionCtx {
    name: String,
    step_id: Option<Uuid>,
}

struct TxnState {
    id: Uuid,
    mutation_mark: usize,
    activity_mark: usize,
    message_mark: usize,
}

/// The in-memory state machine for one workflow instance
pub struct WorkflowRunner {
    definition: Arc<WorkflowDefinition>,
    data: WorkflowData,
    participants: Vec<Participant>,
    selectors: HashMap<Uuid, Uuid>,
    step_counts: HashMap<String, u32>,
    mutation_order: u64,
    txn: Option<TxnState>,
    action: Option<ActionCtx>,
    mutations: Vec<MutationEnvelope>,
    activities: Vec<WorkflowActivity>,
    messages: Vec<WorkflowMessage>,
}

impl std::fmt::Debug for WorkflowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("workflow_id", &self.data.id)
            .field("wfdef_key", &self.data.wfdef_key)
            .field("status", &self.data.status)
            .field("steps", &self.data.steps.len())
            .field("pending_mutations", &self.mutations.len())
            .finish()
    }
}

impl WorkflowRunner {
    /// Creates a new workflow instance attached to a resource.
    ///
    /// Runs the `initialize` action inside an implicit transaction: the
    /// workflow row, the memory record seeded from `params`, and one stage
    /// row per declared stage are all queued as mutations. The returned
    /// runner is at status NEW with its transaction already closed.
    pub fn create_workflow(
        definition: Arc<WorkflowDefinition>,
        resource_name: impl Into<String>,
        resource_id: Uuid,
        params: Memory,
    ) -> Result<WorkflowRunner> {
        let data = WorkflowData {
            id: Uuid::new_v4(),
            title: definition.title.clone(),
            wfdef_key: definition.key.clone(),
            wfdef_rev: definition.revision,
            namespace: definition.namespace.clone(),
            resource_name: resource_name.into(),
            resource_id,
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
            stepsm: HashMap::new(),
        };

        let mut runner = WorkflowRunner {
            definition,
            data,
            participants: Vec::new(),
            selectors: HashMap::new(),
            step_counts: HashMap::new(),
            mutation_order: 0,
            txn: None,
            action: None,
            mutations: Vec::new(),
            activities: Vec::new(),
            messages: Vec::new(),
        };

        runner.begin_transaction()?;
        let result = runner.with_action("initialize", None, None, &[WorkflowStatus::New], |r| {
            let row = Box::new(r.data.clone());
            r.mutate(Mutation::InitializeWorkflow { workflow: row })?;
            r.mutate(Mutation::SetMemory {
                params: Some(params.clone()),
                memory: Some(params.clone()),
                stepsm: None,
            })?;
            let stages: Vec<Arc<crate::definition::StageDef>> = r.definition.stages.clone();
            for stage in stages {
                r.mutate(Mutation::AddStage {
                    stage: Box::new(StageData {
                        id: Uuid::new_v4(),
                        workflow_id: r.data.id,
                        key: stage.key.clone(),
                        stage_name: stage.name.clone(),
                        stage_type: stage.stage_type.clone(),
                        order: stage.order,
                        desc: stage.desc.clone(),
                        status: Default::default(),
                    }),
                })?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                runner.end_transaction();
                Ok(runner)
            }
            Err(e) => {
                runner.abort_transaction();
                Err(e)
            }
        }
    }

    /// Rehydrates a runner from a previously persisted instance.
    ///
    /// `data` must carry its embedded steps, stages, and memory;
    /// `mutation_order` is the highest order the instance has emitted so
    /// far, so new mutations continue the strictly increasing sequence.
    pub fn from_data(
        definition: Arc<WorkflowDefinition>,
        data: WorkflowData,
        mutation_order: u64,
    ) -> WorkflowRunner {
        let mut selectors = HashMap::new();
        let mut step_counts: HashMap<String, u32> = HashMap::new();
        for step in &data.steps {
            selectors.insert(step.selector, step.id);
            *step_counts.entry(step.step_key.clone()).or_insert(0) += 1;
        }
        WorkflowRunner {
            definition,
            data,
            participants: Vec::new(),
            selectors,
            step_counts,
            mutation_order,
            txn: None,
            action: None,
            mutations: Vec::new(),
            activities: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// The instance data, including embedded steps and memory
    pub fn data(&self) -> &WorkflowData {
        &self.data
    }

    /// The instance identity
    pub fn id(&self) -> Uuid {
        self.data.id
    }

    /// The current workflow status
    pub fn status(&self) -> WorkflowStatus {
        self.data.status
    }

    /// The definition this instance runs
    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    /// Participants added during this runner's lifetime
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// The highest mutation order emitted so far
    pub fn mutation_order(&self) -> u64 {
        self.mutation_order
    }

    // ---- transactions -----------------------------------------------------

    /// Opens a transaction; exactly one may be open at a time
    pub fn begin_transaction(&mut self) -> Result<Uuid> {
        if self.txn.is_some() {
            return Err(ExecutionError::TransactionAlreadyStarted.into());
        }
        let id = Uuid::new_v4();
        self.txn = Some(TxnState {
            id,
            mutation_mark: self.mutations.len(),
            activity_mark: self.activities.len(),
            message_mark: self.messages.len(),
        });
        Ok(id)
    }

    /// Closes the open transaction, keeping everything it queued
    pub fn end_transaction(&mut self) {
        self.txn = None;
    }

    /// Closes the open transaction and discards everything it queued
    pub fn abort_transaction(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.mutations.truncate(txn.mutation_mark);
            self.activities.truncate(txn.activity_mark);
            self.messages.truncate(txn.message_mark);
        }
    }

    /// Opens a transaction scoped to the returned guard
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.begin_transaction()?;
        Ok(Transaction {
            runner: self,
            closed: false,
        })
    }

    /// Drains the queued mutations, activities, and messages.
    ///
    /// Must be called with no transaction open; the manager persists the
    /// returned records inside one storage transaction.
    pub fn commit(
        &mut self,
    ) -> Result<(
        Vec<MutationEnvelope>,
        Vec<WorkflowActivity>,
        Vec<WorkflowMessage>,
    )> {
        if self.txn.is_some() {
            return Err(ExecutionError::TransactionAlreadyStarted.into());
        }
        Ok((
            std::mem::take(&mut self.mutations),
            std::mem::take(&mut self.activities),
            std::mem::take(&mut self.messages),
        ))
    }

    /// Whether the runner has queued records awaiting persistence
    pub fn has_pending(&self) -> bool {
        !self.mutations.is_empty() || !self.activities.is_empty() || !self.messages.is_empty()
    }

    // ---- action plumbing --------------------------------------------------

    fn with_action<T>(
        &mut self,
        action: &str,
        step_id: Option<Uuid>,
        activity_data: Option<Value>,
        allow: &[WorkflowStatus],
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let txn = self
            .txn
            .as_ref()
            .ok_or_else(|| ExecutionError::NoTransaction(action.to_string()))?;
        if !allow.contains(&self.data.status) {
            return Err(ExecutionError::StatusNotAllowed {
                action: action.to_string(),
                status: self.data.status.to_string(),
            }
            .into());
        }
        let transaction_id = txn.id;
        let marks = (
            txn.mutation_mark,
            txn.activity_mark,
            txn.message_mark,
        );

        self.action = Some(ActionCtx {
            name: action.to_string(),
            step_id,
        });
        let result = body(self);
        self.action = None;

        match result {
            Ok(value) => {
                self.activities.push(WorkflowActivity {
                    workflow_id: self.data.id,
                    transaction_id,
                    activity_name: action.to_string(),
                    activity_data,
                    step_id,
                    order: self.mutation_order,
                });
                Ok(value)
            }
            Err(e) => {
                // an action error unwinds everything the transaction queued
                self.mutations.truncate(marks.0);
                self.activities.truncate(marks.1);
                self.messages.truncate(marks.2);
                Err(e)
            }
        }
    }

    fn mutate(&mut self, mutation: Mutation) -> Result<()> {
        let ctx = self.action.as_ref().ok_or_else(|| {
            ExecutionError::MutationOutsideAction(mutation.name().to_string())
        })?;
        let txn = self
            .txn
            .as_ref()
            .ok_or_else(|| ExecutionError::NoTransaction(ctx.name.clone()))?;

        self.mutation_order += 1;
        debug_assert!(
            self.mutations
                .last()
                .map(|m| m.order < self.mutation_order)
                .unwrap_or(true),
            "mutation order must be strictly increasing"
        );
        let envelope = MutationEnvelope {
            workflow_id: self.data.id,
            transaction_id: txn.id,
            action: ctx.name.clone(),
            step_id: ctx.step_id,
            order: self.mutation_order,
            mutation,
        };
        self.apply(&envelope.mutation);
        self.mutations.push(envelope);
        Ok(())
    }

    fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::InitializeWorkflow { .. } => {}
            Mutation::SetState {
                status,
                paused,
                progress,
                ts_start,
                ts_expire,
                ts_finish,
            } => {
                if let Some(status) = status {
                    self.data.status = *status;
                }
                if let Some(paused) = paused {
                    self.data.paused = *paused;
                }
                if let Some(progress) = progress {
                    self.data.progress = *progress;
                }
                if let Some(ts) = ts_start {
                    self.data.ts_start = Some(*ts);
                }
                if let Some(ts) = ts_expire {
                    self.data.ts_expire = Some(*ts);
                }
                if let Some(ts) = ts_finish {
                    self.data.ts_finish = Some(*ts);
                }
            }
            Mutation::AddStep { step } => {
                self.selectors.insert(step.selector, step.id);
                *self.step_counts.entry(step.step_key.clone()).or_insert(0) += 1;
                self.data.steps.push((**step).clone());
            }
            Mutation::UpdateStep {
                step_id,
                status,
                stm_state,
                stm_label,
                message,
                ts_transit,
                ts_finish,
            } => {
                if let Some(step) = self.data.steps.iter_mut().find(|s| s.id == *step_id) {
                    if let Some(status) = status {
                        step.status = *status;
                    }
                    if let Some(state) = stm_state {
                        step.stm_state = state.clone();
                    }
                    if let Some(label) = stm_label {
                        step.stm_label = Some(label.clone());
                    }
                    if let Some(message) = message {
                        step.message = Some(message.clone());
                    }
                    if let Some(ts) = ts_transit {
                        step.ts_transit = Some(*ts);
                    }
                    if let Some(ts) = ts_finish {
                        step.ts_finish = Some(*ts);
                    }
                }
            }
            Mutation::SetMemory {
                params,
                memory,
                stepsm,
            } => {
                if let Some(params) = params {
                    self.data.params.extend(params.clone());
                }
                if let Some(memory) = memory {
                    self.data.memory.extend(memory.clone());
                }
                if let Some(stepsm) = stepsm {
                    for (step, entries) in stepsm {
                        self.data
                            .stepsm
                            .entry(step.clone())
                            .or_default()
                            .extend(entries.clone());
                    }
                }
            }
            Mutation::AddParticipant { user_id, role } => {
                self.participants.push(Participant {
                    user_id: *user_id,
                    role: role.clone(),
                });
            }
            Mutation::DelParticipant { user_id, role } => {
                // persistence removes a single found record; mirror that
                let pos = self.participants.iter().position(|p| {
                    user_id.map_or(true, |u| p.user_id == u)
                        && role.as_ref().map_or(true, |r| p.role == *r)
                });
                if let Some(pos) = pos {
                    self.participants.remove(pos);
                }
            }
            Mutation::AddStage { stage } => {
                self.data.stages.push((**stage).clone());
            }
        }
    }

    fn push_messages(&mut self, source: &str, contents: Vec<String>) {
        let now = Utc::now();
        for content in contents {
            self.messages.push(WorkflowMessage {
                workflow_id: self.data.id,
                timestamp: now,
                source: source.to_string(),
                content,
            });
        }
    }

    fn run_hook(&mut self, name: &str, hook: Option<LifecycleHook>) -> Result<()> {
        if let Some(hook) = hook {
            let mut scope = ActionScope {
                runner: &mut *self,
                step_id: None,
            };
            let messages = hook(&mut scope)?;
            self.push_messages(name, messages);
        }
        Ok(())
    }

    // ---- workflow-level actions -------------------------------------------

    /// Starts the workflow: runs the `on_started` hook, requires at least
    /// one step to exist afterwards, then moves the workflow to ACTIVE.
    ///
    /// The zero-steps check precedes the status mutation, so a definition
    /// that creates no initial steps fails while the workflow is still NEW.
    pub fn start(&mut self) -> Result<()> {
        self.with_action("start", None, None, &[WorkflowStatus::New], |r| {
            let hook = r.definition.hooks.on_started.clone();
            r.run_hook("on_started", hook)?;
            if r.data.steps.is_empty() {
                return Err(
                    ConfigurationError::NoStepsAfterStart(r.data.wfdef_key.clone()).into(),
                );
            }
            r.mutate(Mutation::SetState {
                status: Some(WorkflowStatus::Active),
                paused: None,
                progress: None,
                ts_start: Some(Utc::now()),
                ts_expire: None,
                ts_finish: None,
            })
        })
    }

    /// Runs a routed event binding against the workflow or, for step-bound
    /// bindings, against the step owning the selector
    pub fn trigger(
        &mut self,
        binding: &Arc<EventBinding>,
        event_data: &Value,
        step_selector: Option<Uuid>,
    ) -> Result<()> {
        let action = format!("trigger:{}", binding.event_name);
        let binding = Arc::clone(binding);
        let activity = Some(event_data.clone());
        self.with_action(
            &action,
            None,
            activity,
            WorkflowStatus::RUNNING,
            move |r| {
                let step_id = match (&binding.step_key, step_selector) {
                    (Some(_), Some(selector)) => Some(
                        r.selectors
                            .get(&selector)
                            .copied()
                            .ok_or(ExecutionError::UnknownSelector(selector))?,
                    ),
                    (Some(_), None) => {
                        return Err(ConfigurationError::StepRoutingMismatch {
                            event: binding.event_name.clone(),
                            workflow: r.data.wfdef_key.clone(),
                        }
                        .into());
                    }
                    (None, _) => None,
                };
                let handler = binding.handler.clone();
                let mut scope = ActionScope {
                    runner: &mut *r,
                    step_id,
                };
                let messages = handler(&mut scope, event_data)?;
                let source = format!("trigger:{}", binding.event_name);
                r.push_messages(&source, messages);
                r.reconcile()
            },
        )
    }

    /// Adds a participant under a role
    pub fn add_participant(&mut self, user_id: Uuid, role: impl Into<String>) -> Result<()> {
        let role = role.into();
        self.with_action(
            "add_participant",
            None,
            None,
            WorkflowStatus::EDITABLE,
            |r| {
                r.mutate(Mutation::AddParticipant {
                    user_id,
                    role: role.clone(),
                })
            },
        )
    }

    /// Removes one participant matching the given user and/or role
    pub fn del_participant(
        &mut self,
        user_id: Option<Uuid>,
        role: Option<String>,
    ) -> Result<()> {
        self.with_action(
            "del_participant",
            None,
            None,
            WorkflowStatus::EDITABLE,
            |r| r.mutate(Mutation::DelParticipant { user_id, role }),
        )
    }

    /// Pauses the workflow, remembering the current status for `resume`
    pub fn pause(&mut self) -> Result<()> {
        self.with_action("pause", None, None, &[WorkflowStatus::Active], |r| {
            let current = r.data.status;
            r.mutate(Mutation::SetState {
                status: Some(WorkflowStatus::Paused),
                paused: Some(Some(current)),
                progress: None,
                ts_start: None,
                ts_expire: None,
                ts_finish: None,
            })
        })
    }

    /// Restores the pre-pause status
    pub fn resume(&mut self) -> Result<()> {
        self.with_action("resume", None, None, &[WorkflowStatus::Paused], |r| {
            let restored = r.data.paused.unwrap_or(WorkflowStatus::Active);
            r.mutate(Mutation::SetState {
                status: Some(restored),
                paused: Some(None),
                progress: None,
                ts_start: None,
                ts_expire: None,
                ts_finish: None,
            })
        })
    }

    /// Cancels the workflow without an error condition
    pub fn cancel_workflow(&mut self) -> Result<()> {
        self.with_action(
            "cancel_workflow",
            None,
            None,
            WorkflowStatus::EDITABLE,
            |r| {
                let hook = r.definition.hooks.on_cancelled.clone();
                r.run_hook("on_cancelled", hook)?;
                r.mutate(Mutation::SetState {
                    status: Some(WorkflowStatus::Cancelled),
                    paused: None,
                    progress: None,
                    ts_start: None,
                    ts_expire: None,
                    ts_finish: Some(Utc::now()),
                })
            },
        )
    }

    /// Aborts a DEGRADED workflow: every unfinished step is ABORTED and
    /// the workflow ends FAILED
    pub fn abort_workflow(&mut self) -> Result<()> {
        self.with_action(
            "abort_workflow",
            None,
            None,
            &[WorkflowStatus::Degraded],
            |r| {
                let hook = r.definition.hooks.on_aborted.clone();
                r.run_hook("on_aborted", hook)?;
                let now = Utc::now();
                let open: Vec<Uuid> = r
                    .data
                    .steps
                    .iter()
                    .filter(|s| !s.status.is_finished())
                    .map(|s| s.id)
                    .collect();
                for step_id in open {
                    r.mutate(Mutation::UpdateStep {
                        step_id,
                        status: Some(StepStatus::Aborted),
                        stm_state: None,
                        stm_label: None,
                        message: None,
                        ts_transit: None,
                        ts_finish: Some(now),
                    })?;
                }
                r.mutate(Mutation::SetState {
                    status: Some(WorkflowStatus::Failed),
                    paused: None,
                    progress: None,
                    ts_start: None,
                    ts_expire: None,
                    ts_finish: Some(now),
                })
            },
        )
    }

    /// Adds a top-level step (no source step)
    pub fn workflow_add_step(
        &mut self,
        step_key: impl Into<String>,
        selector: Option<Uuid>,
    ) -> Result<Uuid> {
        let step_key = step_key.into();
        self.with_action("add_step", None, None, WorkflowStatus::EDITABLE, |r| {
            r.add_step_inner(&step_key, None, selector)
        })
    }

    /// Merges entries into the workflow memory
    pub fn workflow_set_memory(&mut self, entries: Memory) -> Result<()> {
        self.with_action("set_memory", None, None, WorkflowStatus::EDITABLE, |r| {
            r.mutate(Mutation::SetMemory {
                params: None,
                memory: Some(entries.clone()),
                stepsm: None,
            })
        })
    }

    /// Reads one workflow memory entry
    pub fn workflow_get_memory(&self, key: &str) -> Option<&Value> {
        self.data.memory.get(key)
    }

    /// Transitions a specific step from the workflow scope
    pub fn workflow_transit_step(&mut self, step_id: Uuid, state: &str) -> Result<()> {
        let state = state.to_string();
        self.with_action(
            "transit_step",
            Some(step_id),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                r.transit_inner(step_id, &state)?;
                r.reconcile()
            },
        )
    }

    // ---- step-level actions -----------------------------------------------

    /// Transitions a step to a new state
    pub fn step_transit(&mut self, step_id: Uuid, state: &str) -> Result<()> {
        let state = state.to_string();
        self.with_action(
            "step_transit",
            Some(step_id),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                r.transit_inner(step_id, &state)?;
                r.reconcile()
            },
        )
    }

    /// Adds a step spawned by an existing step
    pub fn step_add_step(
        &mut self,
        src_step: Uuid,
        step_key: impl Into<String>,
        selector: Option<Uuid>,
    ) -> Result<Uuid> {
        let step_key = step_key.into();
        self.with_action(
            "step_add_step",
            Some(src_step),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                let id = r.add_step_inner(&step_key, Some(src_step), selector)?;
                r.reconcile()?;
                Ok(id)
            },
        )
    }

    /// Merges entries into a step's memory
    pub fn step_set_memory(&mut self, step_id: Uuid, entries: Memory) -> Result<()> {
        self.with_action(
            "step_set_memory",
            Some(step_id),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                if !r.data.steps.iter().any(|s| s.id == step_id) {
                    return Err(ExecutionError::UnknownStep(step_id).into());
                }
                let mut stepsm = HashMap::new();
                stepsm.insert(step_id.to_string(), entries.clone());
                r.mutate(Mutation::SetMemory {
                    params: None,
                    memory: None,
                    stepsm: Some(stepsm),
                })
            },
        )
    }

    /// Reads one entry of a step's memory
    pub fn step_get_memory(&self, step_id: Uuid, key: &str) -> Option<&Value> {
        self.data.stepsm.get(&step_id.to_string())?.get(key)
    }

    /// Recovers a step out of ERROR back to ACTIVE
    pub fn recover_step(&mut self, step_id: Uuid) -> Result<()> {
        self.with_action(
            "recover_step",
            Some(step_id),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                let step = r
                    .data
                    .steps
                    .iter()
                    .find(|s| s.id == step_id)
                    .ok_or(ExecutionError::UnknownStep(step_id))?;
                if step.status != StepStatus::Error {
                    return Err(
                        ExecutionError::RecoverNonError(step.status.to_string()).into()
                    );
                }
                r.mutate(Mutation::UpdateStep {
                    step_id,
                    status: Some(StepStatus::Active),
                    stm_state: None,
                    stm_label: None,
                    message: None,
                    ts_transit: Some(Utc::now()),
                    ts_finish: None,
                })?;
                r.reconcile()
            },
        )
    }

    /// Marks a step SKIPPED; the workflow proceeds without it
    pub fn skip_step(&mut self, step_id: Uuid) -> Result<()> {
        self.with_action(
            "skip_step",
            Some(step_id),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                if !r.data.steps.iter().any(|s| s.id == step_id) {
                    return Err(ExecutionError::UnknownStep(step_id).into());
                }
                r.mutate(Mutation::UpdateStep {
                    step_id,
                    status: Some(StepStatus::Skipped),
                    stm_state: None,
                    stm_label: None,
                    message: None,
                    ts_transit: None,
                    ts_finish: Some(Utc::now()),
                })?;
                r.reconcile()
            },
        )
    }

    /// Marks a step ERROR with an operator-facing message
    pub fn fail_step(&mut self, step_id: Uuid, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.with_action(
            "fail_step",
            Some(step_id),
            None,
            WorkflowStatus::RUNNING,
            |r| {
                if !r.data.steps.iter().any(|s| s.id == step_id) {
                    return Err(ExecutionError::UnknownStep(step_id).into());
                }
                r.mutate(Mutation::UpdateStep {
                    step_id,
                    status: Some(StepStatus::Error),
                    stm_state: None,
                    stm_label: None,
                    message: Some(message.clone()),
                    ts_transit: Some(Utc::now()),
                    ts_finish: None,
                })?;
                r.reconcile()
            },
        )
    }

    // ---- internals --------------------------------------------------------

    fn add_step_inner(
        &mut self,
        step_key: &str,
        src_step: Option<Uuid>,
        selector: Option<Uuid>,
    ) -> Result<Uuid> {
        let step_def: Arc<StepDef> = self
            .definition
            .step(step_key)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownStepKey(step_key.to_string()))?;

        // deterministic identity: v5 in the workflow's namespace, with the
        // occurrence count appended for multi steps
        let step_id = if step_def.multi {
            let count = self.step_counts.get(step_key).copied().unwrap_or(0) + 1;
            let name = format!("{step_key}-{count}");
            Uuid::new_v5(&self.data.id, name.as_bytes())
        } else {
            let id = Uuid::new_v5(&self.data.id, step_key.as_bytes());
            if self.data.steps.iter().any(|s| s.id == id) {
                return Err(ExecutionError::StepAlreadyExists {
                    step_key: step_key.to_string(),
                    step_id: id,
                }
                .into());
            }
            id
        };

        let selector = selector.unwrap_or_else(Uuid::new_v4);
        if self.selectors.contains_key(&selector) {
            return Err(ExecutionError::DuplicateSelector {
                step_key: step_key.to_string(),
                selector,
            }
            .into());
        }

        let step = StepData {
            id: step_id,
            index: self.data.steps.len() as u32 + 1,
            title: step_def.title.clone(),
            desc: step_def.desc.clone(),
            selector,
            workflow_id: self.data.id,
            step_key: step_key.to_string(),
            stage_key: step_def.stage.clone(),
            src_step,
            stm_state: BEGIN_STATE.to_string(),
            stm_label: Some(BEGIN_LABEL.to_string()),
            message: None,
            status: StepStatus::Active,
            ts_due: None,
            ts_start: Some(Utc::now()),
            ts_finish: None,
            ts_transit: None,
        };
        self.mutate(Mutation::AddStep {
            step: Box::new(step),
        })?;
        Ok(step_id)
    }

    fn transit_inner(&mut self, step_id: Uuid, to_state: &str) -> Result<()> {
        let (step_key, from_state) = {
            let step = self
                .data
                .steps
                .iter()
                .find(|s| s.id == step_id)
                .ok_or(ExecutionError::UnknownStep(step_id))?;
            (step.step_key.clone(), step.stm_state.clone())
        };
        let step_def: Arc<StepDef> = self
            .definition
            .step(&step_key)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownStepKey(step_key.clone()))?;

        if !step_def.has_state(to_state) {
            return Err(ExecutionError::InvalidState {
                state: to_state.to_string(),
                allowed: step_def.states.clone(),
            }
            .into());
        }
        if to_state == from_state {
            warn!(
                step = %step_key,
                state = %to_state,
                "step already in target state, transition skipped"
            );
            return Ok(());
        }
        // the handler observes the step still at its origin state; the
        // update is applied only after the handler succeeds
        if let Some(transition) = step_def.transition(to_state) {
            if !transition.permits(&from_state) {
                return Err(ExecutionError::TransitionNotAllowed {
                    to_state: to_state.to_string(),
                    from_state,
                }
                .into());
            }
            let handler = transition.handler().clone();
            let mut scope = ActionScope {
                runner: &mut *self,
                step_id: Some(step_id),
            };
            let messages = handler(&mut scope, &from_state, to_state)?;
            let source = format!("{step_key}:{to_state}");
            self.push_messages(&source, messages);
        }

        let now = Utc::now();
        let finished = to_state == FINISH_STATE;
        // any destination short of the finish state reactivates the step,
        // so an errored step that moves on is no longer in error
        let status = if finished {
            Some(StepStatus::Completed)
        } else if to_state != BEGIN_STATE {
            Some(StepStatus::Active)
        } else {
            None
        };
        self.mutate(Mutation::UpdateStep {
            step_id,
            status,
            stm_state: Some(to_state.to_string()),
            stm_label: Some(step_def.state_label(to_state)),
            message: None,
            ts_transit: Some(now),
            ts_finish: finished.then_some(now),
        })?;
        Ok(())
    }

    /// Recomputes workflow status and progress from the step statuses.
    ///
    /// Runs after every step-level action. A workflow with steps can never
    /// reconcile back to NEW.
    fn reconcile(&mut self) -> Result<()> {
        if self.data.steps.is_empty() {
            return Err(ExecutionError::ReconcileToNew(self.data.id).into());
        }
        let total = self.data.steps.len();
        let finished = self
            .data
            .steps
            .iter()
            .filter(|s| s.status.is_finished())
            .count();
        let any_error = self
            .data
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Error);

        let target = if finished == total {
            WorkflowStatus::Completed
        } else if any_error {
            WorkflowStatus::Degraded
        } else {
            WorkflowStatus::Active
        };
        let progress = finished as f64 / total as f64;

        let status_change = WorkflowStatus::RUNNING.contains(&self.data.status)
            && target != self.data.status;
        let progress_change = (progress - self.data.progress).abs() > f64::EPSILON;
        if !status_change && !progress_change {
            return Ok(());
        }

        debug!(
            workflow = %self.data.id,
            status = %target,
            progress,
            "workflow reconciled"
        );
        self.mutate(Mutation::SetState {
            status: status_change.then_some(target),
            paused: None,
            progress: Some(progress),
            ts_start: None,
            ts_expire: None,
            ts_finish: (status_change && target == WorkflowStatus::Completed)
                .then(Utc::now),
        })
    }
}

/// RAII transaction guard; dropping it closes the transaction and keeps
/// everything it queued
pub struct Transaction<'a> {
    runner: &'a mut WorkflowRunner,
    closed: bool,
}

impl Transaction<'_> {
    /// Closes the transaction and discards everything it queued
    pub fn abort(mut self) {
        self.runner.abort_transaction();
        self.closed = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.runner.end_transaction();
        }
    }
}

impl std::ops::Deref for Transaction<'_> {
    type Target = WorkflowRunner;

    fn deref(&self) -> &WorkflowRunner {
        self.runner
    }
}

impl std::ops::DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut WorkflowRunner {
        self.runner
    }
}

/// The state proxy handed to hooks, event handlers, and transition
/// handlers.
///
/// A scope is bound either to the workflow as a whole or to one step;
/// memory operations target whichever the scope is bound to.
pub struct ActionScope<'a> {
    runner: &'a mut WorkflowRunner,
    step_id: Option<Uuid>,
}

impl ActionScope<'_> {
    /// The workflow instance identity
    pub fn workflow_id(&self) -> Uuid {
        self.runner.data.id
    }

    /// The step the scope is bound to, if any
    pub fn step_id(&self) -> Option<Uuid> {
        self.step_id
    }

    /// The current workflow status
    pub fn status(&self) -> WorkflowStatus {
        self.runner.data.status
    }

    /// The workflow's creation parameters
    pub fn params(&self) -> &Memory {
        &self.runner.data.params
    }

    /// Adds a step; when the scope is step-bound the new step records the
    /// bound step as its source
    pub fn add_step(&mut self, step_key: &str) -> Result<Uuid> {
        self.runner.add_step_inner(step_key, self.step_id, None)
    }

    /// Adds a step with an explicit external selector
    pub fn add_step_with_selector(&mut self, step_key: &str, selector: Uuid) -> Result<Uuid> {
        self.runner
            .add_step_inner(step_key, self.step_id, Some(selector))
    }

    /// Transitions the bound step to a new state
    pub fn transit(&mut self, state: &str) -> Result<()> {
        let step_id = self
            .step_id
            .ok_or_else(|| ExecutionError::NoBoundStep("transit".to_string()))?;
        self.runner.transit_inner(step_id, state)
    }

    /// Transitions an explicit step to a new state
    pub fn transit_step(&mut self, step_id: Uuid, state: &str) -> Result<()> {
        self.runner.transit_inner(step_id, state)
    }

    /// Merges entries into the bound step's memory, or the workflow memory
    /// for a workflow-bound scope
    pub fn set_memory(&mut self, entries: Memory) -> Result<()> {
        match self.step_id {
            Some(step_id) => {
                let mut stepsm = HashMap::new();
                stepsm.insert(step_id.to_string(), entries);
                self.runner.mutate(Mutation::SetMemory {
                    params: None,
                    memory: None,
                    stepsm: Some(stepsm),
                })
            }
            None => self.runner.mutate(Mutation::SetMemory {
                params: None,
                memory: Some(entries),
                stepsm: None,
            }),
        }
    }

    /// Reads one entry from the bound step's memory, or the workflow memory
    /// for a workflow-bound scope
    pub fn get_memory(&self, key: &str) -> Option<&Value> {
        match self.step_id {
            Some(step_id) => self.runner.step_get_memory(step_id, key),
            None => self.runner.workflow_get_memory(key),
        }
    }

    /// Reads one workflow memory entry regardless of binding
    pub fn get_workflow_memory(&self, key: &str) -> Option<&Value> {
        self.runner.workflow_get_memory(key)
    }
}
