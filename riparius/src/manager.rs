//! The workflow manager: the async front door of the engine
//!
//! The manager owns the live runners, resolves events into triggers via the
//! router, and is the only component that talks to storage. Each workflow
//! commit drains the runner's queues and writes every record inside one
//! storage transaction, dispatching each mutation by name to the collection
//! it maintains.

use crate::definition::{DefinitionMeta, DefinitionRegistry, WorkflowDefinition};
use crate::error::{ExecutionError, Result, StorageError, WorkflowError};
use crate::model::{
    Memory, StageData, StepData, StepMemory, WorkflowActivity, WorkflowData, WorkflowMemory,
    WorkflowMessage,
};
use crate::mutation::{Mutation, MutationEnvelope};
use crate::router::{EventRouter, WorkflowTrigger};
use crate::runner::WorkflowRunner;
use crate::status::WorkflowStatus;
use crate::storage::{
    StorageTransaction, WorkflowDataManager, WORKFLOW, WORKFLOW_ACTIVITY, WORKFLOW_MEMORY,
    WORKFLOW_MESSAGE, WORKFLOW_MUTATION, WORKFLOW_PARTICIPANT, WORKFLOW_STAGE, WORKFLOW_STEP,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of a workflow attached to an external resource
type ResourceKey = (String, String, Uuid);

/// Coordinates runners, routing, and persistence for one set of workflow
/// definitions
pub struct WorkflowManager {
    registry: DefinitionRegistry,
    router: EventRouter,
    data_manager: Arc<dyn WorkflowDataManager>,
    runners: HashMap<Uuid, WorkflowRunner>,
    resource_index: HashMap<ResourceKey, Uuid>,
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("registry", &self.registry)
            .field("cached_runners", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowManager {
    /// Builds a manager over a registry and a persistence backend; the
    /// routing table is derived from the registry once, here
    pub fn new(registry: DefinitionRegistry, data_manager: Arc<dyn WorkflowDataManager>) -> Self {
        let router = EventRouter::from_registry(&registry);
        WorkflowManager {
            registry,
            router,
            data_manager,
            runners: HashMap::new(),
            resource_index: HashMap::new(),
        }
    }

    /// The definition registry this manager serves
    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    /// The event routing table
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Serializable metadata for every registered definition
    pub fn gen_wfdefs(&self) -> Vec<DefinitionMeta> {
        self.registry.metadata()
    }

    /// The cached runner for a workflow id, if loaded
    pub fn runner(&self, workflow_id: Uuid) -> Option<&WorkflowRunner> {
        self.runners.get(&workflow_id)
    }

    /// Mutable access to a cached runner
    pub fn runner_mut(&mut self, workflow_id: Uuid) -> Option<&mut WorkflowRunner> {
        self.runners.get_mut(&workflow_id)
    }

    fn definition(&self, wfdef_key: &str) -> Result<Arc<WorkflowDefinition>> {
        self.registry
            .get(wfdef_key)
            .ok_or_else(|| ExecutionError::UnknownDefinition(wfdef_key.to_string()).into())
    }

    fn index_runner(&mut self, runner: WorkflowRunner) -> Uuid {
        let id = runner.id();
        let key = (
            runner.data().wfdef_key.clone(),
            runner.data().resource_name.clone(),
            runner.data().resource_id,
        );
        self.resource_index.insert(key, id);
        self.runners.insert(id, runner);
        id
    }

    /// Drops a runner from both caches; the next load re-hydrates it from
    /// the last committed state
    fn evict_runner(&mut self, workflow_id: Uuid) {
        if let Some(runner) = self.runners.remove(&workflow_id) {
            let key = (
                runner.data().wfdef_key.clone(),
                runner.data().resource_name.clone(),
                runner.data().resource_id,
            );
            self.resource_index.remove(&key);
            warn!(workflow = %workflow_id, "runner discarded after action error");
        }
    }

    fn drive_trigger(
        runner: &mut WorkflowRunner,
        trigger: &WorkflowTrigger,
        event_data: &Value,
    ) -> Result<()> {
        let mut txn = runner.transaction()?;
        if txn.status() == WorkflowStatus::New {
            txn.start()?;
        }
        txn.trigger(&trigger.binding, event_data, trigger.step_selector)?;
        Ok(())
    }

    /// Creates a new workflow instance attached to a resource and caches
    /// its runner. The instance is NEW with its initialization mutations
    /// queued; nothing is persisted until [`WorkflowManager::commit_workflow`].
    pub fn create_workflow(
        &mut self,
        wfdef_key: &str,
        resource_name: impl Into<String>,
        resource_id: Uuid,
        params: Memory,
    ) -> Result<Uuid> {
        let definition = self.definition(wfdef_key)?;
        let runner =
            WorkflowRunner::create_workflow(definition, resource_name, resource_id, params)?;
        info!(workflow = %runner.id(), wfdef = %wfdef_key, "workflow created");
        Ok(self.index_runner(runner))
    }

    /// Resolves the workflow attached to a resource, from cache or storage
    pub async fn load_workflow(
        &mut self,
        wfdef_key: &str,
        resource_name: &str,
        resource_id: Uuid,
    ) -> Result<Uuid> {
        let key = (
            wfdef_key.to_string(),
            resource_name.to_string(),
            resource_id,
        );
        if let Some(id) = self.resource_index.get(&key) {
            return Ok(*id);
        }
        let filter = json!({
            "wfdef_key": wfdef_key,
            "resource_name": resource_name,
            "resource_id": resource_id,
        });
        let row = self
            .data_manager
            .find_one(WORKFLOW, &filter)
            .await
            .map_err(|e| match e {
                WorkflowError::Storage(StorageError::NotFound { .. }) => {
                    ExecutionError::WorkflowNotFound(format!(
                        "{wfdef_key}/{resource_name}/{resource_id}"
                    ))
                    .into()
                }
                other => other,
            })?;
        self.hydrate(row).await
    }

    /// Loads a workflow by its id, from cache or storage
    pub async fn load_workflow_by_id(&mut self, workflow_id: Uuid) -> Result<Uuid> {
        if self.runners.contains_key(&workflow_id) {
            return Ok(workflow_id);
        }
        let row = self
            .data_manager
            .find_one(WORKFLOW, &json!({ "id": workflow_id }))
            .await
            .map_err(|e| match e {
                WorkflowError::Storage(StorageError::NotFound { .. }) => {
                    ExecutionError::WorkflowNotFound(workflow_id.to_string()).into()
                }
                other => other,
            })?;
        self.hydrate(row).await
    }

    async fn hydrate(&mut self, row: Value) -> Result<Uuid> {
        let mut data: WorkflowData =
            serde_json::from_value(row).map_err(StorageError::Serialization)?;
        let workflow_id = data.id;
        let by_workflow = json!({ "workflow_id": workflow_id });

        let mut steps: Vec<StepData> = Vec::new();
        for row in self
            .data_manager
            .find_many(WORKFLOW_STEP, &by_workflow)
            .await?
        {
            steps.push(serde_json::from_value(row).map_err(StorageError::Serialization)?);
        }
        steps.sort_by_key(|s| s.index);
        data.steps = steps;

        let mut stages: Vec<StageData> = Vec::new();
        for row in self
            .data_manager
            .find_many(WORKFLOW_STAGE, &by_workflow)
            .await?
        {
            stages.push(serde_json::from_value(row).map_err(StorageError::Serialization)?);
        }
        stages.sort_by_key(|s| s.order);
        data.stages = stages;

        match self
            .data_manager
            .find_one(WORKFLOW_MEMORY, &by_workflow)
            .await
        {
            Ok(row) => {
                data.params = serde_json::from_value(row["params"].clone())
                    .map_err(StorageError::Serialization)?;
                data.memory = serde_json::from_value(row["memory"].clone())
                    .map_err(StorageError::Serialization)?;
                data.stepsm = serde_json::from_value(row["stepsm"].clone())
                    .map_err(StorageError::Serialization)?;
            }
            Err(WorkflowError::Storage(StorageError::NotFound { .. })) => {}
            Err(e) => return Err(e),
        }

        // new mutations continue the instance's strictly increasing order
        let mutation_order = self
            .data_manager
            .find_many(WORKFLOW_MUTATION, &by_workflow)
            .await?
            .iter()
            .filter_map(|r| r["order"].as_u64())
            .max()
            .unwrap_or(0);

        let definition = self.definition(&data.wfdef_key)?;
        let runner = WorkflowRunner::from_data(definition, data, mutation_order);
        debug!(workflow = %workflow_id, order = mutation_order, "workflow hydrated");
        Ok(self.index_runner(runner))
    }

    /// Routes an external event and triggers every matching workflow.
    ///
    /// A workflow that does not exist yet for the routed resource is created
    /// with empty parameters, and a workflow still at NEW is started before
    /// the event handler runs. Returns the ids of the triggered workflows;
    /// their queued records remain pending until committed.
    pub async fn process_event(
        &mut self,
        event_name: &str,
        event_data: &Value,
    ) -> Result<Vec<Uuid>> {
        let triggers = self.router.route_event(event_name, event_data, None)?;
        let mut triggered = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let workflow_id = match self
                .load_workflow(&trigger.wfdef_key, &trigger.resource_name, trigger.resource_id)
                .await
            {
                Ok(id) => id,
                Err(WorkflowError::Execution(ExecutionError::WorkflowNotFound(_))) => self
                    .create_workflow(
                        &trigger.wfdef_key,
                        trigger.resource_name.clone(),
                        trigger.resource_id,
                        Memory::new(),
                    )?,
                Err(e) => return Err(e),
            };

            let runner = self
                .runners
                .get_mut(&workflow_id)
                .ok_or_else(|| ExecutionError::WorkflowNotFound(workflow_id.to_string()))?;
            // a failed action leaves the runner's in-memory state ahead of
            // its queues, so the cached copy cannot be committed anymore
            if let Err(e) = Self::drive_trigger(runner, &trigger, event_data) {
                self.evict_runner(workflow_id);
                return Err(e);
            }
            triggered.push(workflow_id);
        }
        Ok(triggered)
    }

    /// Persists everything a runner has queued, inside one storage
    /// transaction
    pub async fn commit_workflow(&mut self, workflow_id: Uuid) -> Result<()> {
        let runner = self
            .runners
            .get_mut(&workflow_id)
            .ok_or_else(|| ExecutionError::WorkflowNotFound(workflow_id.to_string()))?;
        let (mutations, activities, messages) = runner.commit()?;
        if mutations.is_empty() && activities.is_empty() && messages.is_empty() {
            return Ok(());
        }
        // the runner has already applied every mutation, so its memory view
        // is the final state this commit must leave behind
        let memory_snapshot = (
            runner.data().params.clone(),
            runner.data().memory.clone(),
            runner.data().stepsm.clone(),
        );

        let mut txn = self.data_manager.transaction().await?;
        let persisted = persist(
            &mut txn,
            workflow_id,
            &mutations,
            &activities,
            &messages,
            memory_snapshot,
        )
        .await;
        match persisted {
            Ok(()) => {
                txn.commit().await?;
                info!(
                    workflow = %workflow_id,
                    mutations = mutations.len(),
                    activities = activities.len(),
                    messages = messages.len(),
                    "workflow committed"
                );
                Ok(())
            }
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    /// Persists every cached runner with pending records
    pub async fn commit(&mut self) -> Result<Vec<Uuid>> {
        let pending: Vec<Uuid> = self
            .runners
            .iter()
            .filter(|(_, r)| r.has_pending())
            .map(|(id, _)| *id)
            .collect();
        for workflow_id in &pending {
            self.commit_workflow(*workflow_id).await?;
        }
        Ok(pending)
    }
}

fn changes_without(mutation: &Mutation, drop: &[&str]) -> Result<Value> {
    let mut value = serde_json::to_value(mutation).map_err(StorageError::Serialization)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("name");
        for key in drop {
            fields.remove(*key);
        }
    }
    Ok(value)
}

fn to_row<T: serde::Serialize>(record: &T) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| StorageError::Serialization(e).into())
}

/// Writes one drained commit batch through a storage transaction, one
/// collection per mutation name
async fn persist(
    txn: &mut Box<dyn StorageTransaction>,
    workflow_id: Uuid,
    mutations: &[MutationEnvelope],
    activities: &[WorkflowActivity],
    messages: &[WorkflowMessage],
    memory_snapshot: (Memory, Memory, StepMemory),
) -> Result<()> {
    let mut memory_dirty = false;
    for envelope in mutations {
        txn.insert(WORKFLOW_MUTATION, to_row(envelope)?).await?;
        match &envelope.mutation {
            Mutation::InitializeWorkflow { workflow } => {
                txn.insert(WORKFLOW, to_row(workflow.as_ref())?).await?;
            }
            Mutation::SetState { .. } => {
                let changes = changes_without(&envelope.mutation, &[])?;
                txn.update_one(WORKFLOW, json!({ "id": workflow_id }), changes)
                    .await?;
            }
            Mutation::AddStep { step } => {
                txn.insert(WORKFLOW_STEP, to_row(step.as_ref())?).await?;
            }
            Mutation::UpdateStep { step_id, .. } => {
                let changes = changes_without(&envelope.mutation, &["step_id"])?;
                txn.update_one(
                    WORKFLOW_STEP,
                    json!({ "id": step_id, "workflow_id": workflow_id }),
                    changes,
                )
                .await?;
            }
            Mutation::SetMemory { .. } => {
                memory_dirty = true;
            }
            Mutation::AddParticipant { user_id, role } => {
                txn.insert(
                    WORKFLOW_PARTICIPANT,
                    json!({
                        "workflow_id": workflow_id,
                        "user_id": user_id,
                        "role": role,
                    }),
                )
                .await?;
            }
            Mutation::DelParticipant { user_id, role } => {
                let mut filter = json!({ "workflow_id": workflow_id });
                if let (Some(fields), Some(user_id)) = (filter.as_object_mut(), user_id) {
                    fields.insert("user_id".to_string(), json!(user_id));
                }
                if let (Some(fields), Some(role)) = (filter.as_object_mut(), role) {
                    fields.insert("role".to_string(), json!(role));
                }
                txn.remove(WORKFLOW_PARTICIPANT, filter).await?;
            }
            Mutation::AddStage { stage } => {
                txn.insert(WORKFLOW_STAGE, to_row(stage.as_ref())?).await?;
            }
        }
    }

    if memory_dirty {
        let (params, memory, stepsm) = memory_snapshot;
        let record = WorkflowMemory {
            id: workflow_id,
            workflow_id,
            params,
            memory,
            stepsm,
        };
        txn.upsert(
            WORKFLOW_MEMORY,
            json!({ "workflow_id": workflow_id }),
            to_row(&record)?,
        )
        .await?;
    }

    for activity in activities {
        txn.insert(WORKFLOW_ACTIVITY, to_row(activity)?).await?;
    }
    for message in messages {
        txn.insert(WORKFLOW_MESSAGE, to_row(message)?).await?;
    }
    Ok(())
}
