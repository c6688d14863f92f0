//! Workflow definitions and the definition registry
//!
//! A definition is declared once at process startup through an explicit
//! builder and is immutable afterwards. All declaration mistakes (duplicate
//! keys, undeclared stages or states) surface as configuration errors at
//! build time, never while an instance is running.

use crate::error::{ConfigurationError, Result};
use crate::runner::ActionScope;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Universal initial state prepended to every step's state tuple
pub const BEGIN_STATE: &str = "_CREATED";
/// Universal terminal state appended to every step's state tuple
pub const FINISH_STATE: &str = "_FINISHED";
/// Display label of [`BEGIN_STATE`]
pub const BEGIN_LABEL: &str = "NEW";
/// Display label of [`FINISH_STATE`]
pub const FINISH_LABEL: &str = "DONE";

static STATE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z\d_]*$").unwrap_or_else(|e| panic!("state regex: {e}")));

/// A hook run when a workflow lifecycle action fires; returned strings become
/// workflow messages
pub type LifecycleHook = Arc<dyn Fn(&mut ActionScope<'_>) -> Result<Vec<String>> + Send + Sync>;

/// A handler run when a routed event reaches a workflow or step
pub type EventHandler =
    Arc<dyn Fn(&mut ActionScope<'_>, &Value) -> Result<Vec<String>> + Send + Sync>;

/// A handler run when a step enters a state; receives the origin and target
/// states
pub type TransitionHandler =
    Arc<dyn Fn(&mut ActionScope<'_>, &str, &str) -> Result<Vec<String>> + Send + Sync>;

/// Extracts routing coordinates from a raw event payload; `None` means the
/// event does not apply to this binding
pub type RoutingFn = Arc<dyn Fn(&Value) -> Option<EventRoute> + Send + Sync>;

/// Routing coordinates extracted from an event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRoute {
    /// Resource kind the workflow is attached to
    pub resource_name: String,
    /// Resource identity the workflow is attached to
    pub resource_id: uuid::Uuid,
    /// Target step selector, required iff the binding is step-bound
    pub step_selector: Option<uuid::Uuid>,
}

/// A stage declared by a workflow definition
#[derive(Debug, Clone, Serialize)]
pub struct StageDef {
    /// Stage key, unique within the definition
    pub key: String,
    /// Human name
    pub name: String,
    /// Free-form classification
    pub stage_type: String,
    /// Display ordering; defaulted from declaration position when unset
    pub order: u32,
    /// Description
    pub desc: Option<String>,
}

impl StageDef {
    /// A stage with the given key and name, type `"default"` and unset order
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        StageDef {
            key: key.into(),
            name: name.into(),
            stage_type: "default".to_string(),
            order: 0,
            desc: None,
        }
    }

    /// Sets the stage classification
    pub fn stage_type(mut self, stage_type: impl Into<String>) -> Self {
        self.stage_type = stage_type.into();
        self
    }

    /// Sets an explicit display order
    pub fn order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Sets the description
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }
}

/// A role participants can be added under
#[derive(Debug, Clone, Serialize)]
pub struct RoleDef {
    /// Role key, unique within the definition
    pub key: String,
    /// Human title
    pub title: String,
}

/// A guarded handler attached to one target state of a step
pub struct StepTransition {
    pub(crate) handler: TransitionHandler,
    pub(crate) allowed_origins: Option<Vec<String>>,
    pub(crate) unallowed_origins: Option<Vec<String>>,
}

impl StepTransition {
    /// Whether the transition may fire from the given origin state
    pub fn permits(&self, from_state: &str) -> bool {
        if let Some(allowed) = &self.allowed_origins {
            if !allowed.iter().any(|s| s == from_state) {
                return false;
            }
        }
        if let Some(unallowed) = &self.unallowed_origins {
            if unallowed.iter().any(|s| s == from_state) {
                return false;
            }
        }
        true
    }

    /// The handler to run after the state is applied
    pub fn handler(&self) -> &TransitionHandler {
        &self.handler
    }
}

impl std::fmt::Debug for StepTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepTransition")
            .field("allowed_origins", &self.allowed_origins)
            .field("unallowed_origins", &self.unallowed_origins)
            .finish_non_exhaustive()
    }
}

/// A step type declared by a workflow definition
#[derive(Debug)]
pub struct StepDef {
    /// Step key, unique within the definition
    pub key: String,
    /// Human title, defaulted onto created steps
    pub title: String,
    /// Stage the step belongs to
    pub stage: String,
    /// Description copied onto created steps
    pub desc: Option<String>,
    /// Full state tuple: `_CREATED`, the declared states, `_FINISHED`
    pub states: Vec<String>,
    /// Whether multiple instances of this step may exist in one workflow
    pub multi: bool,
    pub(crate) transitions: HashMap<String, StepTransition>,
}

impl StepDef {
    /// Starts building a step attached to the given stage
    pub fn builder(key: impl Into<String>, stage: impl Into<String>) -> StepDefBuilder {
        let key = key.into();
        StepDefBuilder {
            title: key.clone(),
            key,
            stage: stage.into(),
            desc: None,
            states: Vec::new(),
            multi: false,
            transitions: Vec::new(),
        }
    }

    /// Whether `state` belongs to the step's state tuple
    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// The transition handler registered for the given target state, if any
    pub fn transition(&self, to_state: &str) -> Option<&StepTransition> {
        self.transitions.get(to_state)
    }

    /// The display label for a state
    pub fn state_label(&self, state: &str) -> String {
        match state {
            BEGIN_STATE => BEGIN_LABEL.to_string(),
            FINISH_STATE => FINISH_LABEL.to_string(),
            other => other.to_string(),
        }
    }
}

/// Builder for [`StepDef`]
pub struct StepDefBuilder {
    key: String,
    title: String,
    stage: String,
    desc: Option<String>,
    states: Vec<String>,
    multi: bool,
    transitions: Vec<(String, StepTransition)>,
}

impl StepDefBuilder {
    /// Sets the human title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the description
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Declares the step's intermediate states, in order
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Allows multiple instances of this step per workflow
    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    /// Registers a transition handler fired when the step enters `to_state`
    pub fn on_transit(mut self, to_state: impl Into<String>, handler: TransitionHandler) -> Self {
        self.transitions.push((
            to_state.into(),
            StepTransition {
                handler,
                allowed_origins: None,
                unallowed_origins: None,
            },
        ));
        self
    }

    /// Registers a guarded transition handler with explicit origin sets
    pub fn on_transit_guarded(
        mut self,
        to_state: impl Into<String>,
        handler: TransitionHandler,
        allowed_origins: Option<Vec<String>>,
        unallowed_origins: Option<Vec<String>>,
    ) -> Self {
        self.transitions.push((
            to_state.into(),
            StepTransition {
                handler,
                allowed_origins,
                unallowed_origins,
            },
        ));
        self
    }

    /// Validates the declaration and produces the step definition
    pub fn build(self) -> Result<StepDef> {
        for state in &self.states {
            if !STATE_NAME.is_match(state) {
                return Err(ConfigurationError::InvalidStateName(state.clone()).into());
            }
        }

        let mut states = Vec::with_capacity(self.states.len() + 2);
        states.push(BEGIN_STATE.to_string());
        states.extend(self.states);
        states.push(FINISH_STATE.to_string());

        let mut transitions = HashMap::new();
        for (to_state, transition) in self.transitions {
            if !states.iter().any(|s| s == &to_state) {
                return Err(ConfigurationError::UndeclaredTransitionState {
                    state: to_state,
                    step: self.key,
                }
                .into());
            }
            if transitions.insert(to_state.clone(), transition).is_some() {
                return Err(ConfigurationError::DuplicateTransitionHandler {
                    state: to_state,
                    step: self.key,
                }
                .into());
            }
        }

        Ok(StepDef {
            key: self.key,
            title: self.title,
            stage: self.stage,
            desc: self.desc,
            states,
            multi: self.multi,
            transitions,
        })
    }
}

/// Lifecycle hooks a definition may register
#[derive(Default, Clone)]
pub struct LifecycleHooks {
    /// Runs inside `start`, before the workflow becomes ACTIVE
    pub on_started: Option<LifecycleHook>,
    /// Runs inside `cancel_workflow`
    pub on_cancelled: Option<LifecycleHook>,
    /// Runs inside `abort_workflow`
    pub on_aborted: Option<LifecycleHook>,
    /// Runs inside `pause`
    pub on_paused: Option<LifecycleHook>,
    /// Runs inside `resume`
    pub on_resumed: Option<LifecycleHook>,
}

impl LifecycleHooks {
    /// Names of the hooks that are set, for metadata export
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.on_started.is_some() {
            names.push("on_started");
        }
        if self.on_cancelled.is_some() {
            names.push("on_cancelled");
        }
        if self.on_aborted.is_some() {
            names.push("on_aborted");
        }
        if self.on_paused.is_some() {
            names.push("on_paused");
        }
        if self.on_resumed.is_some() {
            names.push("on_resumed");
        }
        names
    }
}

/// One declared event binding: the event either targets the workflow as a
/// whole or one step type
pub struct EventBinding {
    /// Wire name of the event
    pub event_name: String,
    /// Step key the event targets; `None` binds the workflow itself
    pub step_key: Option<String>,
    /// Extracts routing coordinates from the payload
    pub routing: RoutingFn,
    /// Routing priority; higher buckets trigger first
    pub priority: u8,
    /// Runs against the routed workflow or step
    pub handler: EventHandler,
}

impl std::fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBinding")
            .field("event_name", &self.event_name)
            .field("step_key", &self.step_key)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// An immutable workflow definition
pub struct WorkflowDefinition {
    /// Definition key
    pub key: String,
    /// Definition revision
    pub revision: u32,
    /// Owning namespace
    pub namespace: Option<String>,
    /// Human title, defaulted onto created workflows
    pub title: String,
    /// Declared stages, in declaration order
    pub stages: Vec<Arc<StageDef>>,
    /// Declared step types, keyed by step key
    pub steps: HashMap<String, Arc<StepDef>>,
    /// Declared roles
    pub roles: Vec<RoleDef>,
    /// Lifecycle hooks
    pub hooks: LifecycleHooks,
    /// Declared event bindings, in declaration order
    pub events: Vec<Arc<EventBinding>>,
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("stages", &self.stages.len())
            .field("steps", &self.steps.len())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowDefinition {
    /// Starts building a definition under the given key
    pub fn builder(key: impl Into<String>) -> WorkflowDefinitionBuilder {
        let key = key.into();
        WorkflowDefinitionBuilder {
            title: key.clone(),
            key,
            revision: 1,
            namespace: None,
            stages: Vec::new(),
            steps: Vec::new(),
            roles: Vec::new(),
            hooks: LifecycleHooks::default(),
            events: Vec::new(),
        }
    }

    /// The step definition registered under `step_key`
    pub fn step(&self, step_key: &str) -> Option<&Arc<StepDef>> {
        self.steps.get(step_key)
    }

    /// Whether the given role is declared
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.key == role)
    }

    /// Serializable metadata describing the definition, for export and
    /// inspection tooling
    pub fn metadata(&self) -> DefinitionMeta {
        DefinitionMeta {
            key: self.key.clone(),
            revision: self.revision,
            namespace: self.namespace.clone(),
            title: self.title.clone(),
            stages: self.stages.iter().map(|s| (**s).clone()).collect(),
            steps: self
                .steps
                .values()
                .map(|s| StepMeta {
                    key: s.key.clone(),
                    title: s.title.clone(),
                    stage: s.stage.clone(),
                    states: s.states.clone(),
                    multi: s.multi,
                })
                .collect(),
            roles: self.roles.clone(),
            events: self
                .events
                .iter()
                .map(|e| EventMeta {
                    event_name: e.event_name.clone(),
                    step_key: e.step_key.clone(),
                    priority: e.priority,
                })
                .collect(),
            hooks: self.hooks.names(),
        }
    }
}

/// Serializable definition metadata
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionMeta {
    /// Definition key
    pub key: String,
    /// Definition revision
    pub revision: u32,
    /// Owning namespace
    pub namespace: Option<String>,
    /// Human title
    pub title: String,
    /// Declared stages
    pub stages: Vec<StageDef>,
    /// Declared step types
    pub steps: Vec<StepMeta>,
    /// Declared roles
    pub roles: Vec<RoleDef>,
    /// Declared event bindings
    pub events: Vec<EventMeta>,
    /// Names of the registered lifecycle hooks
    pub hooks: Vec<&'static str>,
}

/// Serializable step metadata
#[derive(Debug, Clone, Serialize)]
pub struct StepMeta {
    /// Step key
    pub key: String,
    /// Human title
    pub title: String,
    /// Owning stage key
    pub stage: String,
    /// Full state tuple
    pub states: Vec<String>,
    /// Whether multiple instances are allowed
    pub multi: bool,
}

/// Serializable event-binding metadata
#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    /// Wire name of the event
    pub event_name: String,
    /// Step key the event targets, if step-bound
    pub step_key: Option<String>,
    /// Routing priority
    pub priority: u8,
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowDefinitionBuilder {
    key: String,
    revision: u32,
    namespace: Option<String>,
    title: String,
    stages: Vec<StageDef>,
    steps: Vec<StepDef>,
    roles: Vec<RoleDef>,
    hooks: LifecycleHooks,
    events: Vec<EventBinding>,
}

impl WorkflowDefinitionBuilder {
    /// Sets the human title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the definition revision
    pub fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Sets the owning namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Declares a stage
    pub fn stage(mut self, stage: StageDef) -> Self {
        self.stages.push(stage);
        self
    }

    /// Declares a step type
    pub fn step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares a role
    pub fn role(mut self, key: impl Into<String>, title: impl Into<String>) -> Self {
        self.roles.push(RoleDef {
            key: key.into(),
            title: title.into(),
        });
        self
    }

    /// Registers the hook run inside `start`
    pub fn on_started(mut self, hook: LifecycleHook) -> Self {
        self.hooks.on_started = Some(hook);
        self
    }

    /// Registers the hook run inside `cancel_workflow`
    pub fn on_cancelled(mut self, hook: LifecycleHook) -> Self {
        self.hooks.on_cancelled = Some(hook);
        self
    }

    /// Registers the hook run inside `abort_workflow`
    pub fn on_aborted(mut self, hook: LifecycleHook) -> Self {
        self.hooks.on_aborted = Some(hook);
        self
    }

    /// Registers the hook run inside `pause`
    pub fn on_paused(mut self, hook: LifecycleHook) -> Self {
        self.hooks.on_paused = Some(hook);
        self
    }

    /// Registers the hook run inside `resume`
    pub fn on_resumed(mut self, hook: LifecycleHook) -> Self {
        self.hooks.on_resumed = Some(hook);
        self
    }

    /// Binds an event to the workflow as a whole
    pub fn on_event(
        mut self,
        event_name: impl Into<String>,
        routing: RoutingFn,
        priority: u8,
        handler: EventHandler,
    ) -> Self {
        self.events.push(EventBinding {
            event_name: event_name.into(),
            step_key: None,
            routing,
            priority,
            handler,
        });
        self
    }

    /// Binds an event to one step type; routing must yield a step selector
    pub fn on_step_event(
        mut self,
        event_name: impl Into<String>,
        step_key: impl Into<String>,
        routing: RoutingFn,
        priority: u8,
        handler: EventHandler,
    ) -> Self {
        self.events.push(EventBinding {
            event_name: event_name.into(),
            step_key: Some(step_key.into()),
            routing,
            priority,
            handler,
        });
        self
    }

    /// Validates the declaration and produces the definition
    pub fn build(self) -> Result<WorkflowDefinition> {
        let mut stages: Vec<Arc<StageDef>> = Vec::with_capacity(self.stages.len());
        for (index, mut stage) in self.stages.into_iter().enumerate() {
            if stages.iter().any(|s| s.key == stage.key) {
                return Err(ConfigurationError::DuplicateStage(stage.key).into());
            }
            if stage.order == 0 {
                stage.order = 100 + index as u32;
            }
            stages.push(Arc::new(stage));
        }

        let mut steps: HashMap<String, Arc<StepDef>> = HashMap::with_capacity(self.steps.len());
        for step in self.steps {
            if !stages.iter().any(|s| s.key == step.stage) {
                return Err(ConfigurationError::StageNotDefined {
                    stage: step.stage,
                    workflow: self.key,
                }
                .into());
            }
            let key = step.key.clone();
            if steps.insert(key.clone(), Arc::new(step)).is_some() {
                return Err(ConfigurationError::DuplicateStep(key).into());
            }
        }

        let mut roles: Vec<RoleDef> = Vec::with_capacity(self.roles.len());
        for role in self.roles {
            if roles.iter().any(|r| r.key == role.key) {
                return Err(ConfigurationError::DuplicateRole(role.key).into());
            }
            roles.push(role);
        }

        for binding in &self.events {
            if let Some(step_key) = &binding.step_key {
                if !steps.contains_key(step_key.as_str()) {
                    return Err(ConfigurationError::StepRoutingMismatch {
                        event: binding.event_name.clone(),
                        workflow: self.key,
                    }
                    .into());
                }
            }
        }

        Ok(WorkflowDefinition {
            key: self.key,
            revision: self.revision,
            namespace: self.namespace,
            title: self.title,
            stages,
            steps,
            roles,
            hooks: self.hooks,
            events: self.events.into_iter().map(Arc::new).collect(),
        })
    }
}

/// The set of workflow definitions known to a manager.
///
/// Built once at startup and shared by reference; registration after that
/// point is a programming error surfaced as a configuration error.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl DefinitionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under its key
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<()> {
        let key = definition.key.clone();
        if self.definitions.contains_key(&key) {
            return Err(ConfigurationError::DuplicateWorkflow(key).into());
        }
        info!(workflow = %key, revision = definition.revision, "registered workflow definition");
        self.definitions.insert(key, Arc::new(definition));
        Ok(())
    }

    /// The definition registered under `key`, if any
    pub fn get(&self, key: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(key).cloned()
    }

    /// Iterates all registered definitions
    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkflowDefinition>> {
        self.definitions.values()
    }

    /// Serializable metadata for every registered definition, sorted by key
    pub fn metadata(&self) -> Vec<DefinitionMeta> {
        let mut metas: Vec<DefinitionMeta> =
            self.definitions.values().map(|d| d.metadata()).collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        metas
    }
}

impl std::fmt::Debug for DefinitionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionRegistry")
            .field("definitions", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The default routing function: reads `resource_name`, `resource_id` and
/// an optional `step_selector` from the payload, returning `None` when the
/// required fields are missing or malformed
pub fn default_routing() -> RoutingFn {
    Arc::new(|payload: &Value| {
        let resource_name = payload.get("resource_name")?.as_str()?.to_string();
        let resource_id = payload
            .get("resource_id")?
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())?;
        let step_selector = payload
            .get("step_selector")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok());
        Some(EventRoute {
            resource_name,
            resource_id,
            step_selector,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_transition() -> TransitionHandler {
        Arc::new(|_: &mut ActionScope<'_>, _: &str, _: &str| Ok(Vec::new()))
    }

    #[test]
    fn step_states_get_universal_bookends() {
        let step = StepDef::builder("review", "main")
            .states(["PENDING", "APPROVED"])
            .build()
            .unwrap();
        assert_eq!(
            step.states,
            vec!["_CREATED", "PENDING", "APPROVED", "_FINISHED"]
        );
        assert_eq!(step.state_label("_CREATED"), "NEW");
        assert_eq!(step.state_label("_FINISHED"), "DONE");
        assert_eq!(step.state_label("PENDING"), "PENDING");
    }

    #[test]
    fn lowercase_state_name_is_rejected() {
        let err = StepDef::builder("review", "main")
            .states(["pending"])
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P00.020"));
    }

    #[test]
    fn transition_to_undeclared_state_is_rejected() {
        let err = StepDef::builder("review", "main")
            .states(["PENDING"])
            .on_transit("APPROVED", noop_transition())
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P01301"));
    }

    #[test]
    fn duplicate_transition_handler_is_rejected() {
        let err = StepDef::builder("review", "main")
            .states(["PENDING"])
            .on_transit("PENDING", noop_transition())
            .on_transit("PENDING", noop_transition())
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P01302"));
    }

    #[test]
    fn transition_guards_filter_origin_states() {
        let step = StepDef::builder("review", "main")
            .states(["PENDING", "APPROVED"])
            .on_transit_guarded(
                "APPROVED",
                noop_transition(),
                Some(vec!["PENDING".to_string()]),
                None,
            )
            .on_transit_guarded(
                "_FINISHED",
                noop_transition(),
                None,
                Some(vec!["_CREATED".to_string()]),
            )
            .build()
            .unwrap();

        let t = step.transition("APPROVED").unwrap();
        assert!(t.permits("PENDING"));
        assert!(!t.permits("_CREATED"));

        let t = step.transition("_FINISHED").unwrap();
        assert!(t.permits("APPROVED"));
        assert!(!t.permits("_CREATED"));
    }

    #[test]
    fn duplicate_keys_are_rejected_at_build() {
        let err = WorkflowDefinition::builder("wf")
            .stage(StageDef::new("main", "Main"))
            .stage(StageDef::new("main", "Main again"))
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P00.014"));

        let err = WorkflowDefinition::builder("wf")
            .stage(StageDef::new("main", "Main"))
            .step(StepDef::builder("s", "main").build().unwrap())
            .step(StepDef::builder("s", "main").build().unwrap())
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P00.011"));

        let err = WorkflowDefinition::builder("wf")
            .role("owner", "Owner")
            .role("owner", "Owner again")
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P00.016"));
    }

    #[test]
    fn step_with_unknown_stage_is_rejected() {
        let err = WorkflowDefinition::builder("wf")
            .step(StepDef::builder("s", "ghost").build().unwrap())
            .build()
            .unwrap_err();
        assert!(err.to_string().starts_with("P00.012"));
    }

    #[test]
    fn stage_order_defaults_from_position() {
        let def = WorkflowDefinition::builder("wf")
            .stage(StageDef::new("a", "A"))
            .stage(StageDef::new("b", "B").order(7))
            .stage(StageDef::new("c", "C"))
            .build()
            .unwrap();
        assert_eq!(def.stages[0].order, 100);
        assert_eq!(def.stages[1].order, 7);
        assert_eq!(def.stages[2].order, 102);
    }

    #[test]
    fn registry_rejects_duplicate_registration() {
        let mut registry = DefinitionRegistry::new();
        registry
            .register(WorkflowDefinition::builder("wf").build().unwrap())
            .unwrap();
        let err = registry
            .register(WorkflowDefinition::builder("wf").build().unwrap())
            .unwrap_err();
        assert!(err.to_string().starts_with("P00.501"));
        assert!(registry.get("wf").is_some());
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn default_routing_extracts_coordinates() {
        let routing = default_routing();
        let rid = uuid::Uuid::new_v4();
        let payload = serde_json::json!({
            "resource_name": "document",
            "resource_id": rid.to_string(),
        });
        let route = routing(&payload).unwrap();
        assert_eq!(route.resource_name, "document");
        assert_eq!(route.resource_id, rid);
        assert!(route.step_selector.is_none());

        assert!(routing(&serde_json::json!({"resource_name": "x"})).is_none());
    }

    #[test]
    fn metadata_exports_the_declaration() {
        let def = WorkflowDefinition::builder("doc-review")
            .title("Document review")
            .stage(StageDef::new("main", "Main"))
            .step(
                StepDef::builder("review", "main")
                    .states(["PENDING"])
                    .build()
                    .unwrap(),
            )
            .role("reviewer", "Reviewer")
            .on_started(Arc::new(|_: &mut ActionScope<'_>| Ok(Vec::new())))
            .on_event(
                "doc-created",
                default_routing(),
                1,
                Arc::new(|_: &mut ActionScope<'_>, _: &Value| Ok(Vec::new())),
            )
            .build()
            .unwrap();

        let meta = def.metadata();
        assert_eq!(meta.key, "doc-review");
        assert_eq!(meta.stages.len(), 1);
        assert_eq!(meta.steps[0].states.first().map(String::as_str), Some("_CREATED"));
        assert_eq!(meta.hooks, vec!["on_started"]);
        assert_eq!(meta.events[0].event_name, "doc-created");
        serde_json::to_value(&meta).unwrap();
    }
}
