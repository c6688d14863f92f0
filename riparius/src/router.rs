//! Declarative routing of external events to workflow instances
//!
//! The router is a static table built from the event bindings the
//! registered definitions declare. Routing an event never touches
//! workflow state; it only computes which workflows should be triggered,
//! in which order. The manager consumes the resulting triggers.

use crate::definition::{DefinitionRegistry, EventBinding};
use crate::error::{ConfigurationError, ExecutionError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One resolved routing decision: trigger this binding of this definition
/// against the workflow attached to the given resource
#[derive(Clone)]
pub struct WorkflowTrigger {
    /// The definition whose binding matched
    pub wfdef_key: String,
    /// Resource kind the target workflow is attached to
    pub resource_name: String,
    /// Resource identity the target workflow is attached to
    pub resource_id: Uuid,
    /// Target step selector, present iff the binding is step-bound
    pub step_selector: Option<Uuid>,
    /// The matched binding, carrying the handler to run
    pub binding: Arc<EventBinding>,
}

impl std::fmt::Debug for WorkflowTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTrigger")
            .field("wfdef_key", &self.wfdef_key)
            .field("event_name", &self.binding.event_name)
            .field("resource_name", &self.resource_name)
            .field("resource_id", &self.resource_id)
            .field("step_selector", &self.step_selector)
            .finish()
    }
}

/// Routing table from event name to the bindings that listen for it
pub struct EventRouter {
    table: HashMap<String, Vec<(String, Arc<EventBinding>)>>,
}

impl EventRouter {
    /// Builds the routing table from every binding the registry's
    /// definitions declare.
    ///
    /// Bindings for one event are ordered by priority (higher first), then
    /// by declaration order. Multiple bindings on one event are legal and
    /// logged, since fan-out to several workflows is a supported pattern.
    pub fn from_registry(registry: &DefinitionRegistry) -> Self {
        let mut table: HashMap<String, Vec<(String, Arc<EventBinding>)>> = HashMap::new();
        for definition in registry.iter() {
            for binding in &definition.events {
                table
                    .entry(binding.event_name.clone())
                    .or_default()
                    .push((definition.key.clone(), Arc::clone(binding)));
            }
        }
        for (event_name, bindings) in &mut table {
            // stable sort keeps declaration order within a priority bucket
            bindings.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
            if bindings.len() > 1 {
                warn!(
                    event = %event_name,
                    handlers = bindings.len(),
                    "multiple workflow handlers registered for event"
                );
            }
        }
        EventRouter { table }
    }

    /// Whether any binding listens for the event
    pub fn handles(&self, event_name: &str) -> bool {
        self.table.contains_key(event_name)
    }

    /// Resolves an event payload into the ordered list of workflow triggers.
    ///
    /// A binding whose routing function returns `None` is skipped: the event
    /// exists but does not apply to that binding. A step-bound binding whose
    /// routing yields no step selector is a definition bug and fails the
    /// whole routing call. `workflow_filter` restricts routing to one
    /// definition key.
    pub fn route_event(
        &self,
        event_name: &str,
        event_data: &Value,
        workflow_filter: Option<&str>,
    ) -> Result<Vec<WorkflowTrigger>> {
        let bindings = self
            .table
            .get(event_name)
            .ok_or_else(|| ExecutionError::EventNotFound(event_name.to_string()))?;

        let mut triggers = Vec::new();
        for (wfdef_key, binding) in bindings {
            if let Some(filter) = workflow_filter {
                if filter != wfdef_key {
                    continue;
                }
            }

            let Some(route) = (binding.routing)(event_data) else {
                debug!(event = %event_name, workflow = %wfdef_key, "event not applicable, skipped");
                continue;
            };

            let step_selector = match (&binding.step_key, route.step_selector) {
                (Some(_), Some(selector)) => Some(selector),
                (Some(_), None) => {
                    return Err(ConfigurationError::StepRoutingMismatch {
                        event: event_name.to_string(),
                        workflow: wfdef_key.clone(),
                    }
                    .into());
                }
                (None, _) => None,
            };

            debug!(
                event = %event_name,
                workflow = %wfdef_key,
                resource = %route.resource_name,
                "event routed"
            );
            triggers.push(WorkflowTrigger {
                wfdef_key: wfdef_key.clone(),
                resource_name: route.resource_name,
                resource_id: route.resource_id,
                step_selector,
                binding: Arc::clone(binding),
            });
        }
        Ok(triggers)
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("events", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{default_routing, StageDef, StepDef, WorkflowDefinition};
    use serde_json::json;

    fn registry_with(definitions: Vec<WorkflowDefinition>) -> DefinitionRegistry {
        let mut registry = DefinitionRegistry::new();
        for def in definitions {
            registry.register(def).unwrap();
        }
        registry
    }

    fn noop_handler() -> crate::definition::EventHandler {
        Arc::new(|_: &mut crate::runner::ActionScope<'_>, _: &Value| Ok(Vec::new()))
    }

    #[test]
    fn unknown_event_is_a_typed_error() {
        let router = EventRouter::from_registry(&DefinitionRegistry::new());
        let err = router
            .route_event("ghost-event", &json!({}), None)
            .unwrap_err();
        assert!(err.to_string().starts_with("P01881"));
    }

    #[test]
    fn not_applicable_events_are_skipped() {
        let def = WorkflowDefinition::builder("wf")
            .on_event("evt", default_routing(), 0, noop_handler())
            .build()
            .unwrap();
        let router = EventRouter::from_registry(&registry_with(vec![def]));

        // payload lacks routing fields, so the binding does not apply
        let triggers = router.route_event("evt", &json!({"other": 1}), None).unwrap();
        assert!(triggers.is_empty());
    }

    #[test]
    fn triggers_are_ordered_by_priority_then_declaration() {
        let def = WorkflowDefinition::builder("wf")
            .on_event("evt", default_routing(), 1, noop_handler())
            .on_event("evt", default_routing(), 5, noop_handler())
            .on_event("evt", default_routing(), 1, noop_handler())
            .build()
            .unwrap();
        let router = EventRouter::from_registry(&registry_with(vec![def]));

        let payload = json!({
            "resource_name": "document",
            "resource_id": Uuid::new_v4().to_string(),
        });
        let triggers = router.route_event("evt", &payload, None).unwrap();
        let priorities: Vec<u8> = triggers.iter().map(|t| t.binding.priority).collect();
        assert_eq!(priorities, vec![5, 1, 1]);
    }

    #[test]
    fn workflow_filter_restricts_routing() {
        let a = WorkflowDefinition::builder("a")
            .on_event("evt", default_routing(), 0, noop_handler())
            .build()
            .unwrap();
        let b = WorkflowDefinition::builder("b")
            .on_event("evt", default_routing(), 0, noop_handler())
            .build()
            .unwrap();
        let router = EventRouter::from_registry(&registry_with(vec![a, b]));

        let payload = json!({
            "resource_name": "document",
            "resource_id": Uuid::new_v4().to_string(),
        });
        let triggers = router.route_event("evt", &payload, Some("b")).unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].wfdef_key, "b");
    }

    #[test]
    fn step_binding_without_selector_is_fatal() {
        let def = WorkflowDefinition::builder("wf")
            .stage(StageDef::new("main", "Main"))
            .step(StepDef::builder("review", "main").build().unwrap())
            .on_step_event("evt", "review", default_routing(), 0, noop_handler())
            .build()
            .unwrap();
        let router = EventRouter::from_registry(&registry_with(vec![def]));

        let payload = json!({
            "resource_name": "document",
            "resource_id": Uuid::new_v4().to_string(),
        });
        let err = router.route_event("evt", &payload, None).unwrap_err();
        assert!(err.to_string().starts_with("P00.030"));

        let selector = Uuid::new_v4();
        let payload = json!({
            "resource_name": "document",
            "resource_id": Uuid::new_v4().to_string(),
            "step_selector": selector.to_string(),
        });
        let triggers = router.route_event("evt", &payload, None).unwrap();
        assert_eq!(triggers[0].step_selector, Some(selector));
    }
}
