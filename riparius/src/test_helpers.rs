//! Shared fixtures for the workflow tests

use crate::definition::{default_routing, StageDef, StepDef, WorkflowDefinition};
use crate::model::Memory;
use crate::runner::ActionScope;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// A two-stage process with a singleton `prepare` step created at start and
/// a multi-instance `task` step spawned in pairs by `sample-event`
pub fn sample_definition() -> WorkflowDefinition {
    WorkflowDefinition::builder("sample-process")
        .title("Sample process")
        .stage(StageDef::new("intake", "Intake"))
        .stage(StageDef::new("work", "Work"))
        .role("owner", "Owner")
        .step(
            StepDef::builder("prepare", "intake")
                .title("Prepare")
                .states(["REVIEW"])
                .build()
                .expect("prepare step"),
        )
        .step(
            StepDef::builder("task", "work")
                .title("Task")
                .states(["IN_PROGRESS"])
                .multi()
                .build()
                .expect("task step"),
        )
        .on_started(Arc::new(|scope: &mut ActionScope<'_>| {
            scope.add_step("prepare")?;
            Ok(vec!["workflow started".to_string()])
        }))
        .on_event(
            "sample-event",
            default_routing(),
            0,
            Arc::new(|scope: &mut ActionScope<'_>, _event: &Value| {
                scope.add_step("task")?;
                scope.add_step("task")?;
                Ok(Vec::new())
            }),
        )
        .build()
        .expect("sample definition")
}

/// A minimal definition whose `on_started` hook creates no steps
pub fn empty_definition() -> WorkflowDefinition {
    WorkflowDefinition::builder("empty-process")
        .build()
        .expect("empty definition")
}

/// Installs a test subscriber so traced warnings show up with `--nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("riparius=debug")
        .try_init();
}

/// Parameters used by the sample workflow tests
pub fn sample_params() -> Memory {
    let mut params = Memory::new();
    params.insert("amount".to_string(), json!(100));
    params
}

/// An event payload routable by [`default_routing`]
pub fn sample_event(resource_id: Uuid) -> Value {
    json!({
        "resource_name": "test-resource",
        "resource_id": resource_id.to_string(),
        "payload": {"note": "hello"},
    })
}
