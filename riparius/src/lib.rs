//! Riparius: a hierarchical workflow orchestration engine
//!
//! Workflows are declared once as immutable definitions (stages, step
//! types, roles, hooks, event bindings), then instantiated per business
//! resource. Each live instance is driven by a [`WorkflowRunner`], a
//! synchronous in-memory state machine whose every change is captured as an
//! ordered [`MutationEnvelope`]. The async [`WorkflowManager`] routes
//! external events to instances through the [`EventRouter`] and persists
//! drained mutation batches through the [`WorkflowDataManager`] boundary.
//!
//! # Example
//!
//! ```no_run
//! use riparius::{
//!     DefinitionRegistry, MemoryDataManager, StageDef, StepDef, WorkflowDefinition,
//!     WorkflowManager,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> riparius::Result<()> {
//! let definition = WorkflowDefinition::builder("doc-review")
//!     .stage(StageDef::new("main", "Main"))
//!     .step(StepDef::builder("review", "main").states(["PENDING"]).build()?)
//!     .on_started(Arc::new(|scope: &mut riparius::ActionScope<'_>| {
//!         scope.add_step("review")?;
//!         Ok(Vec::new())
//!     }))
//!     .build()?;
//!
//! let mut registry = DefinitionRegistry::new();
//! registry.register(definition)?;
//! let _manager = WorkflowManager::new(registry, Arc::new(MemoryDataManager::new()));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod definition;
pub mod error;
pub mod manager;
pub mod model;
pub mod mutation;
pub mod router;
pub mod runner;
pub mod status;
pub mod storage;

#[cfg(test)]
mod test_helpers;



pub use definition::{
    default_routing, DefinitionMeta, DefinitionRegistry, EventBinding, EventHandler, EventRoute,
    LifecycleHook, RoleDef, RoutingFn, StageDef, StepDef, TransitionHandler, WorkflowDefinition,
    BEGIN_LABEL, BEGIN_STATE, FINISH_LABEL, FINISH_STATE,
};
pub use error::{ConfigurationError, ExecutionError, Result, StorageError, WorkflowError};
pub use manager::WorkflowManager;
pub use model::{
    Memory, StageData, StepData, StepMemory, WorkflowActivity, WorkflowData, WorkflowMemory,
    WorkflowMessage,
};
pub use mutation::{Mutation, MutationEnvelope};
pub use router::{EventRouter, WorkflowTrigger};
pub use runner::{ActionScope, Participant, Transaction, WorkflowRunner};
pub use status::{StageStatus, StepStatus, WorkflowStatus};
pub use storage::{MemoryDataManager, StorageTransaction, WorkflowDataManager};
