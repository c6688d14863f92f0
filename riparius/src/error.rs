//! Unified error handling for the riparius workflow engine
//!
//! Errors fall into three families, mirrored by three enums: configuration
//! errors raised while definitions are registered (fatal, fix the code),
//! execution errors raised while actions run against a live workflow
//! instance, and storage errors surfaced from the data-manager boundary.
//! Each variant carries the stable error code used by the surrounding
//! platform so callers can map conditions without string matching.

use thiserror::Error;
use uuid::Uuid;

/// The umbrella error type for the riparius library
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A definition was mis-declared at registration time
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// An action was invoked against a workflow in an invalid way
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The external data manager failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors raised while a workflow definition is being built or registered.
///
/// These are process-startup errors: they are never retried and must be
/// fixed in the definition code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Two steps were declared under the same key
    #[error("P00.011: step already registered [{0}]")]
    DuplicateStep(String),

    /// A step references a stage that the definition does not declare
    #[error("P00.012: stage [{stage}] is not defined for workflow [{workflow}]")]
    StageNotDefined {
        /// The missing stage key
        stage: String,
        /// The workflow definition key
        workflow: String,
    },

    /// Two stages were declared under the same key
    #[error("P00.014: stage already registered [{0}]")]
    DuplicateStage(String),

    /// Two roles were declared under the same key
    #[error("P00.016: role already registered [{0}]")]
    DuplicateRole(String),

    /// A step state does not match the required `UPPER_SNAKE` form
    #[error("P00.020: invalid step state name [{0}]")]
    InvalidStateName(String),

    /// A transition handler targets a state outside the step's state tuple
    #[error("P01301: state [{state}] is not declared in step [{step}]")]
    UndeclaredTransitionState {
        /// The undeclared target state
        state: String,
        /// The step key carrying the handler
        step: String,
    },

    /// Two transition handlers target the same state
    #[error("P01302: duplicated transition handler to state [{state}] on step [{step}]")]
    DuplicateTransitionHandler {
        /// The contested target state
        state: String,
        /// The step key carrying the handlers
        step: String,
    },

    /// Two workflow definitions were registered under the same key
    #[error("P00.501: workflow already registered: {0}")]
    DuplicateWorkflow(String),

    /// A step-bound event binding routed without a step selector, or a
    /// workflow-bound binding routed with one
    #[error("P00.030: step event must be routed to a specific step [{event}] on [{workflow}]")]
    StepRoutingMismatch {
        /// The event name of the offending binding
        event: String,
        /// The workflow definition key of the offending binding
        workflow: String,
    },

    /// The definition produced zero steps by the time `start` completed
    #[error("P00.015: workflow [{0}] has no steps after started")]
    NoStepsAfterStart(String),
}

/// Errors raised while actions run against a live workflow instance.
///
/// These abort the in-progress action and bubble to the caller; the engine
/// never retries them on its own.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// An action was invoked with no transaction open on the runner
    #[error("P00.001: unable to perform action [{0}] outside of a transaction")]
    NoTransaction(String),

    /// The workflow status is outside the action's allow set
    #[error("P00.002: action [{action}] is not allowed at workflow status [{status}]")]
    StatusNotAllowed {
        /// The rejected action name
        action: String,
        /// The current workflow status
        status: String,
    },

    /// A second transaction was opened while one is active
    #[error("P00.009: transaction already started")]
    TransactionAlreadyStarted,

    /// A mutation was generated outside an action context
    #[error("P00.016: mutation [{0}] is only allowed to be produced by workflow actions")]
    MutationOutsideAction(String),

    /// No step matches the given selector
    #[error("P00.101: no step available for selector value: {0}")]
    UnknownSelector(Uuid),

    /// The selector is already allocated to another step of the instance
    #[error("P011.07: selector value already allocated to another step [{step_key}]: {selector}")]
    DuplicateSelector {
        /// The step key that attempted the allocation
        step_key: String,
        /// The contested selector
        selector: Uuid,
    },

    /// A singleton step was added twice
    #[error("P00.017: step [{step_key}] already exists: {step_id}")]
    StepAlreadyExists {
        /// The step key of the existing step
        step_key: String,
        /// The deterministic id both calls resolved to
        step_id: Uuid,
    },

    /// No step with the given id exists on the instance
    #[error("P00.103: unknown step id: {0}")]
    UnknownStep(Uuid),

    /// No step type with the given key exists in the definition
    #[error("P00.104: unknown step key: {0}")]
    UnknownStepKey(String),

    /// The target state is outside the step's declared state tuple
    #[error("P00.102: invalid step state [{state}], allowed states: {allowed:?}")]
    InvalidState {
        /// The rejected target state
        state: String,
        /// The step's declared state tuple
        allowed: Vec<String>,
    },

    /// A guarded transition was attempted from a disallowed origin state
    #[error("P00.007: transition to state [{to_state}] is not allowed from [{from_state}]")]
    TransitionNotAllowed {
        /// The guarded target state
        to_state: String,
        /// The current origin state
        from_state: String,
    },

    /// `recover_step` was called on a step not in ERROR status
    #[error("P00.007: cannot recover from a non-error status: {0}")]
    RecoverNonError(String),

    /// Reconciliation computed NEW for a workflow that already has steps
    #[error("P00.005: workflow {0} cannot reconcile back to NEW status")]
    ReconcileToNew(Uuid),

    /// An action requiring a bound step was invoked on a workflow scope
    #[error("P00.105: action [{0}] requires a step-bound scope")]
    NoBoundStep(String),

    /// No routing table entry exists for the event name
    #[error("P01881: no workflow event binding for [{0}]")]
    EventNotFound(String),

    /// No workflow definition is registered under the key
    #[error("P00.502: unknown workflow definition: {0}")]
    UnknownDefinition(String),

    /// No live or stored workflow matches the requested identity
    #[error("P00.503: workflow not found: {0}")]
    WorkflowNotFound(String),
}

/// Errors surfaced from the external data manager during persistence.
///
/// These propagate unchanged; the engine performs no automatic retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested record does not exist
    #[error("record not found in [{collection}]")]
    NotFound {
        /// The collection that was queried
        collection: String,
    },

    /// The backend rejected or failed the operation
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A record could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_errors_carry_platform_codes() {
        let err = ExecutionError::TransactionAlreadyStarted;
        assert!(err.to_string().starts_with("P00.009"));

        let err = ExecutionError::NoTransaction("start".to_string());
        assert!(err.to_string().contains("[start]"));
    }

    #[test]
    fn error_families_convert_into_the_umbrella_type() {
        let err: WorkflowError = ConfigurationError::DuplicateStep("prepare".to_string()).into();
        assert!(matches!(err, WorkflowError::Configuration(_)));

        let err: WorkflowError = StorageError::NotFound {
            collection: "workflow".to_string(),
        }
        .into();
        assert!(matches!(err, WorkflowError::Storage(_)));
    }
}
