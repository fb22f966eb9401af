pub mod completion;
pub mod reconcile;
pub mod resolver;
pub mod store;

use orderflow_core::wire::FrameError;
use thiserror::Error;

pub use completion::{
    CompletionConfig, CompletionDetector, CompletionNotice, CompletionNotifier, CompletionSignal,
    CompletionSink, CompletionState, DetectionMode,
};
pub use reconcile::{MergeAction, ReconcileConfig, StepReconciler, SuppressionGate};
pub use resolver::{RawStepIdentity, StepIdentityResolver, ToolRule};
pub use store::{ApplyOutcome, EventMeta, WorkflowStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("step update carries no usable identifier")]
    UnidentifiedStep,
    #[error("{event_type} event has no run id and no run is active")]
    MissingRunId { event_type: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
}
