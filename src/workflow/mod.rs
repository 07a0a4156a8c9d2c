//! Workflow execution: phase state machine, result extraction, and the
//! agent allocation protocol around each phase.

mod engine;
mod events;
mod extract;
mod types;

pub use engine::{
    compile_event_type, retry_worthwhile, WorkflowEngine, WorkflowHandle, WorkflowRequest,
};
pub use events::EventWaiters;
pub use extract::{extract_result, Extraction, ExtractionTier, PhaseResult};
pub use types::{
    Phase, WorkflowId, WorkflowInstance, WorkflowKind, WorkflowStatus, WorkflowSummary,
};
