pub mod classify;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod occupancy;
pub mod pool;
pub mod runner;
pub mod workflow;

pub use classify::{classify_error, ErrorClass};
pub use config::Config;
pub use context::{ContextAssembler, ContextSnapshot, DepsClassification, StuckReason};
pub use crate::core::graph::{ReconcileDiff, TaskGraph};
pub use crate::core::task::{PlanTask, SessionId, Task, TaskId, TaskStage, TaskStatus, TestPolicy};
pub use error::{Error, Result};
pub use occupancy::{
    ConflictAdvice, ConflictHandler, ConflictResolution, OccupancyMode, OccupancyRegistry,
};
pub use pool::{AgentPool, AgentRecord, AgentState, PoolEvent};
pub use runner::{AgentInvocation, AgentOutcome, AgentRunner, ProcessAgentRunner};
pub use workflow::{
    EventWaiters, PhaseResult, WorkflowEngine, WorkflowHandle, WorkflowId, WorkflowKind,
    WorkflowRequest, WorkflowStatus,
};
