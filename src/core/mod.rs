//! Task records and the dependency-ordered task store.

pub mod graph;
pub mod task;

pub use graph::{ConflictReason, ReconcileConflict, ReconcileDiff, TaskGraph};
pub use task::{PlanTask, SessionId, Task, TaskId, TaskStage, TaskStatus, TestPolicy};
