//! Task data model for the dispatch graph.
//!
//! Tasks are the atomic units of engineering work produced from a plan.
//! Each task tracks its coarse status, fine-grained stage, dependency
//! links, touched files, and accumulated errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Session-scoped, human-readable task identifier.
///
/// IDs are normalized to canonical uppercase so that plan-file spellings
/// (`t1`, `T1`, ` t1 `) all resolve to the same task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task ID, normalizing to canonical uppercase form.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of the plan session a task belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse task status driving dispatch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet satisfied.
    Created,
    /// Every dependency completed; eligible for dispatch.
    Ready,
    /// Handed to a workflow, work not yet started.
    Dispatched,
    /// A workflow is actively working on it.
    InProgress,
    /// Waiting on an external subsystem (compile, human response).
    WaitingExternal,
    /// A fix workflow is addressing accumulated errors.
    ErrorFixing,
    /// Terminal: work done and verified.
    Completed,
}

impl TaskStatus {
    /// Terminal statuses are never overwritten by reconciliation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Active statuses represent in-flight work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Dispatched
                | TaskStatus::InProgress
                | TaskStatus::WaitingExternal
                | TaskStatus::ErrorFixing
        )
    }

    /// Inert statuses accept plan edits freely.
    pub fn is_inert(&self) -> bool {
        matches!(self, TaskStatus::Created | TaskStatus::Ready)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::WaitingExternal => "waiting_external",
            TaskStatus::ErrorFixing => "error_fixing",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Fine-grained progress stage within a task's implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Pending,
    InProgress,
    Implemented,
    Compiling,
    Compiled,
    CompileFailed,
    TestingUnit,
    TestingPlaymode,
    TestPassed,
    TestFailed,
    ErrorFixing,
    Deferred,
    Completed,
}

impl Default for TaskStage {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStage::Pending => "pending",
            TaskStage::InProgress => "in_progress",
            TaskStage::Implemented => "implemented",
            TaskStage::Compiling => "compiling",
            TaskStage::Compiled => "compiled",
            TaskStage::CompileFailed => "compile_failed",
            TaskStage::TestingUnit => "testing_unit",
            TaskStage::TestingPlaymode => "testing_playmode",
            TaskStage::TestPassed => "test_passed",
            TaskStage::TestFailed => "test_failed",
            TaskStage::ErrorFixing => "error_fixing",
            TaskStage::Deferred => "deferred",
            TaskStage::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Verification policy inferred from a task description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPolicy {
    /// Run unit tests after implementation.
    UnitTests,
    /// Drive an engine play-mode run to verify behavior.
    PlayModeTest,
    /// Compilation success is sufficient verification.
    CompileOnly,
    /// Visual or UX work that a human must eyeball.
    ManualVerify,
}

impl std::fmt::Display for TestPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestPolicy::UnitTests => "unit_tests",
            TestPolicy::PlayModeTest => "playmode_test",
            TestPolicy::CompileOnly => "compile_only",
            TestPolicy::ManualVerify => "manual_verify",
        };
        write!(f, "{}", s)
    }
}

/// A task entry from an externally parsed plan document.
///
/// This is the reconciliation input shape: the plan parser itself lives
/// outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Engineer role the plan assigns, if any.
    #[serde(default)]
    pub engineer: Option<String>,
}

impl PlanTask {
    pub fn new(id: &str, description: &str, depends_on: &[&str]) -> Self {
        Self {
            id: TaskId::new(id),
            description: description.to_string(),
            depends_on: depends_on.iter().map(|d| TaskId::new(d)).collect(),
            engineer: None,
        }
    }
}

/// A single task in the dispatch graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Canonical identifier.
    pub id: TaskId,
    /// Owning plan session.
    pub session: SessionId,
    /// What the task should accomplish.
    pub description: String,
    /// Coarse dispatch status.
    pub status: TaskStatus,
    /// Fine-grained progress stage.
    pub stage: TaskStage,
    /// IDs of tasks that must complete first.
    pub depends_on: Vec<TaskId>,
    /// Derived inverse of `depends_on`, maintained by the graph.
    #[serde(default)]
    pub dependents: Vec<TaskId>,
    /// Dispatch priority; lower dispatches first. Defaults to insertion order.
    pub priority: u32,
    /// Insertion position in the graph; the dispatch tie-break.
    #[serde(default)]
    pub ordinal: u32,
    /// Files this task has touched, as reported by agents.
    #[serde(default)]
    pub files_touched: Vec<PathBuf>,
    /// Accumulated error messages across attempts.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Engineer role declared in the plan.
    pub declared_engineer: Option<String>,
    /// Engineer actually assigned at runtime.
    pub actual_engineer: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in `Created`/`Pending` state.
    pub fn new(id: TaskId, session: SessionId, description: &str, priority: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            session,
            description: description.to_string(),
            status: TaskStatus::Created,
            stage: TaskStage::Pending,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            priority,
            ordinal: 0,
            files_touched: Vec::new(),
            errors: Vec::new(),
            declared_engineer: None,
            actual_engineer: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a task from a plan entry.
    pub fn from_plan(plan: &PlanTask, session: SessionId, priority: u32) -> Self {
        let mut task = Self::new(plan.id.clone(), session, &plan.description, priority);
        task.depends_on = plan.depends_on.clone();
        task.declared_engineer = plan.engineer.clone();
        task
    }

    /// Record an error message against this task.
    pub fn record_error(&mut self, error: &str) {
        self.errors.push(error.to_string());
        self.touch();
    }

    /// Record files reported as touched by an agent.
    pub fn record_files(&mut self, files: &[PathBuf]) {
        for f in files {
            if !self.files_touched.contains(f) {
                self.files_touched.push(f.clone());
            }
        }
        self.touch();
    }

    /// Update the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the task still needs work.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}
