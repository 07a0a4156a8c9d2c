//! Core workflow type definitions.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single execution phase within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Write the code for the task.
    Implement,
    /// Wait for the external build system and read its verdict.
    CompileCheck,
    /// Run the task's test policy.
    Test,
    /// Independent review of the finished work.
    Review,
    /// Diagnose a batch of reported errors.
    Analyze,
    /// Apply fixes for the diagnosed errors.
    Fix,
    /// Confirm the fixes hold.
    Verify,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Implement => write!(f, "implement"),
            Phase::CompileCheck => write!(f, "compile_check"),
            Phase::Test => write!(f, "test"),
            Phase::Review => write!(f, "review"),
            Phase::Analyze => write!(f, "analyze"),
            Phase::Fix => write!(f, "fix"),
            Phase::Verify => write!(f, "verify"),
        }
    }
}

/// The kind of work a workflow performs. Each kind fixes a phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Implement one plan task end to end.
    ImplementTask,
    /// Diagnose and fix a batch of reported errors.
    ResolveErrors,
    /// Review already-finished work.
    ReviewTask,
}

impl WorkflowKind {
    /// The ordered phases this kind executes.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            WorkflowKind::ImplementTask => &[
                Phase::Implement,
                Phase::CompileCheck,
                Phase::Test,
                Phase::Review,
            ],
            WorkflowKind::ResolveErrors => &[Phase::Analyze, Phase::Fix, Phase::Verify],
            WorkflowKind::ReviewTask => &[Phase::Review],
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowKind::ImplementTask => write!(f, "implement_task"),
            WorkflowKind::ResolveErrors => write!(f, "resolve_errors"),
            WorkflowKind::ReviewTask => write!(f, "review_task"),
        }
    }
}

/// Status of a workflow in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but no agent allocated yet.
    #[default]
    Pending,
    /// Actively executing phases.
    Running,
    /// Waiting on the external build subsystem.
    Blocked,
    /// Suspended by the host.
    Paused,
    /// All phases finished with a passing result.
    Succeeded,
    /// A phase failed and the workflow stopped.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Blocked => write!(f, "blocked"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Succeeded => write!(f, "succeeded"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Live record of one workflow's execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub kind: WorkflowKind,
    pub status: WorkflowStatus,
    /// Index into `kind.phases()` of the phase currently (or next) running.
    pub phase_index: usize,
    /// Agent currently executing a phase, if any.
    pub active_agent: Option<String>,
    /// Agents allocated to this workflow but idle between phases.
    pub benched_agents: Vec<String>,
    /// Tasks this workflow has declared occupancy over.
    pub occupied_tasks: Vec<TaskId>,
    /// Tasks reported as contested by other workflows.
    pub conflicting_tasks: Vec<TaskId>,
    /// Compile-fix iterations consumed so far.
    pub fix_iterations: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(kind: WorkflowKind) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            kind,
            status: WorkflowStatus::Pending,
            phase_index: 0,
            active_agent: None,
            benched_agents: Vec::new(),
            occupied_tasks: Vec::new(),
            conflicting_tasks: Vec::new(),
            fix_iterations: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The phase at the current index, if the workflow is not past the end.
    pub fn current_phase(&self) -> Option<Phase> {
        self.kind.phases().get(self.phase_index).copied()
    }

    /// Fraction of phases finished, as a whole percentage.
    pub fn progress_percent(&self) -> u8 {
        let total = self.kind.phases().len();
        if self.status == WorkflowStatus::Succeeded {
            return 100;
        }
        ((self.phase_index * 100) / total.max(1)).min(100) as u8
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Condensed view for context assembly and progress reporting.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            kind: self.kind,
            status: self.status,
            phase: self.current_phase(),
            phase_index: self.phase_index,
            phase_count: self.kind.phases().len(),
            progress_percent: self.progress_percent(),
            active_agent: self.active_agent.clone(),
            held_agents: self
                .active_agent
                .iter()
                .chain(self.benched_agents.iter())
                .cloned()
                .collect(),
            occupied_tasks: self.occupied_tasks.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Condensed workflow view exposed to the external decision-maker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub kind: WorkflowKind,
    pub status: WorkflowStatus,
    pub phase: Option<Phase>,
    pub phase_index: usize,
    pub phase_count: usize,
    pub progress_percent: u8,
    pub active_agent: Option<String>,
    /// Every agent the workflow holds, active and benched.
    #[serde(default)]
    pub held_agents: Vec<String>,
    pub occupied_tasks: Vec<TaskId>,
    pub last_error: Option<String>,
}
