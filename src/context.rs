//! Context assembly for the external decision-maker.
//!
//! The host periodically ships a snapshot of the whole system to whatever
//! is deciding what to do next (a human, an LLM, a policy script). The
//! snapshot is read-only, self-contained, and serializable; it carries the
//! classifications the decision-maker would otherwise have to re-derive:
//! dependency state per task, capacity per session, cross-session file
//! overlap, and health flags.

use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::core::task::{SessionId, Task, TaskId, TaskStage, TaskStatus};
use crate::pool::{AgentRecord, AgentState};
use crate::workflow::{WorkflowStatus, WorkflowSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Aggregate state of a task's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepsClassification {
    /// Every dependency is completed (or there are none).
    AllComplete,
    /// At least one dependency is still on its way.
    SomePending,
    /// At least one dependency sits in a failure stage.
    SomeFailed,
}

/// Why the assembler thinks attention is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    /// A task finished and nothing picked up the follow-on work.
    TaskCompleted,
    /// Nothing has changed for longer than the stuck threshold.
    NoActivity,
    /// Dispatched work exists but no agent is executing.
    WaitingForAgent,
    /// Agents sit available while ready tasks wait.
    AgentsIdle,
}

/// One task as the decision-maker sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub session: SessionId,
    pub description: String,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub deps: DepsClassification,
    pub engineer: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Agent headcount for one session's open work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCapacity {
    pub session: SessionId,
    pub open_tasks: usize,
    /// Agents it would make sense to give this session right now.
    pub recommended: usize,
    /// Agents held by workflows working this session's tasks.
    pub allocated: usize,
    /// Agents free in the pool; shared across sessions, so the same
    /// number appears on every row.
    pub available: usize,
}

/// Two sessions touching files with the same basename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConflict {
    pub basename: String,
    pub tasks: Vec<TaskId>,
}

/// Health verdict attached to the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthFlags {
    pub stuck: Option<StuckReason>,
    pub detail: Option<String>,
}

/// The full read-only snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// What prompted this snapshot ("timer", "workflow_finished", ...).
    pub trigger: String,
    pub assembled_at: DateTime<Utc>,
    pub tasks: Vec<TaskView>,
    pub agents: Vec<AgentRecord>,
    pub active_workflows: Vec<WorkflowSummary>,
    pub failed_workflows: Vec<WorkflowSummary>,
    pub capacity: Vec<SessionCapacity>,
    pub file_conflicts: Vec<FileConflict>,
    pub health: HealthFlags,
}

/// Builds [`ContextSnapshot`]s from the live services' state.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    stuck_threshold: Duration,
    idle_grace: Duration,
}

impl ContextAssembler {
    pub fn new(config: &Config) -> Self {
        Self {
            stuck_threshold: config.stuck_threshold(),
            idle_grace: config.idle_grace(),
        }
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    /// Assemble a snapshot from current state.
    ///
    /// `now` is passed in so callers (and tests) control the clock.
    pub fn assemble(
        &self,
        trigger: &str,
        graph: &TaskGraph,
        agents: &[AgentRecord],
        workflows: &[WorkflowSummary],
        now: DateTime<Utc>,
    ) -> ContextSnapshot {
        let tasks = self.task_views(graph);
        let (active, failed): (Vec<_>, Vec<_>) = workflows
            .iter()
            .cloned()
            .partition(|w| !w.status.is_terminal());
        let failed: Vec<WorkflowSummary> = failed
            .into_iter()
            .filter(|w| w.status == WorkflowStatus::Failed)
            .collect();
        let capacity = self.capacity(graph, agents, &active);
        let file_conflicts = self.file_conflicts(graph);
        let health = self.health(graph, agents, &active, now);

        ContextSnapshot {
            trigger: trigger.to_string(),
            assembled_at: now,
            tasks,
            agents: agents.to_vec(),
            active_workflows: active,
            failed_workflows: failed,
            capacity,
            file_conflicts,
            health,
        }
    }

    fn task_views(&self, graph: &TaskGraph) -> Vec<TaskView> {
        let mut views: Vec<TaskView> = graph
            .all_tasks()
            .map(|task| TaskView {
                id: task.id.clone(),
                session: task.session.clone(),
                description: task.description.clone(),
                status: task.status,
                stage: task.stage,
                deps: classify_deps(graph, task),
                engineer: task.actual_engineer.clone().or_else(|| task.declared_engineer.clone()),
                updated_at: task.updated_at,
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    fn capacity(
        &self,
        graph: &TaskGraph,
        agents: &[AgentRecord],
        active_workflows: &[WorkflowSummary],
    ) -> Vec<SessionCapacity> {
        let total_agents = agents.len();
        let available = agents
            .iter()
            .filter(|a| a.state == AgentState::Available)
            .count();

        let mut per_session: BTreeMap<SessionId, usize> = BTreeMap::new();
        for task in graph.all_tasks().filter(|t| t.is_open()) {
            *per_session.entry(task.session.clone()).or_default() += 1;
        }

        // Attribute each workflow's held agents to the session its occupied
        // tasks belong to.
        let mut allocated: BTreeMap<SessionId, usize> = BTreeMap::new();
        for workflow in active_workflows {
            if workflow.held_agents.is_empty() {
                continue;
            }
            let session = workflow
                .occupied_tasks
                .iter()
                .find_map(|t| graph.get(t).map(|task| task.session.clone()));
            if let Some(session) = session {
                *allocated.entry(session).or_default() += workflow.held_agents.len();
            }
        }

        let session_count = per_session.len().max(1);
        per_session
            .into_iter()
            .map(|(session, open_tasks)| SessionCapacity {
                allocated: allocated.get(&session).copied().unwrap_or(0),
                // Fair share of the roster, capped by the session's own work.
                recommended: open_tasks.min(total_agents / session_count.max(1)).max(
                    usize::from(open_tasks > 0 && total_agents > 0),
                ),
                available,
                session,
                open_tasks,
            })
            .collect()
    }

    /// Active tasks in different sessions touching a file with the same
    /// basename. Basename matching is deliberate: sessions work in separate
    /// checkouts, so full paths never collide even when the file does.
    fn file_conflicts(&self, graph: &TaskGraph) -> Vec<FileConflict> {
        let mut by_basename: HashMap<String, Vec<(SessionId, TaskId)>> = HashMap::new();
        for task in graph.all_tasks().filter(|t| t.status.is_active()) {
            for file in &task.files_touched {
                let Some(basename) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                by_basename
                    .entry(basename.to_string())
                    .or_default()
                    .push((task.session.clone(), task.id.clone()));
            }
        }

        let mut conflicts: Vec<FileConflict> = by_basename
            .into_iter()
            .filter(|(_, entries)| {
                entries
                    .iter()
                    .any(|(session, _)| *session != entries[0].0)
            })
            .map(|(basename, entries)| {
                let mut tasks: Vec<TaskId> = entries.into_iter().map(|(_, t)| t).collect();
                tasks.sort();
                tasks.dedup();
                FileConflict { basename, tasks }
            })
            .collect();
        conflicts.sort_by(|a, b| a.basename.cmp(&b.basename));
        conflicts
    }

    fn health(
        &self,
        graph: &TaskGraph,
        agents: &[AgentRecord],
        active_workflows: &[WorkflowSummary],
        now: DateTime<Utc>,
    ) -> HealthFlags {
        let open: Vec<&Task> = graph.all_tasks().filter(|t| t.is_open()).collect();
        if open.is_empty() {
            return HealthFlags {
                stuck: None,
                detail: None,
            };
        }

        let last_update = graph.all_tasks().map(|t| t.updated_at).max();
        let idle_for = last_update
            .map(|t| (now - t).to_std().unwrap_or_default())
            .unwrap_or_default();
        let any_agent_working = agents
            .iter()
            .any(|a| matches!(a.state, AgentState::Busy { .. }));
        let any_available = agents
            .iter()
            .any(|a| a.state == AgentState::Available);
        let dispatched = open
            .iter()
            .any(|t| t.status == TaskStatus::Dispatched || t.status == TaskStatus::InProgress);
        let ready = open.iter().any(|t| t.status == TaskStatus::Ready);
        let recently_completed = graph
            .all_tasks()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.updated_at)
            .max()
            .is_some_and(|t| (now - t).to_std().unwrap_or_default() < self.idle_grace);

        if active_workflows.is_empty() && recently_completed {
            return HealthFlags {
                stuck: Some(StuckReason::TaskCompleted),
                detail: Some("work finished and nothing was dispatched after it".to_string()),
            };
        }
        if idle_for >= self.stuck_threshold {
            return HealthFlags {
                stuck: Some(StuckReason::NoActivity),
                detail: Some(format!("no task updates for {:?}", idle_for)),
            };
        }
        if dispatched && !any_agent_working && idle_for >= self.idle_grace {
            return HealthFlags {
                stuck: Some(StuckReason::WaitingForAgent),
                detail: Some("dispatched tasks but no busy agent".to_string()),
            };
        }
        if ready && any_available && active_workflows.is_empty() && idle_for >= self.idle_grace {
            return HealthFlags {
                stuck: Some(StuckReason::AgentsIdle),
                detail: Some("ready tasks and idle agents".to_string()),
            };
        }
        HealthFlags {
            stuck: None,
            detail: None,
        }
    }
}

fn classify_deps(graph: &TaskGraph, task: &Task) -> DepsClassification {
    let mut pending = false;
    for dep in &task.depends_on {
        match graph.get(dep) {
            Some(dep_task) => {
                if matches!(
                    dep_task.stage,
                    TaskStage::CompileFailed | TaskStage::TestFailed
                ) {
                    return DepsClassification::SomeFailed;
                }
                if dep_task.status != TaskStatus::Completed {
                    pending = true;
                }
            }
            // Unknown dependency: treat as pending until reconcile sorts it out.
            None => pending = true,
        }
    }
    if pending {
        DepsClassification::SomePending
    } else {
        DepsClassification::AllComplete
    }
}
