//! Task dependency graph with readiness propagation and dispatch ordering.
//!
//! The graph is an ownership-by-identity map keyed by canonical task ID.
//! Dependency edges live on the tasks themselves (`depends_on`), with the
//! derived `dependents` lists rebuilt whenever edges change. petgraph is
//! used to validate that the edge set stays acyclic, the same way the
//! execution DAG validated inserts.
//!
//! All mutations are synchronous and atomic: an operation either fully
//! applies or rejects with no observable partial state.

use crate::core::task::{PlanTask, SessionId, Task, TaskId, TaskStage, TaskStatus, TestPolicy};
use crate::error::{Error, Result};
use crate::{flog, flog_debug, flog_warn};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a reconciliation left a task in a conflicted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Plan edited an in-progress task; the task was deferred instead.
    ActiveTaskEdited,
    /// Plan dropped an in-progress task; the task was retained.
    ActiveTaskOrphaned,
}

/// One conflicted task from a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConflict {
    pub id: TaskId,
    pub reason: ConflictReason,
}

/// Structured audit diff returned by [`TaskGraph::reconcile`].
///
/// Running reconcile twice with the same plan and no external changes
/// produces an empty diff the second time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileDiff {
    pub created: Vec<TaskId>,
    pub updated: Vec<TaskId>,
    pub deleted: Vec<TaskId>,
    /// Tasks whose plan edits were ignored because the stored task is terminal.
    pub preserved: Vec<TaskId>,
    pub conflicts: Vec<ReconcileConflict>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.preserved.is_empty()
            && self.conflicts.is_empty()
    }
}

/// In-memory dependency graph of tasks with statuses and stages.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    /// Monotonic insertion counter; doubles as the default priority.
    next_ordinal: u32,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task with the given dependency IDs.
    ///
    /// Fails with [`Error::DuplicateTask`] on an ID collision and with
    /// [`Error::DependencyCycle`] if the new edges would close a cycle;
    /// on failure the graph is unchanged.
    pub fn add_task(&mut self, mut task: Task, deps: &[TaskId]) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id.to_string()));
        }

        task.depends_on = deps.to_vec();
        task.ordinal = self.next_ordinal;
        if task.priority == 0 {
            task.priority = self.next_ordinal;
        }
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);

        if self.has_cycle() {
            self.tasks.remove(&id);
            return Err(Error::DependencyCycle(id.to_string()));
        }

        self.next_ordinal += 1;
        self.rebuild_dependents();
        self.recompute_readiness();
        flog_debug!("TaskGraph::add_task {} deps={:?}", id, deps);
        Ok(())
    }

    /// Convenience: create and insert a task from a plan entry.
    pub fn add_plan_task(&mut self, plan: &PlanTask, session: SessionId) -> Result<()> {
        let deps = plan.depends_on.clone();
        let task = Task::from_plan(plan, session, self.next_ordinal);
        self.add_task(task, &deps)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Rebuild every task's `dependents` list as the exact inverse of
    /// `depends_on`. Called after any edge mutation.
    fn rebuild_dependents(&mut self) {
        let mut inverse: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                inverse.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }
        for task in self.tasks.values_mut() {
            let mut dependents = inverse.remove(&task.id).unwrap_or_default();
            dependents.sort();
            task.dependents = dependents;
        }
    }

    /// Check whether the dependency edge set contains a cycle.
    ///
    /// Edges to unknown task IDs (dependencies declared before the task
    /// exists) are ignored; they can never close a cycle.
    fn has_cycle(&self) -> bool {
        let mut graph: DiGraph<&TaskId, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for id in self.tasks.keys() {
            index.insert(id.clone(), graph.add_node(id));
        }
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, index[&task.id], ());
                }
            }
        }
        is_cyclic_directed(&graph)
    }

    /// Recompute readiness for every inert task.
    ///
    /// A task is `Ready` iff every dependency resolves to a completed
    /// task. Idempotent; demotes `Ready` back to `Created` if a
    /// dependency stopped being satisfied.
    pub fn recompute_readiness(&mut self) {
        let satisfied: Vec<(TaskId, bool)> = self
            .tasks
            .values()
            .filter(|t| t.status.is_inert())
            .map(|t| {
                let ok = t.depends_on.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                });
                (t.id.clone(), ok)
            })
            .collect();

        for (id, ok) in satisfied {
            if let Some(task) = self.tasks.get_mut(&id) {
                let next = if ok { TaskStatus::Ready } else { TaskStatus::Created };
                if task.status != next {
                    task.status = next;
                    task.touch();
                }
            }
        }
    }

    /// Ready tasks in dispatch order: priority ascending, ties broken by
    /// the insertion ordinal (priority defaults to the ordinal, so the
    /// tie-break only matters for explicitly assigned priorities).
    pub fn dispatch_candidates(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready && t.stage != TaskStage::Deferred)
            .collect();
        ready.sort_by_key(|t| (t.priority, t.ordinal));
        ready
    }

    /// Validated status transition. Invalid transitions are rejected with
    /// [`Error::InvalidTransition`], logged, and have no side effect.
    pub fn transition(&mut self, id: &TaskId, to: TaskStatus, reason: &str) -> Result<()> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let from = task.status;

        if !Self::status_transition_allowed(from, to) {
            flog_warn!(
                "Rejected transition {}: {} -> {} ({})",
                id,
                from,
                to,
                reason
            );
            return Err(Error::InvalidTransition {
                task: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let task = self.tasks.get_mut(id).expect("checked above");
        task.status = to;
        task.touch();
        flog!("Task {} {} -> {} ({})", id, from, to, reason);
        self.recompute_readiness();
        Ok(())
    }

    /// Validated stage transition, same contract as [`Self::transition`].
    pub fn set_stage(&mut self, id: &TaskId, to: TaskStage, reason: &str) -> Result<()> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let from = task.stage;

        if !Self::stage_transition_allowed(from, to) {
            flog_warn!("Rejected stage {}: {} -> {} ({})", id, from, to, reason);
            return Err(Error::InvalidTransition {
                task: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let task = self.tasks.get_mut(id).expect("checked above");
        task.stage = to;
        task.touch();
        flog_debug!("Task {} stage {} -> {} ({})", id, from, to, reason);
        Ok(())
    }

    fn status_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Created, Ready)
                | (Ready, Created)
                | (Ready, Dispatched)
                | (Dispatched, Ready) // returned to queue, dispatch aborted
                | (Dispatched, InProgress)
                | (InProgress, WaitingExternal)
                | (InProgress, ErrorFixing)
                | (InProgress, Completed)
                | (WaitingExternal, InProgress)
                | (WaitingExternal, ErrorFixing)
                | (ErrorFixing, InProgress)
                | (ErrorFixing, Completed)
        )
    }

    fn stage_transition_allowed(from: TaskStage, to: TaskStage) -> bool {
        use TaskStage::*;
        if to == Deferred {
            // Any stage may be deferred.
            return true;
        }
        matches!(
            (from, to),
            (Pending, InProgress)
                | (InProgress, Implemented)
                | (Implemented, Compiling)
                | (Compiling, Compiled)
                | (Compiling, CompileFailed)
                | (CompileFailed, ErrorFixing)
                | (ErrorFixing, Compiling)
                | (ErrorFixing, InProgress)
                | (Compiled, TestingUnit)
                | (Compiled, TestingPlaymode)
                | (Compiled, Completed) // compile-only policy
                | (TestingUnit, TestPassed)
                | (TestingUnit, TestFailed)
                | (TestingPlaymode, TestPassed)
                | (TestingPlaymode, TestFailed)
                | (TestFailed, ErrorFixing)
                | (TestPassed, Completed)
                | (Deferred, Pending)
                | (Deferred, InProgress)
        )
    }

    /// Un-defer a task so the external coordinator can resume it.
    ///
    /// The recovery path for deferred tasks is owned outside this crate;
    /// this is the hook it uses.
    pub fn undefer(&mut self, id: &TaskId) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if task.stage != TaskStage::Deferred {
            return Err(Error::Validation(format!("task {} is not deferred", id)));
        }
        task.stage = if task.status.is_active() {
            TaskStage::InProgress
        } else {
            TaskStage::Pending
        };
        task.touch();
        flog!("Task {} un-deferred", id);
        Ok(())
    }

    /// Three-way merge between the live task set and a freshly parsed plan.
    ///
    /// Per task ID:
    /// - in plan, not in store: create
    /// - in both, store terminal: preserve, ignore plan edits
    /// - in both, store active and edited: defer, report conflict
    /// - in both, store inert: apply plan edits
    /// - store only, terminal: keep (work already done)
    /// - store only, active: report conflict, keep unless `force`
    /// - store only, inert: delete
    pub fn reconcile(
        &mut self,
        plan: &[PlanTask],
        session: SessionId,
        force: bool,
    ) -> Result<ReconcileDiff> {
        // Reject plans whose own edges contain a cycle before mutating.
        if plan_has_cycle(plan) {
            return Err(Error::DependencyCycle("plan".to_string()));
        }

        let mut diff = ReconcileDiff::default();
        let plan_ids: HashMap<&TaskId, &PlanTask> = plan.iter().map(|p| (&p.id, p)).collect();

        // Pass 1: plan entries against the store.
        for entry in plan {
            match self.tasks.get_mut(&entry.id) {
                None => {
                    let mut task = Task::from_plan(entry, session.clone(), self.next_ordinal);
                    task.ordinal = self.next_ordinal;
                    self.next_ordinal += 1;
                    self.tasks.insert(entry.id.clone(), task);
                    diff.created.push(entry.id.clone());
                }
                Some(existing) => {
                    let edited = existing.description != entry.description
                        || existing.depends_on != entry.depends_on;
                    if !edited {
                        continue;
                    }
                    if existing.status.is_terminal() {
                        diff.preserved.push(entry.id.clone());
                    } else if existing.status.is_active() {
                        // Observable deferral instead of a silent overwrite;
                        // recovery is external (see undefer).
                        existing.stage = TaskStage::Deferred;
                        existing.touch();
                        diff.conflicts.push(ReconcileConflict {
                            id: entry.id.clone(),
                            reason: ConflictReason::ActiveTaskEdited,
                        });
                    } else {
                        existing.description = entry.description.clone();
                        existing.depends_on = entry.depends_on.clone();
                        existing.declared_engineer = entry.engineer.clone();
                        existing.touch();
                        diff.updated.push(entry.id.clone());
                    }
                }
            }
        }

        // Pass 2: store entries missing from the plan.
        let stored_ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        for id in stored_ids {
            if plan_ids.contains_key(&id) {
                continue;
            }
            let status = self.tasks[&id].status;
            if status.is_terminal() {
                // Work already done; keep silently.
            } else if status.is_active() {
                diff.conflicts.push(ReconcileConflict {
                    id: id.clone(),
                    reason: ConflictReason::ActiveTaskOrphaned,
                });
                if force {
                    self.tasks.remove(&id);
                    diff.deleted.push(id);
                }
            } else {
                self.tasks.remove(&id);
                diff.deleted.push(id);
            }
        }

        if self.has_cycle() {
            // The plan merged with preserved store tasks closed a cycle.
            return Err(Error::DependencyCycle("reconcile".to_string()));
        }

        self.rebuild_dependents();
        self.recompute_readiness();
        flog!(
            "Reconcile: +{} ~{} -{} preserved={} conflicts={}",
            diff.created.len(),
            diff.updated.len(),
            diff.deleted.len(),
            diff.preserved.len(),
            diff.conflicts.len()
        );
        Ok(diff)
    }

    /// Classify a task's verification needs from its description.
    ///
    /// Keyword buckets checked in fixed order; deterministic for the same
    /// input text. Word-level matching avoids substring false positives
    /// ("guide" must not match "ui").
    pub fn infer_test_policy(description: &str) -> TestPolicy {
        let lower = description.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();

        const MANUAL_WORDS: &[&str] = &["ui", "hud", "menu", "visual", "animation", "layout", "polish"];
        const PLAYMODE_WORDS: &[&str] = &["gameplay", "playmode", "physics", "input", "spawn", "level", "movement"];
        const COMPILE_ONLY_WORDS: &[&str] = &["refactor", "rename", "cleanup", "comment", "docs", "documentation", "typo"];

        if words.iter().any(|w| MANUAL_WORDS.contains(w)) {
            return TestPolicy::ManualVerify;
        }
        if lower.contains("play mode") || words.iter().any(|w| PLAYMODE_WORDS.contains(w)) {
            return TestPolicy::PlayModeTest;
        }
        if words.iter().any(|w| COMPILE_ONLY_WORDS.contains(w)) {
            return TestPolicy::CompileOnly;
        }
        TestPolicy::UnitTests
    }
}

fn plan_has_cycle(plan: &[PlanTask]) -> bool {
    let mut graph: DiGraph<&TaskId, ()> = DiGraph::new();
    let mut index = HashMap::new();
    for entry in plan {
        index.insert(&entry.id, graph.add_node(&entry.id));
    }
    for entry in plan {
        for dep in &entry.depends_on {
            if let Some(&from) = index.get(dep) {
                graph.add_edge(from, index[&entry.id], ());
            }
        }
    }
    is_cyclic_directed(&graph)
}
