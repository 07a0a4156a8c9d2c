//! Occupancy registry: which workflow is working on which task.
//!
//! Workflows declare occupancy before touching a task so that concurrent
//! workflows can detect overlap. The registry only records and answers
//! preference queries; enforcement of a conflict decision belongs to the
//! coordinator driving the workflows.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::workflow::WorkflowId;
use crate::{flog, flog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// How a workflow intends to hold a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyMode {
    /// Sole writer; overlapping exclusive claims are conflicts.
    Exclusive,
    /// Read-mostly participation; coexists with other shared holders.
    Shared,
}

/// One workflow's claim over one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occupancy {
    pub workflow: WorkflowId,
    pub mode: OccupancyMode,
    pub declared_at: DateTime<Utc>,
}

/// What a conflicting declarer wants done about existing holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Ask the coordinator to cancel the other holders.
    CancelOthers,
    /// Queue behind the other holders.
    WaitForOthers,
    /// Give up if anything holds the task.
    AbortIfOccupied,
}

/// The registry's answer to a conflicting declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAdvice {
    /// Queue and retry later.
    Wait,
    /// No live holders remain, or every holder yielded; go ahead.
    Proceed,
    /// The declarer asked to abort, or a holder demanded it.
    Abort,
}

/// Per-workflow hook answering conflict queries for the tasks it holds.
///
/// Called with the contested task and the declaring workflow; returns
/// what the declarer should do. Holders without a registered handler
/// answer `Wait`. The registry never holds its lock across a call, so a
/// handler may read the registry itself.
pub type ConflictHandler = Arc<dyn Fn(&TaskId, &WorkflowId) -> ConflictAdvice + Send + Sync>;

/// Append-only record of a detected overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub task: TaskId,
    pub declarer: WorkflowId,
    pub holders: Vec<WorkflowId>,
    /// Each holder's answer to the preference query, in holder order.
    #[serde(default)]
    pub holder_answers: Vec<ConflictAdvice>,
    pub resolution: ConflictResolution,
    pub advice: ConflictAdvice,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    occupancy: HashMap<TaskId, Vec<Occupancy>>,
    conflicts: Vec<ConflictRecord>,
    handlers: HashMap<WorkflowId, ConflictHandler>,
}

/// Shared task-occupancy ledger.
///
/// Mutations are synchronous behind one lock; no async work happens while
/// the lock is held.
#[derive(Default)]
pub struct OccupancyRegistry {
    inner: Mutex<RegistryInner>,
}

impl OccupancyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare occupancy over a task.
    ///
    /// An exclusive claim over an exclusively-held task is recorded as a
    /// conflict and rejected with `Error::Validation`; the caller should go
    /// through [`OccupancyRegistry::declare_conflict`] instead. Re-declaring
    /// a task the workflow already holds updates the mode in place.
    pub fn declare(&self, task: &TaskId, workflow: &WorkflowId, mode: OccupancyMode) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let holders = inner.occupancy.entry(task.clone()).or_default();

        if let Some(existing) = holders.iter_mut().find(|o| o.workflow == *workflow) {
            existing.mode = mode;
            existing.declared_at = Utc::now();
            return Ok(());
        }

        let exclusive_holder = holders
            .iter()
            .find(|o| o.mode == OccupancyMode::Exclusive)
            .map(|o| o.workflow);
        if mode == OccupancyMode::Exclusive {
            if let Some(holder) = exclusive_holder {
                let record = ConflictRecord {
                    task: task.clone(),
                    declarer: *workflow,
                    holders: vec![holder],
                    holder_answers: vec![ConflictAdvice::Wait],
                    resolution: ConflictResolution::WaitForOthers,
                    advice: ConflictAdvice::Wait,
                    at: Utc::now(),
                };
                inner.conflicts.push(record);
                flog_warn!(
                    "Occupancy: {} blocked on {} (held exclusively by {})",
                    workflow.short(),
                    task,
                    holder
                );
                return Err(Error::Validation(format!(
                    "task {} is exclusively held by workflow {}",
                    task, holder
                )));
            }
        }

        holders.push(Occupancy {
            workflow: *workflow,
            mode,
            declared_at: Utc::now(),
        });
        flog!("Occupancy: {} holds {} ({:?})", workflow.short(), task, mode);
        Ok(())
    }

    /// Current holders of a task.
    pub fn owners_of(&self, task: &TaskId) -> Vec<Occupancy> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.occupancy.get(task).cloned().unwrap_or_default()
    }

    /// True if any workflow holds the task.
    pub fn is_occupied(&self, task: &TaskId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.occupancy.get(task).is_some_and(|h| !h.is_empty())
    }

    /// Tasks held by a workflow.
    pub fn tasks_of(&self, workflow: &WorkflowId) -> Vec<TaskId> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks: Vec<TaskId> = inner
            .occupancy
            .iter()
            .filter(|(_, holders)| holders.iter().any(|o| o.workflow == *workflow))
            .map(|(t, _)| t.clone())
            .collect();
        tasks.sort();
        tasks
    }

    /// Register the conflict handler answering for a workflow's claims.
    ///
    /// Replaces any previous handler; dropped again when the workflow is
    /// released.
    pub fn register_conflict_handler(&self, workflow: &WorkflowId, handler: ConflictHandler) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.insert(*workflow, handler);
    }

    /// Drop every claim a workflow holds. Returns the released task IDs.
    pub fn release_workflow(&self, workflow: &WorkflowId) -> Vec<TaskId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.remove(workflow);
        let mut released = Vec::new();
        inner.occupancy.retain(|task, holders| {
            let before = holders.len();
            holders.retain(|o| o.workflow != *workflow);
            if holders.len() != before {
                released.push(task.clone());
            }
            !holders.is_empty()
        });
        released.sort();
        if !released.is_empty() {
            flog!(
                "Occupancy: released {} task(s) held by {}",
                released.len(),
                workflow.short()
            );
        }
        released
    }

    /// Declare intent over possibly-occupied tasks and get a preference back.
    ///
    /// Every holder of a contested task is asked through its registered
    /// [`ConflictHandler`] (absent handlers answer `Wait`): any `Abort`
    /// answer aborts the declarer, a unanimous `Proceed` lets it go ahead,
    /// anything else queues it. `AbortIfOccupied` short-circuits to `Abort`
    /// before the holders are asked. `CancelOthers` still queues because
    /// the registry cannot cancel workflows itself; the coordinator reads
    /// the conflict log and acts. Every overlap is appended to the log.
    pub fn declare_conflict(
        &self,
        tasks: &[TaskId],
        declarer: &WorkflowId,
        resolution: ConflictResolution,
    ) -> ConflictAdvice {
        let (contested, handlers) = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut contested: Vec<(TaskId, Vec<WorkflowId>)> = Vec::new();
            for task in tasks {
                let holders: Vec<WorkflowId> = inner
                    .occupancy
                    .get(task)
                    .map(|hs| {
                        hs.iter()
                            .filter(|o| o.workflow != *declarer)
                            .map(|o| o.workflow)
                            .collect()
                    })
                    .unwrap_or_default();
                if !holders.is_empty() {
                    contested.push((task.clone(), holders));
                }
            }
            let handlers: HashMap<WorkflowId, ConflictHandler> = contested
                .iter()
                .flat_map(|(_, hs)| hs.iter())
                .filter_map(|h| inner.handlers.get(h).map(|f| (*h, f.clone())))
                .collect();
            (contested, handlers)
        };

        if contested.is_empty() {
            return ConflictAdvice::Proceed;
        }

        // Query holders outside the lock.
        let answered: Vec<(TaskId, Vec<WorkflowId>, Vec<ConflictAdvice>)> = contested
            .into_iter()
            .map(|(task, holders)| {
                let answers: Vec<ConflictAdvice> = holders
                    .iter()
                    .map(|h| {
                        handlers
                            .get(h)
                            .map(|f| f(&task, declarer))
                            .unwrap_or(ConflictAdvice::Wait)
                    })
                    .collect();
                (task, holders, answers)
            })
            .collect();

        let all_answers = answered.iter().flat_map(|(_, _, a)| a.iter().copied());
        let advice = if resolution == ConflictResolution::AbortIfOccupied {
            ConflictAdvice::Abort
        } else {
            let answers: Vec<ConflictAdvice> = all_answers.collect();
            if answers.iter().any(|a| *a == ConflictAdvice::Abort) {
                ConflictAdvice::Abort
            } else if answers.iter().all(|a| *a == ConflictAdvice::Proceed) {
                ConflictAdvice::Proceed
            } else {
                ConflictAdvice::Wait
            }
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (task, holders, holder_answers) in answered {
            flog_warn!(
                "Occupancy conflict: {} wants {} held by {} workflow(s), advice {:?}",
                declarer.short(),
                task,
                holders.len(),
                advice
            );
            inner.conflicts.push(ConflictRecord {
                task,
                declarer: *declarer,
                holders,
                holder_answers,
                resolution,
                advice,
                at: Utc::now(),
            });
        }
        advice
    }

    /// Snapshot of the conflict log.
    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.conflicts.clone()
    }
}
