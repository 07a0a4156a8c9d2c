//! Agent pool for multi-workflow agent allocation.
//!
//! The pool tracks a fixed roster of named workers in three states:
//! `Available`, `Benched` (allocated to a workflow but idle, retained for
//! likely reuse), and `Busy` (actively executing). Allocation, release,
//! promotion, and demotion are atomic with respect to each other; when the
//! pool is exhausted, [`AgentPool::acquire`] suspends on a FIFO wait-list
//! and a later release hands the freed agent directly to the oldest waiter.
//!
//! Invariant: every roster name is in exactly one of the three states.

use crate::error::{Error, Result};
use crate::workflow::WorkflowId;
use crate::{flog, flog_debug, flog_warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Allocation state of one roster agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentState {
    /// Not allocated to any workflow.
    Available,
    /// Allocated to a workflow but idle between phases.
    Benched {
        workflow: WorkflowId,
        role: String,
    },
    /// Actively executing for a workflow.
    Busy {
        workflow: WorkflowId,
        role: String,
    },
}

impl AgentState {
    /// The owning workflow, if allocated.
    pub fn owner(&self) -> Option<&WorkflowId> {
        match self {
            AgentState::Available => None,
            AgentState::Benched { workflow, .. } | AgentState::Busy { workflow, .. } => {
                Some(workflow)
            }
        }
    }
}

/// Snapshot of one agent's record, for queries and context assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub state: AgentState,
}

/// Events emitted by the pool for allocation changes.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// An agent was allocated to a workflow.
    Allocated {
        agent: String,
        workflow: WorkflowId,
        role: String,
    },
    /// An agent was returned to the available set.
    Released { agent: String },
    /// A busy agent was parked on the bench.
    Benched { agent: String },
    /// A benched agent went back to work.
    Promoted { agent: String, workflow: WorkflowId },
    /// The roster size changed.
    Resized { size: usize },
}

/// A suspended allocation request.
struct Waiter {
    workflow: WorkflowId,
    role: String,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct PoolInner {
    /// Roster in allocation order. Entries are (name, state).
    agents: Vec<(String, AgentState)>,
    /// FIFO queue of suspended acquire() calls.
    waiters: VecDeque<Waiter>,
    /// Counter for generated names when the roster grows past the seed list.
    next_generated: usize,
}

impl PoolInner {
    fn find(&self, name: &str) -> Option<usize> {
        self.agents.iter().position(|(n, _)| n == name)
    }

    fn first_available(&self) -> Option<usize> {
        self.agents
            .iter()
            .position(|(_, s)| *s == AgentState::Available)
    }
}

/// Shared, mutable roster of named workers.
///
/// All mutations go through one async mutex; no caller holds the lock
/// across a suspension point (waiters park on a oneshot instead).
pub struct AgentPool {
    inner: Mutex<PoolInner>,
    event_tx: mpsc::Sender<PoolEvent>,
}

impl AgentPool {
    /// Create a pool from a seed roster.
    pub fn new(roster: &[String], event_tx: mpsc::Sender<PoolEvent>) -> Self {
        let agents = roster
            .iter()
            .map(|n| (n.clone(), AgentState::Available))
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                agents,
                waiters: VecDeque::new(),
                next_generated: 0,
            }),
            event_tx,
        }
    }

    /// Try to allocate an available agent; returns `None` when exhausted.
    ///
    /// The allocated agent goes straight to `Busy` under the workflow.
    pub async fn try_allocate(&self, workflow: &WorkflowId, role: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let idx = inner.first_available()?;
        let name = inner.agents[idx].0.clone();
        inner.agents[idx].1 = AgentState::Busy {
            workflow: workflow.clone(),
            role: role.to_string(),
        };
        drop(inner);
        flog!("Pool: allocated {} to {} as {}", name, workflow, role);
        let _ = self
            .event_tx
            .send(PoolEvent::Allocated {
                agent: name.clone(),
                workflow: workflow.clone(),
                role: role.to_string(),
            })
            .await;
        Some(name)
    }

    /// Allocate an agent, suspending until one is available.
    ///
    /// Requests are served FIFO. A release while waiters are queued hands
    /// the freed agent directly to the oldest waiter, so the unblocked
    /// caller observes that exact agent name and the agent is never
    /// transiently visible as available.
    pub async fn acquire(&self, workflow: &WorkflowId, role: &str) -> Result<String> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if let Some(idx) = inner.first_available() {
                let name = inner.agents[idx].0.clone();
                inner.agents[idx].1 = AgentState::Busy {
                    workflow: workflow.clone(),
                    role: role.to_string(),
                };
                drop(inner);
                flog!("Pool: allocated {} to {} as {}", name, workflow, role);
                let _ = self
                    .event_tx
                    .send(PoolEvent::Allocated {
                        agent: name.clone(),
                        workflow: workflow.clone(),
                        role: role.to_string(),
                    })
                    .await;
                return Ok(name);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter {
                workflow: workflow.clone(),
                role: role.to_string(),
                tx,
            });
            flog_debug!("Pool exhausted; {} queued for an agent", workflow);
            rx
        };

        let name = rx.await.map_err(|_| Error::PoolClosed)?;
        let _ = self
            .event_tx
            .send(PoolEvent::Allocated {
                agent: name.clone(),
                workflow: workflow.clone(),
                role: role.to_string(),
            })
            .await;
        Ok(name)
    }

    /// Release an agent back to the pool (or directly to a waiter).
    ///
    /// Releasing an already-available agent is a logged no-op.
    pub async fn release(&self, name: &str) -> Result<()> {
        let handed_off = {
            let mut inner = self.inner.lock().await;
            let idx = inner
                .find(name)
                .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
            if inner.agents[idx].1 == AgentState::Available {
                flog_warn!("Pool: release of already-available agent {}", name);
                return Ok(());
            }

            // Hand off to the oldest waiter whose send still has a receiver.
            let mut handed = false;
            while let Some(waiter) = inner.waiters.pop_front() {
                let next_state = AgentState::Busy {
                    workflow: waiter.workflow.clone(),
                    role: waiter.role.clone(),
                };
                if waiter.tx.send(name.to_string()).is_ok() {
                    inner.agents[idx].1 = next_state;
                    handed = true;
                    break;
                }
                // Receiver dropped (caller cancelled); try the next one.
            }
            if !handed {
                inner.agents[idx].1 = AgentState::Available;
            }
            handed
        };

        if handed_off {
            flog!("Pool: {} handed to a queued workflow", name);
        } else {
            flog!("Pool: released {}", name);
            let _ = self
                .event_tx
                .send(PoolEvent::Released {
                    agent: name.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Park a busy agent on the bench, keeping its workflow ownership.
    pub async fn demote_to_bench(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .find(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
        match inner.agents[idx].1.clone() {
            AgentState::Busy { workflow, role } => {
                inner.agents[idx].1 = AgentState::Benched { workflow, role };
                drop(inner);
                flog_debug!("Pool: benched {}", name);
                let _ = self
                    .event_tx
                    .send(PoolEvent::Benched {
                        agent: name.to_string(),
                    })
                    .await;
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "cannot bench {} from state {:?}",
                name, other
            ))),
        }
    }

    /// Put a benched (or just-allocated) agent back to work.
    ///
    /// Fails if the agent is busy under a different workflow.
    pub async fn promote_to_busy(
        &self,
        name: &str,
        workflow: &WorkflowId,
        role: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .find(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
        match inner.agents[idx].1.clone() {
            AgentState::Benched { workflow: owner, .. } if owner == *workflow => {
                inner.agents[idx].1 = AgentState::Busy {
                    workflow: workflow.clone(),
                    role: role.to_string(),
                };
            }
            AgentState::Available => {
                inner.agents[idx].1 = AgentState::Busy {
                    workflow: workflow.clone(),
                    role: role.to_string(),
                };
            }
            AgentState::Busy { workflow: owner, .. } if owner == *workflow => {
                // Already busy for this workflow; just update the role.
                inner.agents[idx].1 = AgentState::Busy {
                    workflow: workflow.clone(),
                    role: role.to_string(),
                };
            }
            AgentState::Benched { workflow: owner, .. }
            | AgentState::Busy { workflow: owner, .. } => {
                return Err(Error::AgentBusy {
                    agent: name.to_string(),
                    owner: owner.to_string(),
                });
            }
        }
        drop(inner);
        flog_debug!("Pool: promoted {} for {}", name, workflow);
        let _ = self
            .event_tx
            .send(PoolEvent::Promoted {
                agent: name.to_string(),
                workflow: workflow.clone(),
            })
            .await;
        Ok(())
    }

    /// Release every agent owned by a workflow (busy or benched).
    ///
    /// Returns the names released. Used by workflow cleanup.
    pub async fn release_all(&self, workflow: &WorkflowId) -> Vec<String> {
        let owned: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .agents
                .iter()
                .filter(|(_, s)| s.owner() == Some(workflow))
                .map(|(n, _)| n.clone())
                .collect()
        };
        let mut released = Vec::new();
        for name in owned {
            if self.release(&name).await.is_ok() {
                released.push(name);
            }
        }
        released
    }

    /// Grow or shrink the roster.
    ///
    /// Growth appends generated names; shrink removes only agents that
    /// are currently available, so it may stop short of the target.
    pub async fn resize(&self, target: usize) -> usize {
        let size = {
            let mut inner = self.inner.lock().await;
            while inner.agents.len() < target {
                inner.next_generated += 1;
                let name = format!("Worker-{}", inner.next_generated);
                inner.agents.push((name, AgentState::Available));
            }
            while inner.agents.len() > target {
                let Some(idx) = inner.first_available() else {
                    break;
                };
                let (name, _) = inner.agents.remove(idx);
                flog_debug!("Pool: removed {} on shrink", name);
            }
            inner.agents.len()
        };
        flog!("Pool resized to {}", size);
        let _ = self.event_tx.send(PoolEvent::Resized { size }).await;
        size
    }

    /// Current state of one agent.
    pub async fn state_of(&self, name: &str) -> Option<AgentState> {
        let inner = self.inner.lock().await;
        inner.find(name).map(|i| inner.agents[i].1.clone())
    }

    /// Snapshot of every agent record.
    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .iter()
            .map(|(name, state)| AgentRecord {
                name: name.clone(),
                state: state.clone(),
            })
            .collect()
    }

    /// Roster size.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.agents.len()
    }

    /// Number of agents currently available.
    pub async fn available_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .agents
            .iter()
            .filter(|(_, s)| *s == AgentState::Available)
            .count()
    }

    /// Number of agents allocated (busy or benched) to a workflow.
    pub async fn allocated_to(&self, workflow: &WorkflowId) -> usize {
        let inner = self.inner.lock().await;
        inner
            .agents
            .iter()
            .filter(|(_, s)| s.owner() == Some(workflow))
            .count()
    }
}
