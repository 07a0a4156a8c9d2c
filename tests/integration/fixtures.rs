//! Test fixtures for integration tests.
//!
//! Provides a scripted mock agent runner, a fully wired engine harness,
//! and plan-building helpers.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

use async_trait::async_trait;
use foreman::runner::{AgentInvocation, AgentOutcome};
use foreman::workflow::EventWaiters;
use foreman::{
    AgentPool, AgentRunner, Config, OccupancyRegistry, PlanTask, PoolEvent, Result, SessionId,
    TaskGraph, TaskId, TaskStatus, WorkflowEngine,
};

/// Canned agent output containing a well-formed summary block.
pub fn summary_block(result: &str, files: &str) -> String {
    format!(
        "agent chatter...\n===TASK_SUMMARY_START===\nRESULT: {}\nMESSAGE: scripted outcome\nFILES: {}\n===TASK_SUMMARY_END===\n",
        result, files
    )
}

/// Runner that pops scripted outcomes in order and records every prompt.
pub struct MockRunner {
    script: StdMutex<VecDeque<Result<AgentOutcome>>>,
    prompts: StdMutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(script: Vec<Result<AgentOutcome>>) -> Self {
        Self {
            script: StdMutex::new(script.into_iter().collect()),
            prompts: StdMutex::new(Vec::new()),
        }
    }

    /// Outcome with exit code 0 and the given log text.
    pub fn ok(text: &str) -> Result<AgentOutcome> {
        Ok(AgentOutcome {
            log_text: text.to_string(),
            exit_code: 0,
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutcome> {
        self.prompts.lock().unwrap().push(invocation.prompt.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockRunner::ok("unscripted invocation"))
    }
}

/// A fully wired engine with mock runner and in-memory services.
pub struct Harness {
    pub engine: WorkflowEngine,
    pub pool: Arc<AgentPool>,
    pub occupancy: Arc<OccupancyRegistry>,
    pub graph: Arc<Mutex<TaskGraph>>,
    pub events: EventWaiters,
    pub runner: Arc<MockRunner>,
    pub pool_events: mpsc::Receiver<PoolEvent>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(agents: usize, script: Vec<Result<AgentOutcome>>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = Config::default();
        config.log_dir = Some(dir.path().to_string_lossy().into_owned());
        config.event_timeout_secs = 2;

        let roster: Vec<String> = config.roster.iter().take(agents).cloned().collect();
        let (tx, rx) = mpsc::channel(256);
        let pool = Arc::new(AgentPool::new(&roster, tx));
        let occupancy = Arc::new(OccupancyRegistry::new());
        let graph = Arc::new(Mutex::new(TaskGraph::new()));
        let events = EventWaiters::new();
        let runner = Arc::new(MockRunner::new(script));
        let engine = WorkflowEngine::new(
            pool.clone(),
            occupancy.clone(),
            graph.clone(),
            runner.clone(),
            events.clone(),
            config,
        );
        Self {
            engine,
            pool,
            occupancy,
            graph,
            events,
            runner,
            pool_events: rx,
            _dir: dir,
        }
    }

    /// Add plan tasks, compute readiness, and dispatch one task by id.
    pub async fn seed_dispatched(&self, plan: &[PlanTask], dispatch: &str) -> TaskId {
        let mut graph = self.graph.lock().await;
        for task in plan {
            graph
                .add_plan_task(task, SessionId::new("main"))
                .expect("seed task");
        }
        graph.recompute_readiness();
        let id = TaskId::new(dispatch);
        graph
            .transition(&id, TaskStatus::Dispatched, "test dispatch")
            .expect("dispatch seeded task");
        id
    }
}

/// Shorthand plan builder.
pub fn plan(id: &str, deps: &[&str]) -> PlanTask {
    PlanTask::new(id, &format!("{} work item", id), deps)
}

/// A scratch working directory for invocations.
pub fn scratch_cwd() -> PathBuf {
    std::env::temp_dir()
}
