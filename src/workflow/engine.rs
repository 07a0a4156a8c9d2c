//! Workflow execution engine.
//!
//! Drives one workflow instance through its phase sequence: allocate an
//! agent, run the phase, extract a verdict, then bench or release the
//! agent. The engine owns no policy about WHICH workflows run; the
//! coordinator creates them and the engine executes them faithfully.
//!
//! Failure handling is deliberately flat: a phase that fails is classified,
//! recorded, and propagated. The one sanctioned loop is the compile-fix
//! cycle after a failed compile check, bounded by a visible iteration
//! counter. Every exit path, success or not, runs the same cleanup.

use crate::classify::{classify_error, ErrorClass};
use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::core::task::{TaskId, TaskStage, TaskStatus};
use crate::error::{Error, Result};
use crate::occupancy::{ConflictAdvice, ConflictResolution, OccupancyMode, OccupancyRegistry};
use crate::pool::AgentPool;
use crate::runner::{AgentInvocation, AgentRunner};
use crate::workflow::events::EventWaiters;
use crate::workflow::extract::{extract_result, PhaseResult};
use crate::workflow::types::{
    Phase, WorkflowId, WorkflowInstance, WorkflowKind, WorkflowStatus, WorkflowSummary,
};
use crate::{flog, flog_error, flog_warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Poll interval while queued behind another workflow's occupancy.
const OCCUPANCY_POLL: Duration = Duration::from_millis(250);

/// Poll interval while paused.
const PAUSE_POLL: Duration = Duration::from_millis(250);

/// Event type carrying the external build verdict for one workflow.
pub fn compile_event_type(id: &WorkflowId) -> String {
    format!("compile_finished:{}", id.short())
}

/// What the coordinator asks the engine to run.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub kind: WorkflowKind,
    /// Tasks this workflow works on; occupancy is declared over all of them.
    pub tasks: Vec<TaskId>,
    /// Task-specific context prepended to every phase prompt.
    pub prompt: String,
    pub cwd: PathBuf,
    /// What to do when another workflow already holds one of the tasks.
    pub conflict_resolution: ConflictResolution,
}

impl WorkflowRequest {
    pub fn new(kind: WorkflowKind, tasks: Vec<TaskId>, prompt: &str, cwd: PathBuf) -> Self {
        Self {
            kind,
            tasks,
            prompt: prompt.to_string(),
            cwd,
            conflict_resolution: ConflictResolution::WaitForOthers,
        }
    }

    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }
}

/// External control surface for one running workflow.
#[derive(Clone)]
pub struct WorkflowHandle {
    pub id: WorkflowId,
    instance: Arc<Mutex<WorkflowInstance>>,
    cancel: CancellationToken,
}

impl WorkflowHandle {
    pub async fn summary(&self) -> WorkflowSummary {
        self.instance.lock().await.summary()
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.instance.lock().await.status
    }

    /// Request cooperative cancellation, observed at the next boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Suspend at the next phase boundary.
    pub async fn pause(&self) {
        let mut instance = self.instance.lock().await;
        if !instance.status.is_terminal() {
            instance.status = WorkflowStatus::Paused;
            instance.touch();
        }
    }

    pub async fn resume(&self) {
        let mut instance = self.instance.lock().await;
        if instance.status == WorkflowStatus::Paused {
            // Running is reserved for workflows that have held an agent.
            let started = instance.phase_index > 0
                || instance.active_agent.is_some()
                || !instance.benched_agents.is_empty();
            instance.status = if started {
                WorkflowStatus::Running
            } else {
                WorkflowStatus::Pending
            };
            instance.touch();
        }
    }
}

/// Executes workflows against shared services.
///
/// Every collaborator is injected at construction so tests can substitute
/// a mock runner and an in-memory graph.
pub struct WorkflowEngine {
    pool: Arc<AgentPool>,
    occupancy: Arc<OccupancyRegistry>,
    graph: Arc<Mutex<TaskGraph>>,
    runner: Arc<dyn AgentRunner>,
    events: EventWaiters,
    config: Config,
}

impl WorkflowEngine {
    pub fn new(
        pool: Arc<AgentPool>,
        occupancy: Arc<OccupancyRegistry>,
        graph: Arc<Mutex<TaskGraph>>,
        runner: Arc<dyn AgentRunner>,
        events: EventWaiters,
        config: Config,
    ) -> Self {
        Self {
            pool,
            occupancy,
            graph,
            runner,
            events,
            config,
        }
    }

    /// Create the instance and control handle for a request.
    ///
    /// The workflow stays `Pending` until [`WorkflowEngine::execute`] gets
    /// its first agent.
    pub fn prepare(&self, request: &WorkflowRequest) -> WorkflowHandle {
        let mut instance = WorkflowInstance::new(request.kind);
        instance.occupied_tasks = request.tasks.clone();
        WorkflowHandle {
            id: instance.id,
            instance: Arc::new(Mutex::new(instance)),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the workflow to a terminal status.
    ///
    /// Returns the final summary on success; the failure path records the
    /// classified error on the instance before propagating. Cleanup
    /// (agents, occupancy) runs on every exit path.
    pub async fn execute(
        &self,
        request: &WorkflowRequest,
        handle: &WorkflowHandle,
    ) -> Result<WorkflowSummary> {
        let outcome = self.execute_inner(request, handle).await;
        self.cleanup(handle).await;

        let mut instance = handle.instance.lock().await;
        match &outcome {
            Ok(()) => {
                instance.status = WorkflowStatus::Succeeded;
                instance.touch();
                flog!("Workflow {} succeeded", handle.id.short());
                Ok(instance.summary())
            }
            Err(Error::WorkflowCancelled(_)) => {
                instance.status = WorkflowStatus::Cancelled;
                instance.touch();
                flog!("Workflow {} cancelled", handle.id.short());
                outcome.map(|_| instance.summary())
            }
            Err(e) => {
                let class = classify_error(&e.to_string());
                instance.status = WorkflowStatus::Failed;
                instance.last_error = Some(e.to_string());
                instance.touch();
                flog_error!(
                    "Workflow {} failed ({:?}): {}",
                    handle.id.short(),
                    class,
                    e
                );
                outcome.map(|_| instance.summary())
            }
        }
    }

    async fn execute_inner(
        &self,
        request: &WorkflowRequest,
        handle: &WorkflowHandle,
    ) -> Result<()> {
        self.claim_tasks(request, handle).await?;
        self.mark_tasks_started(request).await;

        let phases = request.kind.phases();
        let mut index = 0;
        while index < phases.len() {
            self.checkpoint(handle).await?;
            let phase = phases[index];
            {
                let mut instance = handle.instance.lock().await;
                instance.phase_index = index;
                instance.touch();
            }

            let agent = self.agent_for_phase(handle, phase).await?;
            flog!(
                "Workflow {} phase {} running with {}",
                handle.id.short(),
                phase,
                agent
            );
            if phase == Phase::Test {
                self.advance_stage(request, TaskStage::TestingUnit, "tests running")
                    .await;
            }

            let result = match phase {
                Phase::CompileCheck => self.run_compile_check(request, handle, &agent).await?,
                _ => self.run_agent_phase(request, handle, phase, &agent).await?,
            };

            match result {
                PhaseResult::Success | PhaseResult::Approved => {}
                other => {
                    return Err(Error::PhaseFailed {
                        phase: phase.to_string(),
                        message: format!("phase reported {}", other),
                    });
                }
            }
            match phase {
                Phase::Implement => {
                    self.advance_stage(request, TaskStage::Implemented, "implement finished")
                        .await;
                }
                Phase::Test => {
                    self.advance_stage(request, TaskStage::TestPassed, "tests passed")
                        .await;
                }
                _ => {}
            }

            index += 1;
            let last = index == phases.len();
            self.park_agent(handle, &agent, last).await;
        }

        self.mark_tasks_finished(request).await;
        Ok(())
    }

    /// Declare occupancy over the request's tasks, honoring the stated
    /// conflict resolution. `WaitForOthers` queues by polling until the
    /// holders release or cancellation arrives.
    async fn claim_tasks(&self, request: &WorkflowRequest, handle: &WorkflowHandle) -> Result<()> {
        loop {
            let occupied: Vec<TaskId> = request
                .tasks
                .iter()
                .filter(|t| {
                    self.occupancy
                        .owners_of(t)
                        .iter()
                        .any(|o| o.workflow != handle.id)
                })
                .cloned()
                .collect();

            if occupied.is_empty() {
                for task in &request.tasks {
                    self.occupancy
                        .declare(task, &handle.id, OccupancyMode::Exclusive)?;
                }
                return Ok(());
            }

            let advice = self.occupancy.declare_conflict(
                &occupied,
                &handle.id,
                request.conflict_resolution,
            );
            {
                let mut instance = handle.instance.lock().await;
                instance.conflicting_tasks = occupied.clone();
                instance.touch();
            }
            match advice {
                ConflictAdvice::Proceed => {
                    // The holders yielded; coexist on the contested tasks.
                    for task in &request.tasks {
                        let mode = if occupied.contains(task) {
                            OccupancyMode::Shared
                        } else {
                            OccupancyMode::Exclusive
                        };
                        self.occupancy.declare(task, &handle.id, mode)?;
                    }
                    return Ok(());
                }
                ConflictAdvice::Abort => {
                    return Err(Error::WorkflowCancelled(format!(
                        "{} task(s) already occupied",
                        occupied.len()
                    )));
                }
                ConflictAdvice::Wait => {
                    flog_warn!(
                        "Workflow {} waiting on {} occupied task(s)",
                        handle.id.short(),
                        occupied.len()
                    );
                    tokio::select! {
                        _ = handle.cancel.cancelled() => {
                            return Err(Error::WorkflowCancelled("cancelled while queued".into()));
                        }
                        _ = tokio::time::sleep(OCCUPANCY_POLL) => {}
                    }
                }
            }
        }
    }

    /// Observe cancellation and pause between phases.
    async fn checkpoint(&self, handle: &WorkflowHandle) -> Result<()> {
        loop {
            if handle.cancel.is_cancelled() {
                return Err(Error::WorkflowCancelled("cancel requested".into()));
            }
            let paused = handle.instance.lock().await.status == WorkflowStatus::Paused;
            if !paused {
                return Ok(());
            }
            tokio::select! {
                _ = handle.cancel.cancelled() => {
                    return Err(Error::WorkflowCancelled("cancelled while paused".into()));
                }
                _ = tokio::time::sleep(PAUSE_POLL) => {}
            }
        }
    }

    /// Get an agent for the next phase: promote the benched one if this
    /// workflow kept an agent around, otherwise acquire from the pool.
    /// The transition into `Running` happens only once the first agent is
    /// actually held.
    async fn agent_for_phase(&self, handle: &WorkflowHandle, phase: Phase) -> Result<String> {
        let benched = {
            let instance = handle.instance.lock().await;
            instance.benched_agents.first().cloned()
        };
        let role = phase.to_string();

        let agent = match benched {
            Some(name) => {
                self.pool.promote_to_busy(&name, &handle.id, &role).await?;
                let mut instance = handle.instance.lock().await;
                instance.benched_agents.retain(|a| a != &name);
                name
            }
            None => {
                tokio::select! {
                    _ = handle.cancel.cancelled() => {
                        return Err(Error::WorkflowCancelled("cancelled while acquiring agent".into()));
                    }
                    acquired = self.pool.acquire(&handle.id, &role) => acquired?,
                }
            }
        };

        let mut instance = handle.instance.lock().await;
        instance.active_agent = Some(agent.clone());
        if instance.status == WorkflowStatus::Pending {
            instance.status = WorkflowStatus::Running;
        }
        instance.touch();
        Ok(agent)
    }

    /// Bench the agent between phases, release it after the last one.
    async fn park_agent(&self, handle: &WorkflowHandle, agent: &str, last_phase: bool) {
        let result = if last_phase {
            self.pool.release(agent).await
        } else {
            self.pool.demote_to_bench(agent).await
        };
        if let Err(e) = result {
            flog_warn!("Workflow {}: could not park {}: {}", handle.id.short(), agent, e);
        }
        let mut instance = handle.instance.lock().await;
        instance.active_agent = None;
        if !last_phase && !instance.benched_agents.iter().any(|a| a == agent) {
            instance.benched_agents.push(agent.to_string());
        }
        instance.touch();
    }

    /// Run one ordinary agent-backed phase and extract its verdict.
    async fn run_agent_phase(
        &self,
        request: &WorkflowRequest,
        handle: &WorkflowHandle,
        phase: Phase,
        agent: &str,
    ) -> Result<PhaseResult> {
        let invocation = self.build_invocation(request, handle, phase, agent)?;
        let outcome = match self.runner.run(&invocation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let class = classify_error(&e.to_string());
                self.record_task_error(request, &format!("{}: {}", phase, e)).await;
                flog_error!(
                    "Workflow {} phase {} runner error ({:?}): {}",
                    handle.id.short(),
                    phase,
                    class,
                    e
                );
                return Err(Error::PhaseFailed {
                    phase: phase.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let extraction = extract_result(phase, &outcome.log_text, outcome.exit_code);
        if !extraction.files.is_empty() {
            self.record_files(request, &extraction.files).await;
        }
        if let Some(message) = &extraction.message {
            flog!(
                "Workflow {} phase {}: {} ({})",
                handle.id.short(),
                phase,
                extraction.result,
                message
            );
        }
        if matches!(
            extraction.result,
            PhaseResult::Failed | PhaseResult::ChangesRequested | PhaseResult::NeedsReview
        ) {
            let detail = extraction
                .message
                .clone()
                .unwrap_or_else(|| format!("exit code {}", outcome.exit_code));
            self.record_task_error(request, &format!("{}: {}", phase, detail)).await;
        }
        Ok(extraction.result)
    }

    /// The compile-check phase: hand off to the external build subsystem
    /// and wait for its verdict, fixing and re-checking a bounded number of
    /// times. The workflow shows `Blocked` while it waits, and the tasks
    /// mirror it through `WaitingExternal` and the compile stages.
    async fn run_compile_check(
        &self,
        request: &WorkflowRequest,
        handle: &WorkflowHandle,
        agent: &str,
    ) -> Result<PhaseResult> {
        let max_iterations = self.config.max_fix_iterations;
        let mut iteration: u32 = 0;
        loop {
            self.advance_stage(request, TaskStage::Compiling, "build submitted")
                .await;
            self.set_task_status(request, TaskStatus::WaitingExternal, "awaiting build")
                .await;
            let verdict = self.await_compile_verdict(handle).await;
            self.set_task_status(request, TaskStatus::InProgress, "build wait over")
                .await;
            let verdict = verdict?;
            if verdict.passed {
                self.advance_stage(request, TaskStage::Compiled, "build clean")
                    .await;
                if iteration > 0 {
                    flog!(
                        "Workflow {} compile clean after {} fix iteration(s)",
                        handle.id.short(),
                        iteration
                    );
                }
                return Ok(PhaseResult::Success);
            }

            iteration += 1;
            {
                let mut instance = handle.instance.lock().await;
                instance.fix_iterations = iteration;
                instance.touch();
            }
            self.advance_stage(request, TaskStage::CompileFailed, "build errors")
                .await;
            self.record_task_error(
                request,
                &format!("compile_check: {}", verdict.detail),
            )
            .await;
            if iteration > max_iterations {
                return Err(Error::PhaseFailed {
                    phase: Phase::CompileCheck.to_string(),
                    message: format!(
                        "compile still failing after {} fix iteration(s): {}",
                        max_iterations, verdict.detail
                    ),
                });
            }

            flog_warn!(
                "Workflow {} compile failed; fix iteration {}/{}",
                handle.id.short(),
                iteration,
                max_iterations
            );
            self.checkpoint(handle).await?;
            self.set_task_status(request, TaskStatus::ErrorFixing, "compile errors")
                .await;
            self.advance_stage(request, TaskStage::ErrorFixing, "compile errors")
                .await;
            let fix_prompt = format!(
                "The build failed with these errors:\n{}\nFix them.",
                verdict.detail
            );
            let fix_request = WorkflowRequest {
                prompt: format!("{}\n\n{}", request.prompt, fix_prompt),
                ..request.clone()
            };
            let result = self
                .run_agent_phase(&fix_request, handle, Phase::Fix, agent)
                .await?;
            if result != PhaseResult::Success {
                return Err(Error::PhaseFailed {
                    phase: Phase::Fix.to_string(),
                    message: format!("fix iteration {} reported {}", iteration, result),
                });
            }
            self.set_task_status(request, TaskStatus::InProgress, "fix applied")
                .await;
        }
    }

    /// Block on the compile event for this workflow.
    async fn await_compile_verdict(&self, handle: &WorkflowHandle) -> Result<CompileVerdict> {
        {
            let mut instance = handle.instance.lock().await;
            instance.status = WorkflowStatus::Blocked;
            instance.touch();
        }
        let event_type = compile_event_type(&handle.id);
        let payload = tokio::select! {
            _ = handle.cancel.cancelled() => {
                return Err(Error::WorkflowCancelled("cancelled during compile wait".into()));
            }
            payload = self.events.wait_for(&event_type, self.config.event_timeout()) => payload,
        };
        {
            let mut instance = handle.instance.lock().await;
            if instance.status == WorkflowStatus::Blocked {
                instance.status = WorkflowStatus::Running;
            }
            instance.touch();
        }

        let Some(payload) = payload else {
            return Err(Error::Timeout(self.config.event_timeout()));
        };
        let passed = payload
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let detail = payload
            .get("errors")
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no error detail".to_string());
        Ok(CompileVerdict { passed, detail })
    }

    fn build_invocation(
        &self,
        request: &WorkflowRequest,
        handle: &WorkflowHandle,
        phase: Phase,
        agent: &str,
    ) -> Result<AgentInvocation> {
        let task_list = request
            .tasks
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "You are {} working on task(s) {}.\nPhase: {}.\n\n{}",
            agent, task_list, phase, request.prompt
        );
        let log_file = self
            .config
            .agent_log_dir()?
            .join(format!("{}-{}.log", agent.to_lowercase(), handle.id.short()));
        Ok(
            AgentInvocation::new(agent, &prompt, request.cwd.clone(), log_file)
                .with_timeout(self.config.agent_timeout()),
        )
    }

    async fn mark_tasks_started(&self, request: &WorkflowRequest) {
        self.set_task_status(request, TaskStatus::InProgress, "workflow started")
            .await;
        self.advance_stage(request, TaskStage::InProgress, "workflow started")
            .await;
    }

    async fn mark_tasks_finished(&self, request: &WorkflowRequest) {
        if request.kind != WorkflowKind::ImplementTask {
            return;
        }
        self.advance_stage(request, TaskStage::Completed, "workflow succeeded")
            .await;
        self.set_task_status(request, TaskStatus::Completed, "workflow succeeded")
            .await;
    }

    /// Validated status change over all of the request's tasks. A rejected
    /// transition is logged and skipped; the workflow carries on.
    async fn set_task_status(&self, request: &WorkflowRequest, status: TaskStatus, reason: &str) {
        let mut graph = self.graph.lock().await;
        for task in &request.tasks {
            if let Err(e) = graph.transition(task, status, reason) {
                flog_warn!("Could not mark {} {}: {}", task, status, e);
            }
        }
    }

    /// Stage change over all of the request's tasks. Only `ImplementTask`
    /// workflows own their tasks' stage machine; review and error-resolution
    /// workflows leave it to the coordinator.
    async fn advance_stage(&self, request: &WorkflowRequest, stage: TaskStage, reason: &str) {
        if request.kind != WorkflowKind::ImplementTask {
            return;
        }
        let mut graph = self.graph.lock().await;
        for task in &request.tasks {
            if let Err(e) = graph.set_stage(task, stage, reason) {
                flog_warn!("Could not stage {} as {}: {}", task, stage, e);
            }
        }
    }

    async fn record_task_error(&self, request: &WorkflowRequest, message: &str) {
        let mut graph = self.graph.lock().await;
        for task in &request.tasks {
            if let Some(task) = graph.get_mut(task) {
                task.record_error(message);
            }
        }
    }

    async fn record_files(&self, request: &WorkflowRequest, files: &[String]) {
        let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
        let mut graph = self.graph.lock().await;
        for task in &request.tasks {
            if let Some(task) = graph.get_mut(task) {
                task.record_files(&paths);
            }
        }
    }

    /// Release everything the workflow holds. Safe to call more than once.
    async fn cleanup(&self, handle: &WorkflowHandle) {
        let released = self.pool.release_all(&handle.id).await;
        let freed = self.occupancy.release_workflow(&handle.id);
        let mut instance = handle.instance.lock().await;
        instance.active_agent = None;
        instance.benched_agents.clear();
        instance.touch();
        if !released.is_empty() || !freed.is_empty() {
            flog!(
                "Workflow {} cleanup: {} agent(s), {} task(s) released",
                handle.id.short(),
                released.len(),
                freed.len()
            );
        }
    }
}

struct CompileVerdict {
    passed: bool,
    detail: String,
}

/// Whether an error class is worth an automatic retry by the coordinator.
///
/// The engine itself never retries; this is advice for the layer above.
pub fn retry_worthwhile(class: ErrorClass) -> bool {
    matches!(class, ErrorClass::Transient | ErrorClass::Unknown)
}
