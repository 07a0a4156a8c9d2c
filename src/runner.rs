//! Agent process execution.
//!
//! `AgentRunner` is the boundary between the orchestration core and the
//! worker processes. The engine only ever sees an invocation going in and
//! an outcome coming out, so tests substitute a mock and the host can swap
//! in a different execution backend.

use crate::error::{Error, Result};
use crate::flog_debug;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for an agent invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Instructional suffix appended to every prompt.
///
/// Tells the agent to close its run with a machine-readable summary block
/// so result extraction does not depend on free-form prose.
pub const PROMPT_SUFFIX: &str = "\n\n\
When you are completely finished, print exactly this block as the last \
thing in your output:\n\
===TASK_SUMMARY_START===\n\
RESULT: <one word: success | failed | blocked | approved | changes_requested>\n\
MESSAGE: <one line describing what happened>\n\
FILES: <comma-separated files you changed, or none>\n\
===TASK_SUMMARY_END===\n";

/// Everything the runner needs to execute one phase.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Name of the pool agent this run is attributed to.
    pub agent: String,
    /// Full prompt, already including [`PROMPT_SUFFIX`].
    pub prompt: String,
    /// Working directory for the process.
    pub cwd: PathBuf,
    /// Where the agent's output log is written.
    pub log_file: PathBuf,
    pub timeout: Duration,
}

impl AgentInvocation {
    pub fn new(agent: &str, prompt: &str, cwd: PathBuf, log_file: PathBuf) -> Self {
        Self {
            agent: agent.to_string(),
            prompt: format!("{}{}", prompt, PROMPT_SUFFIX),
            cwd,
            log_file,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What came back from one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Full captured output (stdout plus log-file contents).
    pub log_text: String,
    /// Process exit code; -1 when the process was killed.
    pub exit_code: i32,
}

impl AgentOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Execution backend for agent phases.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one invocation to completion or timeout.
    ///
    /// A timeout surfaces as `Error::Timeout`; an abnormal exit is NOT an
    /// error here, it comes back as a non-zero `exit_code` for the
    /// extraction tiers to interpret.
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutcome>;
}

/// Runner that shells out to the configured agent binary.
#[derive(Debug, Clone)]
pub struct ProcessAgentRunner {
    binary: PathBuf,
}

impl ProcessAgentRunner {
    /// Detect the agent binary on PATH.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|_| Error::AgentBinaryNotFound(command.to_string()))?;
        Ok(Self { binary })
    }

    /// Use a specific binary path, skipping detection.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, invocation: &AgentInvocation) -> Result<AgentOutcome> {
        flog_debug!(
            "Runner: starting {} in {} (timeout {:?})",
            invocation.agent,
            invocation.cwd.display(),
            invocation.timeout
        );

        let output = tokio::time::timeout(
            invocation.timeout,
            Command::new(&self.binary)
                .arg("-p")
                .arg(&invocation.prompt)
                .current_dir(&invocation.cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(invocation.timeout))?
        .map_err(Error::Io)?;

        let mut log_text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            log_text.push('\n');
            log_text.push_str(stderr.trim());
        }

        // Agents stream detail to their log file; fold it in after exit so
        // extraction sees everything the process produced.
        if let Ok(file_text) = tokio::fs::read_to_string(&invocation.log_file).await {
            log_text.push('\n');
            log_text.push_str(&file_text);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        flog_debug!(
            "Runner: {} exited with code {} ({} bytes of output)",
            invocation.agent,
            exit_code,
            log_text.len()
        );
        Ok(AgentOutcome { log_text, exit_code })
    }
}
