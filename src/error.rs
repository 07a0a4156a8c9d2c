use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Dependency cycle involving task: {0}")]
    DependencyCycle(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent {agent} is busy under workflow {owner}")]
    AgentBusy { agent: String, owner: String },

    #[error("Agent pool closed")]
    PoolClosed,

    #[error("Agent binary not found: {0}")]
    AgentBinaryNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Workflow cancelled: {0}")]
    WorkflowCancelled(String),

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
