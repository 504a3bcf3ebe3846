use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the orchestration core.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// No workflow is stored under the requested id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A workflow trigger expression could not be parsed.
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidScheduleExpression { expression: String, reason: String },

    /// The agent is already running (or deploying) and rejected the request.
    #[error("Agent busy: {0}")]
    AgentBusy(String),

    /// An agent dispatch or deployment ended in failure.
    #[error("Agent '{agent_id}' execution failed: {reason}")]
    AgentExecutionFailed { agent_id: String, reason: String },

    /// No agent or provider advertises the required capability.
    #[error("No capable agent for capability '{0}'")]
    NoCapableAgent(String),

    /// A workflow step failed; wraps the underlying error.
    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<ConductorError>,
    },

    /// The capability provider is not registered or its invocation failed.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// No agent is registered under the requested id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The workflow cannot be removed while an execution references it.
    #[error("Workflow '{0}' is referenced by a live execution")]
    WorkflowInUse(String),

    /// Record store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Notification gateway failure.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// HTTP transport or status failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Wrap an error as the failure of the named step.
    pub fn step_failed(step: impl Into<String>, source: ConductorError) -> Self {
        ConductorError::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Returns true for [`ConductorError::AgentBusy`].
    pub fn is_busy(&self) -> bool {
        matches!(self, ConductorError::AgentBusy(_))
    }
}
