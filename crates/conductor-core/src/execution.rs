use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an execution: `running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// Phases still running.
    Running,
    /// Every step succeeded.
    Completed,
    /// A step failed or the run was interrupted.
    Failed,
}

impl ExecutionState {
    /// True for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Running)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Completed => write!(f, "completed"),
            ExecutionState::Failed => write!(f, "failed"),
        }
    }
}

/// What caused an execution to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTrigger {
    /// Started on demand.
    #[default]
    Manual,
    /// Started by the workflow's trigger.
    Scheduled,
}

/// One human-readable trace line in an execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was written.
    pub timestamp: DateTime<Utc>,
    /// Log text.
    pub message: String,
}

/// One run of a workflow.
///
/// Owned by a single engine worker while running; every mutation is refused
/// once the state is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution id.
    pub id: Uuid,
    /// Workflow this run belongs to.
    pub workflow_id: String,
    /// Workflow version at start.
    pub workflow_version: u32,
    /// Current state.
    pub state: ExecutionState,
    /// What started the run.
    #[serde(default)]
    pub trigger: ExecutionTrigger,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Ordered trace of the run.
    pub log: Vec<LogEntry>,
}

impl Execution {
    /// Allocate a new running execution for `workflow` with its start line logged.
    pub fn start(workflow: &Workflow, trigger: ExecutionTrigger) -> Self {
        let mut execution = Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            state: ExecutionState::Running,
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            log: Vec::new(),
        };
        execution.log(format!(
            "Execution started for workflow '{}' v{} ({} steps)",
            workflow.name,
            workflow.version,
            workflow.step_count()
        ));
        execution
    }

    /// Append a trace line. Ignored once the execution is terminal.
    pub fn log(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    /// Transition to `completed`. Returns false if already terminal.
    pub fn complete(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.log("Execution completed");
        self.state = ExecutionState::Completed;
        self.ended_at = Some(Utc::now());
        true
    }

    /// Transition to `failed`, recording `reason`. Returns false if already terminal.
    pub fn fail(&mut self, reason: impl std::fmt::Display) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.log(format!("Execution failed: {reason}"));
        self.state = ExecutionState::Failed;
        self.ended_at = Some(Utc::now());
        true
    }

    /// True once the execution has ended.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock duration in milliseconds, once terminal.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Kind of an audit-style activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// An execution was created.
    ExecutionStarted,
    /// An execution completed.
    ExecutionCompleted,
    /// An execution failed.
    ExecutionFailed,
}

/// Audit-style record written on every execution creation and termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Activity id.
    pub id: Uuid,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: ActivityKind,
    /// Workflow concerned.
    pub workflow_id: String,
    /// Execution concerned.
    pub execution_id: Uuid,
    /// Human-readable summary.
    pub message: String,
}

impl Activity {
    /// Build the activity matching the current state of `execution`.
    pub fn for_execution(execution: &Execution) -> Self {
        let (kind, message) = match execution.state {
            ExecutionState::Running => (
                ActivityKind::ExecutionStarted,
                format!("Workflow '{}' started", execution.workflow_id),
            ),
            ExecutionState::Completed => (
                ActivityKind::ExecutionCompleted,
                format!("Workflow '{}' completed", execution.workflow_id),
            ),
            ExecutionState::Failed => (
                ActivityKind::ExecutionFailed,
                format!(
                    "Workflow '{}' failed: {}",
                    execution.workflow_id,
                    execution
                        .log
                        .last()
                        .map(|l| l.message.as_str())
                        .unwrap_or("unknown error")
                ),
            ),
        };
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            workflow_id: execution.workflow_id.clone(),
            execution_id: execution.id,
            message,
        }
    }
}
