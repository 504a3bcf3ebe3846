use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current state of an agent as tracked by its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Ready for a dispatch.
    #[default]
    Idle,
    /// Executing a dispatch.
    Running,
    /// Last dispatch or deployment failed.
    Error,
    /// Running its deployment hook.
    Deploying,
}

impl AgentStatus {
    /// Running and deploying agents reject new work.
    pub fn is_busy(self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Deploying)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Deploying => write!(f, "deploying"),
        }
    }
}

/// A capability-bearing execution unit and its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Capabilities this agent can serve.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Current lifecycle state.
    #[serde(default)]
    pub status: AgentStatus,
    /// Completed dispatches, successful or not.
    #[serde(default)]
    pub execution_count: u64,
    /// Failed dispatches.
    #[serde(default)]
    pub error_count: u64,
    /// Running mean of dispatch latency in milliseconds.
    #[serde(default)]
    pub avg_latency_ms: f64,
    /// When the last dispatch finished.
    #[serde(default)]
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Create an idle agent with no capabilities.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: BTreeSet::new(),
            status: AgentStatus::Idle,
            execution_count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
            last_execution_at: None,
        }
    }

    /// Add capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// True if the agent advertises `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Fold one latency sample into the running mean.
    ///
    /// `avg' = avg + (sample - avg) / count`, no history kept.
    pub fn record_sample(&mut self, latency_ms: f64, success: bool) {
        self.execution_count += 1;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.execution_count as f64;
        if !success {
            self.error_count += 1;
        }
        self.last_execution_at = Some(Utc::now());
    }
}

/// Aggregate agent statistics pushed on the `metrics` channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Registered agents.
    pub total_agents: usize,
    /// Agents currently running a dispatch.
    pub running_agents: usize,
    /// Agents in `error`.
    pub errored_agents: usize,
    /// Dispatches across all agents.
    pub total_executions: u64,
    /// Failed dispatches across all agents.
    pub total_errors: u64,
    /// Execution-weighted mean latency across all agents.
    pub avg_latency_ms: f64,
}

impl MetricsSnapshot {
    /// Aggregate over a set of agents.
    pub fn from_agents<'a>(agents: impl IntoIterator<Item = &'a Agent>) -> Self {
        let mut snapshot = MetricsSnapshot::default();
        let mut weighted = 0.0;
        for agent in agents {
            snapshot.total_agents += 1;
            match agent.status {
                AgentStatus::Running => snapshot.running_agents += 1,
                AgentStatus::Error => snapshot.errored_agents += 1,
                _ => {}
            }
            snapshot.total_executions += agent.execution_count;
            snapshot.total_errors += agent.error_count;
            weighted += agent.avg_latency_ms * agent.execution_count as f64;
        }
        if snapshot.total_executions > 0 {
            snapshot.avg_latency_ms = weighted / snapshot.total_executions as f64;
        }
        snapshot
    }
}
