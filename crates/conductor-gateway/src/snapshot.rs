use async_trait::async_trait;
use conductor_core::{Activity, Channel, ConductorResult, Execution};
use conductor_orchestrator::Orchestrator;

/// Most recent activities included in an `activities` snapshot.
pub const RECENT_ACTIVITY_LIMIT: usize = 50;
/// Most recent executions included in a `workflows` snapshot.
pub const RECENT_EXECUTION_LIMIT: usize = 20;

/// What the gateway needs from the orchestration core.
#[async_trait]
pub trait GatewayBackend: Send + Sync {
    /// Current state of everything a channel reports on.
    async fn snapshot(&self, channel: Channel) -> ConductorResult<serde_json::Value>;

    /// Start a workflow run; returns once the execution exists.
    async fn execute_workflow(&self, workflow_id: &str) -> ConductorResult<Execution>;
}

#[async_trait]
impl GatewayBackend for Orchestrator {
    async fn snapshot(&self, channel: Channel) -> ConductorResult<serde_json::Value> {
        let payload = match channel {
            Channel::Metrics => serde_json::to_value(self.agents().metrics())?,
            Channel::Agents => serde_json::to_value(self.agents().list())?,
            Channel::McpServers => serde_json::to_value(self.capabilities().status().await)?,
            Channel::Activities => {
                let mut activities = self.repository().load_all::<Activity>().await?;
                activities.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                activities.truncate(RECENT_ACTIVITY_LIMIT);
                serde_json::to_value(activities)?
            }
            Channel::Workflows => {
                let mut executions = self.list_executions(None).await?;
                executions.truncate(RECENT_EXECUTION_LIMIT);
                serde_json::json!({
                    "workflows": self.list_workflows().await?,
                    "executions": executions,
                })
            }
        };
        Ok(payload)
    }

    async fn execute_workflow(&self, workflow_id: &str) -> ConductorResult<Execution> {
        self.run_now(workflow_id).await
    }
}
