use async_trait::async_trait;
use conductor_core::{Agent, ConductorError, ConductorResult};
use std::time::Duration;
use tracing::debug;

/// The opaque work behind an agent.
///
/// The manager owns state and statistics; a handler only performs the work.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Run the agent's work on `input`.
    async fn execute(
        &self,
        agent: &Agent,
        input: serde_json::Value,
    ) -> ConductorResult<serde_json::Value>;

    /// Deployment side effect. Agents without one deploy instantly.
    async fn deploy(&self, _agent: &Agent) -> ConductorResult<()> {
        Ok(())
    }
}

/// Agent reached over HTTP.
///
/// - `POST {endpoint}/execute` with `{"agent_id", "input"}`
/// - `POST {endpoint}/deploy` with `{"agent_id"}`
pub struct HttpAgentHandler {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAgentHandler {
    /// `timeout` bounds each HTTP call; `None` leaves it unbounded.
    pub fn new(endpoint: impl Into<String>, timeout: Option<Duration>) -> ConductorResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ConductorError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(
        &self,
        route: &str,
        body: serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        let url = format!("{}/{}", self.endpoint, route);
        debug!(url = %url, "Calling agent endpoint");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConductorError::Http(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConductorError::Http(format!("{url} returned {status}: {text}")));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| ConductorError::Http(format!("{url}: invalid JSON body: {e}")))
    }
}

#[async_trait]
impl AgentHandler for HttpAgentHandler {
    async fn execute(
        &self,
        agent: &Agent,
        input: serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        self.post(
            "execute",
            serde_json::json!({ "agent_id": agent.id, "input": input }),
        )
        .await
    }

    async fn deploy(&self, agent: &Agent) -> ConductorResult<()> {
        self.post("deploy", serde_json::json!({ "agent_id": agent.id }))
            .await
            .map(|_| ())
    }
}
