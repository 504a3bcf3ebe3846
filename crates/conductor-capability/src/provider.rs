use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, ProviderRecord};
use std::time::Duration;
use tracing::debug;

/// Output of a capability invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Value the provider returned.
    pub output: serde_json::Value,
    /// Response time reported by the provider itself. When absent the
    /// registry uses the wall-clock time it measured around the call.
    pub response_time: Option<Duration>,
}

impl Invocation {
    /// Wrap an output with no timing attached.
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            response_time: None,
        }
    }

    /// Attach the provider-measured response time.
    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = Some(response_time);
        self
    }
}

/// An externally registered tool exposing one or more named capabilities.
///
/// New provider kinds are added by implementing this trait and registering an
/// instance with the [`CapabilityRegistry`](crate::CapabilityRegistry).
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &str;

    /// Capability names this provider serves.
    fn capabilities(&self) -> &[String];

    /// Invoke `capability` with `params`.
    async fn invoke(
        &self,
        capability: &str,
        params: serde_json::Value,
    ) -> ConductorResult<Invocation>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> ConductorResult<()>;
}

/// Provider reached over HTTP.
///
/// - `POST {endpoint}/invoke/{capability}` with the JSON params as body
/// - `GET {endpoint}/health` for probes
pub struct HttpCapabilityProvider {
    id: String,
    endpoint: String,
    capabilities: Vec<String>,
    client: reqwest::Client,
}

impl HttpCapabilityProvider {
    /// Create a provider reached at `endpoint`, with a per-request timeout.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
        timeout: Duration,
    ) -> ConductorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConductorError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            id: id.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            capabilities,
            client,
        })
    }

    /// Rebuild a provider from its persisted registration.
    pub fn from_record(record: &ProviderRecord, timeout: Duration) -> ConductorResult<Self> {
        Self::new(
            record.id.clone(),
            record.endpoint.clone(),
            record.capabilities.clone(),
            timeout,
        )
    }

    /// Base URL requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CapabilityProvider for HttpCapabilityProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn invoke(
        &self,
        capability: &str,
        params: serde_json::Value,
    ) -> ConductorResult<Invocation> {
        let url = format!("{}/invoke/{}", self.endpoint, capability);
        debug!(provider = %self.id, url = %url, "Invoking capability");

        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(|e| ConductorError::Http(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConductorError::Http(format!(
                "{url} returned {status}: {body}"
            )));
        }

        let output: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ConductorError::Http(format!("{url}: invalid JSON body: {e}")))?;
        Ok(Invocation::new(output))
    }

    async fn health_check(&self) -> ConductorResult<()> {
        let url = format!("{}/health", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConductorError::Http(format!("{url}: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ConductorError::Http(format!(
                "{url} returned {}",
                response.status()
            )))
        }
    }
}
