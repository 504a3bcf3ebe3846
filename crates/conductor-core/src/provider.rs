use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of an external capability provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// Registered but not yet probed or invoked.
    #[default]
    Unknown,
    /// Last invocation or probe succeeded.
    Healthy,
    /// Last invocation or probe failed.
    Error,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProviderStatus::Unknown => "unknown",
            ProviderStatus::Healthy => "healthy",
            ProviderStatus::Error => "error",
        })
    }
}

/// Point-in-time view of a registered provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    /// Provider id.
    pub id: String,
    /// Capabilities it serves.
    pub capabilities: Vec<String>,
    /// Current health.
    pub status: ProviderStatus,
    /// Last measured response time in milliseconds.
    pub last_response_ms: Option<f64>,
    /// Invocations routed to it.
    pub invocation_count: u64,
    /// When it was last probed.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

/// Persisted registration of an HTTP capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Provider id.
    pub id: String,
    /// Base URL of the HTTP provider.
    pub endpoint: String,
    /// Capabilities it serves.
    pub capabilities: Vec<String>,
    /// When it was registered.
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl ProviderRecord {
    /// Registration stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capabilities,
            registered_at: Utc::now(),
        }
    }
}
