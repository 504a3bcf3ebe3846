use crate::provider::CapabilityProvider;
use chrono::{DateTime, Utc};
use conductor_core::{
    ConductorError, ConductorResult, Event, EventBus, ProviderSnapshot, ProviderStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Internal state for a registered provider.
struct ManagedProvider {
    provider: Arc<dyn CapabilityProvider>,
    status: ProviderStatus,
    last_response_ms: Option<f64>,
    invocation_count: u64,
    last_health_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ManagedProvider {
    fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            id: self.provider.id().to_string(),
            capabilities: self.provider.capabilities().to_vec(),
            status: self.status,
            last_response_ms: self.last_response_ms,
            invocation_count: self.invocation_count,
            last_health_check: self.last_health_check,
            last_error: self.last_error.clone(),
        }
    }

    fn record(&mut self, elapsed: Duration, outcome: Result<(), String>) {
        self.last_response_ms = Some(elapsed.as_secs_f64() * 1000.0);
        match outcome {
            Ok(()) => {
                self.status = ProviderStatus::Healthy;
                self.last_error = None;
            }
            Err(e) => {
                self.status = ProviderStatus::Error;
                self.last_error = Some(e);
            }
        }
    }
}

/// Registry of external capability providers with health tracking.
///
/// Lookups clone the provider handle and release the lock before calling
/// out, so a deregistration never interrupts an invocation already in flight.
pub struct CapabilityRegistry {
    providers: RwLock<HashMap<String, ManagedProvider>>,
    events: EventBus,
}

impl CapabilityRegistry {
    /// Create an empty registry publishing on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register a provider, replacing any previous one with the same id.
    pub async fn register(&self, provider: Arc<dyn CapabilityProvider>) {
        let id = provider.id().to_string();
        let entry = ManagedProvider {
            provider,
            status: ProviderStatus::Unknown,
            last_response_ms: None,
            invocation_count: 0,
            last_health_check: None,
            last_error: None,
        };
        let snapshot = entry.snapshot();
        let replaced = self
            .providers
            .write()
            .await
            .insert(id.clone(), entry)
            .is_some();
        info!(
            provider = %id,
            capabilities = ?snapshot.capabilities,
            replaced,
            "Capability provider registered"
        );
        self.events.publish(Event::ProviderUpdated(snapshot));
    }

    /// Remove a provider. Returns false if it was not registered.
    pub async fn deregister(&self, id: &str) -> bool {
        let removed = self.providers.write().await.remove(id).is_some();
        if removed {
            info!(provider = %id, "Capability provider deregistered");
            self.events
                .publish(Event::ProviderRemoved { id: id.to_string() });
        }
        removed
    }

    /// Invoke `capability` on the given provider and record the response time.
    pub async fn invoke(
        &self,
        provider_id: &str,
        capability: &str,
        params: serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        let provider = {
            let providers = self.providers.read().await;
            let entry = providers.get(provider_id).ok_or_else(|| {
                ConductorError::ProviderUnavailable(format!(
                    "provider '{provider_id}' is not registered"
                ))
            })?;
            if !entry.provider.capabilities().iter().any(|c| c == capability) {
                return Err(ConductorError::ProviderUnavailable(format!(
                    "provider '{provider_id}' does not offer '{capability}'"
                )));
            }
            entry.provider.clone()
        };

        let start = Instant::now();
        let result = provider.invoke(capability, params).await;
        let measured = start.elapsed();

        let (outcome, elapsed, output) = match result {
            Ok(invocation) => (
                Ok(()),
                invocation.response_time.unwrap_or(measured),
                Ok(invocation.output),
            ),
            Err(e) => {
                warn!(provider = %provider_id, capability, error = %e, "Capability invocation failed");
                let reason = e.to_string();
                (
                    Err(reason.clone()),
                    measured,
                    Err(ConductorError::ProviderUnavailable(format!(
                        "{provider_id}: {reason}"
                    ))),
                )
            }
        };

        let snapshot = {
            let mut providers = self.providers.write().await;
            // Deregistered while in flight: the call still completes, stats are dropped.
            providers.get_mut(provider_id).map(|entry| {
                entry.invocation_count += 1;
                entry.record(elapsed, outcome);
                entry.snapshot()
            })
        };
        if let Some(snapshot) = snapshot {
            self.events.publish(Event::ProviderUpdated(snapshot));
        }

        output
    }

    /// Probe a single provider and update its status.
    pub async fn probe(&self, provider_id: &str) -> ConductorResult<ProviderStatus> {
        let provider = {
            let providers = self.providers.read().await;
            providers
                .get(provider_id)
                .map(|e| e.provider.clone())
                .ok_or_else(|| {
                    ConductorError::ProviderUnavailable(format!(
                        "provider '{provider_id}' is not registered"
                    ))
                })?
        };

        let start = Instant::now();
        let outcome = provider.health_check().await.map_err(|e| {
            warn!(provider = %provider_id, error = %e, "Provider health check failed");
            e.to_string()
        });
        let elapsed = start.elapsed();

        let snapshot = {
            let mut providers = self.providers.write().await;
            providers.get_mut(provider_id).map(|entry| {
                entry.last_health_check = Some(Utc::now());
                entry.record(elapsed, outcome);
                entry.snapshot()
            })
        };

        match snapshot {
            Some(snapshot) => {
                let status = snapshot.status;
                self.events.publish(Event::ProviderUpdated(snapshot));
                Ok(status)
            }
            None => Err(ConductorError::ProviderUnavailable(format!(
                "provider '{provider_id}' was deregistered during probe"
            ))),
        }
    }

    /// Probe every registered provider.
    pub async fn health_check(&self) {
        let ids: Vec<String> = self.providers.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.probe(&id).await {
                warn!(provider = %id, error = %e, "Skipping provider probe");
            }
        }
    }

    /// Start a background health check loop.
    pub fn start_health_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                self.health_check().await;
            }
        })
    }

    /// Snapshots of every provider advertising `capability`.
    pub async fn candidates(&self, capability: &str) -> Vec<ProviderSnapshot> {
        let providers = self.providers.read().await;
        let mut candidates: Vec<ProviderSnapshot> = providers
            .values()
            .filter(|e| e.provider.capabilities().iter().any(|c| c == capability))
            .map(ManagedProvider::snapshot)
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Health snapshot of one provider.
    pub async fn get(&self, provider_id: &str) -> Option<ProviderSnapshot> {
        self.providers
            .read()
            .await
            .get(provider_id)
            .map(ManagedProvider::snapshot)
    }

    /// Status of all registered providers, ordered by id.
    pub async fn status(&self) -> Vec<ProviderSnapshot> {
        let providers = self.providers.read().await;
        let mut all: Vec<ProviderSnapshot> =
            providers.values().map(ManagedProvider::snapshot).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of registered providers.
    pub async fn provider_count(&self) -> usize {
        self.providers.read().await.len()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}
