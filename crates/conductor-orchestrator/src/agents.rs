use crate::handler::AgentHandler;
use conductor_capability::CapabilityRegistry;
use conductor_core::{
    Agent, AgentStatus, ConductorError, ConductorResult, Event, EventBus, MetricsSnapshot,
    ProviderStatus, Repository, StepTarget,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Outcome of capability resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Dispatch to the registered agent with this id.
    Agent(String),
    /// Invoke the capability on this provider.
    Provider(String),
}

struct ManagedAgent {
    agent: Agent,
    handler: Arc<dyn AgentHandler>,
}

/// Owns the authoritative state and statistics of every agent and mediates
/// each dispatch to it.
///
/// One dispatch may be in flight per agent. A second request is rejected
/// with [`ConductorError::AgentBusy`] rather than queued.
pub struct AgentExecutionManager {
    agents: Mutex<HashMap<String, ManagedAgent>>,
    capabilities: Arc<CapabilityRegistry>,
    events: EventBus,
    repository: Option<Repository>,
    dispatch_timeout: Option<Duration>,
}

impl AgentExecutionManager {
    /// Create a manager resolving capabilities against `capabilities`.
    pub fn new(capabilities: Arc<CapabilityRegistry>, events: EventBus) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            capabilities,
            events,
            repository: None,
            dispatch_timeout: None,
        }
    }

    /// Persist agent snapshots after every state change.
    pub fn with_repository(mut self, repository: Repository) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Deadline for a single dispatch or deployment. Expiry counts as a failure.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    /// The registry capability steps fall back to.
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Register (or replace) an agent. Replacing a busy agent is rejected.
    ///
    /// The agent starts `idle`. Statistics carry over from the live entry or,
    /// after a restart, from the persisted record.
    pub async fn register(
        &self,
        mut agent: Agent,
        handler: Arc<dyn AgentHandler>,
    ) -> ConductorResult<()> {
        let stored = self.stored(&agent.id).await;
        let snapshot = {
            let mut agents = self.agents.lock();
            let live = agents.get(&agent.id).map(|existing| existing.agent.clone());
            if live.as_ref().is_some_and(|a| a.status.is_busy()) {
                return Err(ConductorError::AgentBusy(agent.id.clone()));
            }
            if let Some(previous) = live.or(stored) {
                carry_statistics(&mut agent, &previous);
            }
            agent.status = AgentStatus::Idle;
            let snapshot = agent.clone();
            agents.insert(agent.id.clone(), ManagedAgent { agent, handler });
            snapshot
        };
        info!(agent_id = %snapshot.id, capabilities = ?snapshot.capabilities, "Agent registered");
        self.publish(snapshot).await;
        Ok(())
    }

    /// Remove an agent. Busy agents cannot be removed.
    pub async fn remove(&self, agent_id: &str) -> ConductorResult<bool> {
        {
            let mut agents = self.agents.lock();
            match agents.get(agent_id) {
                Some(entry) if entry.agent.status.is_busy() => {
                    return Err(ConductorError::AgentBusy(agent_id.to_string()));
                }
                Some(_) => {
                    agents.remove(agent_id);
                }
                None => return Ok(false),
            }
        }
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.remove::<Agent>(agent_id).await {
                warn!(agent_id, error = %e, "Failed to remove agent record");
            }
        }
        self.events.publish(Event::MetricsUpdated(self.metrics()));
        Ok(true)
    }

    /// Snapshot of one agent.
    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.lock().get(agent_id).map(|e| e.agent.clone())
    }

    /// All agents, ordered by id.
    pub fn list(&self) -> Vec<Agent> {
        let mut all: Vec<Agent> = self.agents.lock().values().map(|e| e.agent.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Aggregate statistics over every registered agent.
    pub fn metrics(&self) -> MetricsSnapshot {
        let agents = self.agents.lock();
        MetricsSnapshot::from_agents(agents.values().map(|e| &e.agent))
    }

    /// Move a non-running agent through `deploying` and back to `idle`.
    pub async fn deploy(&self, agent_id: &str) -> ConductorResult<()> {
        let (agent, handler) = self.claim(agent_id, AgentStatus::Deploying)?;
        self.publish(agent.clone()).await;
        info!(agent_id, "Deploying agent");

        let result = self.with_deadline(agent_id, handler.deploy(&agent)).await;

        let snapshot = self.release(agent_id, |a| {
            a.status = if result.is_ok() {
                AgentStatus::Idle
            } else {
                AgentStatus::Error
            };
        });
        if let Some(snapshot) = snapshot {
            self.publish(snapshot).await;
        }

        result.map_err(|e| failure(agent_id, e))
    }

    /// Run the agent's work on `input` and update its statistics.
    ///
    /// Blocks the caller until the agent completes, fails or times out.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        input: serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        let (agent, handler) = self.claim(agent_id, AgentStatus::Running)?;
        self.publish(agent.clone()).await;

        let start = Instant::now();
        let result = self
            .with_deadline(agent_id, handler.execute(&agent, input))
            .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let snapshot = self.release(agent_id, |a| {
            a.record_sample(latency_ms, result.is_ok());
            a.status = if result.is_ok() {
                AgentStatus::Idle
            } else {
                AgentStatus::Error
            };
        });
        if let Some(snapshot) = snapshot {
            self.publish(snapshot).await;
        }

        match result {
            Ok(output) => {
                info!(agent_id, latency_ms, "Agent dispatch completed");
                Ok(output)
            }
            Err(e) => {
                warn!(agent_id, latency_ms, error = %e, "Agent dispatch failed");
                Err(failure(agent_id, e))
            }
        }
    }

    /// Pick the agent or provider that should serve `capability`.
    ///
    /// Candidates in `error` are only used when nothing healthy remains. Ties
    /// go to the least-used candidate, agents before providers, then by id.
    pub async fn resolve(&self, capability: &str) -> ConductorResult<Resolution> {
        // (errored, load, kind rank, id)
        let mut candidates: Vec<(bool, u64, u8, Resolution)> = Vec::new();
        let mut busy_agents = 0usize;
        {
            let agents = self.agents.lock();
            for entry in agents.values() {
                let agent = &entry.agent;
                if !agent.has_capability(capability) {
                    continue;
                }
                if agent.status.is_busy() {
                    busy_agents += 1;
                    continue;
                }
                candidates.push((
                    agent.status == AgentStatus::Error,
                    agent.execution_count,
                    0,
                    Resolution::Agent(agent.id.clone()),
                ));
            }
        }
        for provider in self.capabilities.candidates(capability).await {
            candidates.push((
                provider.status == ProviderStatus::Error,
                provider.invocation_count,
                1,
                Resolution::Provider(provider.id),
            ));
        }

        if candidates.is_empty() {
            return Err(if busy_agents > 0 {
                ConductorError::AgentBusy(format!(
                    "all {busy_agents} agent(s) with capability '{capability}' are busy"
                ))
            } else {
                ConductorError::NoCapableAgent(capability.to_string())
            });
        }

        let any_healthy = candidates.iter().any(|c| !c.0);
        candidates
            .into_iter()
            .filter(|c| !any_healthy || !c.0)
            .min_by(|a, b| {
                (a.1, a.2)
                    .cmp(&(b.1, b.2))
                    .then_with(|| resolution_id(&a.3).cmp(resolution_id(&b.3)))
            })
            .map(|c| c.3)
            .ok_or_else(|| ConductorError::NoCapableAgent(capability.to_string()))
    }

    /// Execute one workflow step target.
    pub async fn run_step(
        &self,
        target: &StepTarget,
        input: serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        match target {
            StepTarget::Agent { agent_id } => self.dispatch(agent_id, input).await,
            StepTarget::Capability { capability } => match self.resolve(capability).await? {
                Resolution::Agent(agent_id) => self.dispatch(&agent_id, input).await,
                Resolution::Provider(provider_id) => {
                    self.capabilities
                        .invoke(&provider_id, capability, input)
                        .await
                }
            },
        }
    }

    /// Atomically check the agent is free and move it into `status`.
    fn claim(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> ConductorResult<(Agent, Arc<dyn AgentHandler>)> {
        let mut agents = self.agents.lock();
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))?;
        if entry.agent.status.is_busy() {
            return Err(ConductorError::AgentBusy(agent_id.to_string()));
        }
        entry.agent.status = status;
        Ok((entry.agent.clone(), entry.handler.clone()))
    }

    /// Apply the completion update. `None` if the agent was removed meanwhile.
    fn release(&self, agent_id: &str, update: impl FnOnce(&mut Agent)) -> Option<Agent> {
        let mut agents = self.agents.lock();
        agents.get_mut(agent_id).map(|entry| {
            update(&mut entry.agent);
            entry.agent.clone()
        })
    }

    async fn with_deadline<T>(
        &self,
        agent_id: &str,
        work: impl std::future::Future<Output = ConductorResult<T>>,
    ) -> ConductorResult<T> {
        match self.dispatch_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(ConductorError::AgentExecutionFailed {
                    agent_id: agent_id.to_string(),
                    reason: format!("timed out after {}ms", deadline.as_millis()),
                }),
            },
            None => work.await,
        }
    }

    async fn stored(&self, agent_id: &str) -> Option<Agent> {
        let repository = self.repository.as_ref()?;
        match repository.load::<Agent>(agent_id).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to load agent record");
                None
            }
        }
    }

    async fn publish(&self, agent: Agent) {
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.save(&agent).await {
                warn!(agent_id = %agent.id, error = %e, "Failed to persist agent");
            }
        }
        self.events.publish(Event::AgentUpdated(agent));
        self.events.publish(Event::MetricsUpdated(self.metrics()));
    }
}

fn resolution_id(resolution: &Resolution) -> &str {
    match resolution {
        Resolution::Agent(id) | Resolution::Provider(id) => id,
    }
}

fn carry_statistics(agent: &mut Agent, previous: &Agent) {
    agent.execution_count = previous.execution_count;
    agent.error_count = previous.error_count;
    agent.avg_latency_ms = previous.avg_latency_ms;
    agent.last_execution_at = previous.last_execution_at;
}

fn failure(agent_id: &str, error: ConductorError) -> ConductorError {
    match error {
        e @ ConductorError::AgentExecutionFailed { .. } => e,
        other => ConductorError::AgentExecutionFailed {
            agent_id: agent_id.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_capability::{CapabilityProvider, Invocation};
    use tokio::sync::Notify;

    /// Echoes its input; fails when the input contains `"fail": true`.
    struct EchoHandler;

    #[async_trait]
    impl AgentHandler for EchoHandler {
        async fn execute(
            &self,
            agent: &Agent,
            input: serde_json::Value,
        ) -> ConductorResult<serde_json::Value> {
            if input["fail"].as_bool() == Some(true) {
                return Err(ConductorError::Http("upstream 500".into()));
            }
            if let Some(ms) = input["sleep_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(serde_json::json!({ "agent": agent.id, "input": input }))
        }
    }

    /// Blocks until released, to hold an agent in `running`.
    struct GateHandler {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl AgentHandler for GateHandler {
        async fn execute(
            &self,
            _agent: &Agent,
            _input: serde_json::Value,
        ) -> ConductorResult<serde_json::Value> {
            self.gate.notified().await;
            Ok(serde_json::Value::Null)
        }

        async fn deploy(&self, _agent: &Agent) -> ConductorResult<()> {
            self.gate.notified().await;
            Ok(())
        }
    }

    struct StaticProvider {
        id: String,
        capabilities: Vec<String>,
    }

    #[async_trait]
    impl CapabilityProvider for StaticProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> &[String] {
            &self.capabilities
        }

        async fn invoke(
            &self,
            _capability: &str,
            _params: serde_json::Value,
        ) -> ConductorResult<Invocation> {
            Ok(Invocation::new(serde_json::json!({ "provider": self.id })))
        }

        async fn health_check(&self) -> ConductorResult<()> {
            Err(ConductorError::Http("down".into()))
        }
    }

    fn manager() -> AgentExecutionManager {
        AgentExecutionManager::new(Arc::new(CapabilityRegistry::default()), EventBus::default())
    }

    #[tokio::test]
    async fn test_dispatch_updates_statistics() {
        let mgr = manager();
        mgr.register(Agent::new("a1", "Echo"), Arc::new(EchoHandler))
            .await
            .unwrap();

        let out = mgr.dispatch("a1", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out["agent"], "a1");

        let agent = mgr.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.execution_count, 1);
        assert_eq!(agent.error_count, 0);
        assert!(agent.last_execution_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_failure_sets_error_state() {
        let mgr = manager();
        mgr.register(Agent::new("a1", "Echo"), Arc::new(EchoHandler))
            .await
            .unwrap();

        let err = mgr
            .dispatch("a1", serde_json::json!({"fail": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::AgentExecutionFailed { ref agent_id, .. } if agent_id == "a1"));

        let agent = mgr.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        assert_eq!(agent.execution_count, 1);
        assert_eq!(agent.error_count, 1);

        // An errored agent can be dispatched again.
        mgr.dispatch("a1", serde_json::Value::Null).await.unwrap();
        assert_eq!(mgr.get("a1").unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_busy_agent_rejects_without_touching_stats() {
        let mgr = Arc::new(manager());
        let gate = Arc::new(Notify::new());
        mgr.register(
            Agent::new("a1", "Gate"),
            Arc::new(GateHandler { gate: gate.clone() }),
        )
        .await
        .unwrap();

        let m = mgr.clone();
        let inflight = tokio::spawn(async move { m.dispatch("a1", serde_json::Value::Null).await });
        while mgr.get("a1").unwrap().status != AgentStatus::Running {
            tokio::task::yield_now().await;
        }

        let before = mgr.get("a1").unwrap();
        let err = mgr.dispatch("a1", serde_json::Value::Null).await.unwrap_err();
        assert!(err.is_busy());
        assert!(matches!(mgr.deploy("a1").await, Err(ConductorError::AgentBusy(_))));
        let after = mgr.get("a1").unwrap();
        assert_eq!(before, after);

        gate.notify_one();
        inflight.await.unwrap().unwrap();
        assert_eq!(mgr.get("a1").unwrap().execution_count, 1);
    }

    #[tokio::test]
    async fn test_deploy_cycles_through_deploying() {
        let mgr = Arc::new(manager());
        let gate = Arc::new(Notify::new());
        mgr.register(
            Agent::new("a1", "Gate"),
            Arc::new(GateHandler { gate: gate.clone() }),
        )
        .await
        .unwrap();

        let m = mgr.clone();
        let deploying = tokio::spawn(async move { m.deploy("a1").await });
        while mgr.get("a1").unwrap().status != AgentStatus::Deploying {
            tokio::task::yield_now().await;
        }
        assert!(mgr.dispatch("a1", serde_json::Value::Null).await.unwrap_err().is_busy());

        gate.notify_one();
        deploying.await.unwrap().unwrap();
        let agent = mgr.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.execution_count, 0);
    }

    #[tokio::test]
    async fn test_dispatch_timeout_is_failure() {
        let mgr = manager().with_dispatch_timeout(Duration::from_millis(50));
        mgr.register(Agent::new("a1", "Slow"), Arc::new(EchoHandler))
            .await
            .unwrap();

        let err = mgr
            .dispatch("a1", serde_json::json!({"sleep_ms": 2000}))
            .await
            .unwrap_err();
        match err {
            ConductorError::AgentExecutionFailed { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mgr.get("a1").unwrap().status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_agent() {
        let mgr = manager();
        assert!(matches!(
            mgr.dispatch("ghost", serde_json::Value::Null).await,
            Err(ConductorError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reregister_keeps_statistics() {
        let mgr = manager();
        mgr.register(Agent::new("a1", "A1"), Arc::new(EchoHandler))
            .await
            .unwrap();
        mgr.dispatch("a1", serde_json::Value::Null).await.unwrap();
        mgr.dispatch("a1", serde_json::Value::Null).await.unwrap();

        mgr.register(Agent::new("a1", "Renamed"), Arc::new(EchoHandler))
            .await
            .unwrap();
        let agent = mgr.get("a1").unwrap();
        assert_eq!(agent.name, "Renamed");
        assert_eq!(agent.execution_count, 2);
        assert!(agent.last_execution_at.is_some());
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_resolve_prefers_least_used() {
        let mgr = manager();
        for id in ["a1", "a2"] {
            mgr.register(
                Agent::new(id, id).with_capabilities(["summarize"]),
                Arc::new(EchoHandler),
            )
            .await
            .unwrap();
        }
        mgr.dispatch("a1", serde_json::Value::Null).await.unwrap();

        assert_eq!(
            mgr.resolve("summarize").await.unwrap(),
            Resolution::Agent("a2".into())
        );
        assert!(matches!(
            mgr.resolve("translate").await,
            Err(ConductorError::NoCapableAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_skips_errored_provider_when_alternative_exists() {
        let registry = Arc::new(CapabilityRegistry::default());
        registry
            .register(Arc::new(StaticProvider {
                id: "p1".into(),
                capabilities: vec!["search".into()],
            }))
            .await;
        // Health probe fails, marking p1 as errored.
        registry.probe("p1").await.unwrap();

        let mgr = AgentExecutionManager::new(registry.clone(), EventBus::default());
        // Only candidate is errored: it is still used.
        assert_eq!(
            mgr.resolve("search").await.unwrap(),
            Resolution::Provider("p1".into())
        );

        registry
            .register(Arc::new(StaticProvider {
                id: "p2".into(),
                capabilities: vec!["search".into()],
            }))
            .await;
        assert_eq!(
            mgr.resolve("search").await.unwrap(),
            Resolution::Provider("p2".into())
        );

        let out = mgr
            .run_step(
                &StepTarget::Capability {
                    capability: "search".into(),
                },
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(out["provider"], "p2");
    }

    #[tokio::test]
    async fn test_events_published_on_dispatch() {
        let events = EventBus::new(32);
        let mut rx = events.subscribe();
        let mgr = AgentExecutionManager::new(Arc::new(CapabilityRegistry::default()), events);
        mgr.register(Agent::new("a1", "Echo"), Arc::new(EchoHandler))
            .await
            .unwrap();
        mgr.dispatch("a1", serde_json::Value::Null).await.unwrap();

        let mut statuses = Vec::new();
        let mut metrics = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::AgentUpdated(a) => statuses.push(a.status),
                Event::MetricsUpdated(_) => metrics += 1,
                _ => {}
            }
        }
        assert_eq!(
            statuses,
            vec![AgentStatus::Idle, AgentStatus::Running, AgentStatus::Idle]
        );
        assert_eq!(metrics, 3);
    }
}
