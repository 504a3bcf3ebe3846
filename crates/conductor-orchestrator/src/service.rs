use crate::agents::AgentExecutionManager;
use crate::engine::ExecutionEngine;
use crate::handler::AgentHandler;
use crate::scheduler::{Scheduler, SchedulerConfig};
use chrono::Utc;
use conductor_capability::{CapabilityRegistry, HttpCapabilityProvider};
use conductor_core::{
    Agent, AgentSet, ConductorError, ConductorResult, Event, EventBus, Execution,
    ExecutionTrigger, ProviderRecord, Repository, Step, Workflow, WorkflowStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Wiring options for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Trigger settings.
    pub scheduler: SchedulerConfig,
    /// Deadline per agent dispatch. `None` waits indefinitely.
    pub dispatch_timeout: Option<Duration>,
    /// Event buffer per subscriber.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            dispatch_timeout: None,
            event_capacity: 1024,
        }
    }
}

/// Definition API and composition root of the orchestration core.
///
/// Owns the capability registry, agent manager, execution engine and
/// scheduler, and keeps the scheduler consistent with stored workflows.
pub struct Orchestrator {
    repository: Repository,
    events: EventBus,
    capabilities: Arc<CapabilityRegistry>,
    agents: Arc<AgentExecutionManager>,
    engine: Arc<ExecutionEngine>,
    scheduler: Scheduler,
}

impl Orchestrator {
    /// Wire every component over `repository`.
    pub fn new(repository: Repository, config: OrchestratorConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let capabilities = Arc::new(CapabilityRegistry::new(events.clone()));

        let mut agents = AgentExecutionManager::new(capabilities.clone(), events.clone())
            .with_repository(repository.clone());
        if let Some(timeout) = config.dispatch_timeout {
            agents = agents.with_dispatch_timeout(timeout);
        }
        let agents = Arc::new(agents);

        let engine = Arc::new(ExecutionEngine::new(
            repository.clone(),
            agents.clone(),
            events.clone(),
        ));
        let scheduler = Scheduler::new(engine.clone(), config.scheduler);

        Self {
            repository,
            events,
            capabilities,
            agents,
            engine,
            scheduler,
        }
    }

    /// Bus every component publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Capability provider registry.
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Agent manager.
    pub fn agents(&self) -> &Arc<AgentExecutionManager> {
        &self.agents
    }

    /// Execution engine.
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Trigger scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Backing record store.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    // --- Workflows ---

    /// Create or replace a workflow definition.
    ///
    /// Replacing keeps the creation time and bumps the version. The trigger is
    /// validated before anything is stored.
    pub async fn register_workflow(&self, mut workflow: Workflow) -> ConductorResult<Workflow> {
        if let Some(expression) = workflow.trigger.as_deref() {
            if !expression.trim().is_empty() {
                Scheduler::parse(expression)?;
            }
        }

        let now = Utc::now();
        match self.repository.load::<Workflow>(&workflow.id).await? {
            Some(existing) => {
                workflow.version = existing.version + 1;
                workflow.created_at = existing.created_at;
            }
            None => workflow.created_at = now,
        }
        workflow.updated_at = now;

        info!(workflow_id = %workflow.id, version = workflow.version, "Workflow registered");
        self.store(&workflow).await?;
        Ok(workflow)
    }

    /// Replace the steps of an existing workflow.
    pub async fn update_steps(
        &self,
        workflow_id: &str,
        preprocessing: Vec<Step>,
        agents: AgentSet,
        postprocessing: Vec<Step>,
    ) -> ConductorResult<Workflow> {
        let mut workflow = self.require(workflow_id).await?;
        workflow.preprocessing = preprocessing;
        workflow.agents = agents;
        workflow.postprocessing = postprocessing;
        self.register_workflow(workflow).await
    }

    /// Change or clear the recurring trigger of a workflow.
    pub async fn set_trigger(
        &self,
        workflow_id: &str,
        trigger: Option<String>,
    ) -> ConductorResult<Workflow> {
        let mut workflow = self.require(workflow_id).await?;
        workflow.trigger = trigger;
        self.register_workflow(workflow).await
    }

    /// Toggle a workflow between `active` and `inactive`, which starts or
    /// stops its schedule.
    pub async fn set_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> ConductorResult<Workflow> {
        let mut workflow = self.require(workflow_id).await?;
        if workflow.status == status {
            return Ok(workflow);
        }
        workflow.status = status;
        workflow.updated_at = Utc::now();
        info!(workflow_id, status = ?status, "Workflow status changed");
        self.store(&workflow).await?;
        Ok(workflow)
    }

    /// Remove a workflow and its trigger. Rejected while an execution of it is running.
    pub async fn delete_workflow(&self, workflow_id: &str) -> ConductorResult<()> {
        if self.engine.is_workflow_live(workflow_id) {
            return Err(ConductorError::WorkflowInUse(workflow_id.to_string()));
        }
        if !self.repository.remove::<Workflow>(workflow_id).await? {
            return Err(ConductorError::WorkflowNotFound(workflow_id.to_string()));
        }
        self.scheduler.unschedule(workflow_id);
        info!(workflow_id, "Workflow deleted");
        Ok(())
    }

    /// Load a workflow definition.
    pub async fn get_workflow(&self, workflow_id: &str) -> ConductorResult<Option<Workflow>> {
        self.repository.load(workflow_id).await
    }

    /// All stored workflows, ordered by id.
    pub async fn list_workflows(&self) -> ConductorResult<Vec<Workflow>> {
        let mut workflows = self.repository.load_all::<Workflow>().await?;
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    // --- Executions ---

    /// Start a run on its own worker and return the `running` snapshot.
    pub async fn run_now(&self, workflow_id: &str) -> ConductorResult<Execution> {
        let (execution, _handle) = self
            .engine
            .spawn(workflow_id, ExecutionTrigger::Manual)
            .await?;
        Ok(execution)
    }

    /// Run a workflow and wait for it to finish.
    pub async fn execute(&self, workflow_id: &str) -> ConductorResult<Execution> {
        self.engine.execute(workflow_id).await
    }

    /// Stored and live executions, newest first, optionally for one workflow.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> ConductorResult<Vec<Execution>> {
        self.engine.list_executions(workflow_id).await
    }

    /// One execution, live snapshot first, then the store.
    pub async fn get_execution(&self, id: Uuid) -> ConductorResult<Option<Execution>> {
        self.engine.get_execution(id).await
    }

    /// Mark executions left `running` by a previous process as failed.
    pub async fn recover_interrupted(&self) -> ConductorResult<usize> {
        self.engine.recover_interrupted().await
    }

    // --- Schedules ---

    /// Reconcile live triggers with the stored workflows.
    ///
    /// Unchanged triggers keep running; stale ones are stopped. Returns the
    /// number of active triggers afterwards.
    pub async fn sync_schedules(&self) -> ConductorResult<usize> {
        let workflows = self.repository.load_all::<Workflow>().await?;
        let mut wanted = HashSet::new();

        for workflow in &workflows {
            if !workflow.is_schedulable() {
                continue;
            }
            wanted.insert(workflow.id.clone());
            if self.scheduler.scheduled_expression(&workflow.id).as_deref()
                == workflow.trigger.as_deref()
            {
                continue;
            }
            if let Err(e) = self.scheduler.schedule(workflow) {
                warn!(workflow_id = %workflow.id, error = %e, "Skipping unschedulable workflow");
            }
        }

        for id in self.scheduler.scheduled_ids() {
            if !wanted.contains(&id) {
                self.scheduler.unschedule(&id);
            }
        }
        Ok(self.scheduler.trigger_count())
    }

    /// Periodically re-run [`Orchestrator::sync_schedules`] so definitions
    /// written by other processes take effect.
    pub fn start_schedule_sync(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                if let Err(e) = self.sync_schedules().await {
                    warn!(error = %e, "Schedule sync failed");
                }
            }
        })
    }

    // --- Agents & providers ---

    /// Register an agent and its handler.
    pub async fn register_agent(
        &self,
        agent: Agent,
        handler: Arc<dyn AgentHandler>,
    ) -> ConductorResult<()> {
        self.agents.register(agent, handler).await
    }

    /// Persist a provider registration and make it available immediately.
    pub async fn register_provider(
        &self,
        record: ProviderRecord,
        timeout: Duration,
    ) -> ConductorResult<()> {
        let provider = HttpCapabilityProvider::from_record(&record, timeout)?;
        self.repository.save(&record).await?;
        self.capabilities.register(Arc::new(provider)).await;
        Ok(())
    }

    /// Forget a provider. Returns false when it was neither stored nor registered.
    pub async fn deregister_provider(&self, provider_id: &str) -> ConductorResult<bool> {
        let stored = self.repository.remove::<ProviderRecord>(provider_id).await?;
        let live = self.capabilities.deregister(provider_id).await;
        Ok(stored || live)
    }

    /// Register every persisted provider. Returns how many were restored.
    pub async fn restore_providers(&self, timeout: Duration) -> ConductorResult<usize> {
        let records = self.repository.load_all::<ProviderRecord>().await?;
        let mut restored = 0;
        for record in &records {
            match HttpCapabilityProvider::from_record(record, timeout) {
                Ok(provider) => {
                    self.capabilities.register(Arc::new(provider)).await;
                    restored += 1;
                }
                Err(e) => warn!(provider = %record.id, error = %e, "Failed to restore provider"),
            }
        }
        info!(restored, "Capability providers restored");
        Ok(restored)
    }

    /// Stop every trigger.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    async fn require(&self, workflow_id: &str) -> ConductorResult<Workflow> {
        self.repository
            .load::<Workflow>(workflow_id)
            .await?
            .ok_or_else(|| ConductorError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn store(&self, workflow: &Workflow) -> ConductorResult<()> {
        self.repository.save(workflow).await?;
        if workflow.is_schedulable() {
            self.scheduler.schedule(workflow)?;
        } else {
            self.scheduler.unschedule(&workflow.id);
        }
        self.events.publish(Event::WorkflowChanged(workflow.clone()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::ExecutionMode;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Repository::in_memory(), OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn test_register_bumps_version_and_schedules() {
        let orch = orchestrator();
        let wf = orch
            .register_workflow(Workflow::new("w", "Report").with_trigger("*/15 * * * *"))
            .await
            .unwrap();
        assert_eq!(wf.version, 1);
        assert_eq!(
            orch.scheduler().scheduled_expression("w").as_deref(),
            Some("*/15 * * * *")
        );

        let wf2 = orch
            .register_workflow(Workflow::new("w", "Report v2").with_trigger("0 * * * *"))
            .await
            .unwrap();
        assert_eq!(wf2.version, 2);
        assert_eq!(wf2.created_at, wf.created_at);
        assert_eq!(orch.scheduler().trigger_count(), 1);
        assert_eq!(
            orch.scheduler().scheduled_expression("w").as_deref(),
            Some("0 * * * *")
        );
    }

    #[tokio::test]
    async fn test_invalid_trigger_is_not_stored() {
        let orch = orchestrator();
        let err = orch
            .register_workflow(Workflow::new("w", "Bad").with_trigger("every tuesday"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidScheduleExpression { .. }));
        assert!(orch.get_workflow("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_toggles_schedule() {
        let orch = orchestrator();
        orch.register_workflow(Workflow::new("w", "W").with_trigger("0 9 * * 1"))
            .await
            .unwrap();
        assert!(orch.scheduler().is_scheduled("w"));

        orch.set_status("w", WorkflowStatus::Inactive).await.unwrap();
        assert!(!orch.scheduler().is_scheduled("w"));

        orch.set_status("w", WorkflowStatus::Active).await.unwrap();
        assert!(orch.scheduler().is_scheduled("w"));

        orch.set_trigger("w", None).await.unwrap();
        assert!(!orch.scheduler().is_scheduled("w"));
    }

    #[tokio::test]
    async fn test_update_steps_on_missing_workflow() {
        let orch = orchestrator();
        let err = orch
            .update_steps("ghost", vec![], AgentSet::default(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_steps_replaces_agents() {
        let orch = orchestrator();
        orch.register_workflow(Workflow::new("w", "W")).await.unwrap();
        let updated = orch
            .update_steps(
                "w",
                vec![Step::capability("clean", "normalize")],
                AgentSet {
                    mode: ExecutionMode::Parallel,
                    steps: vec![Step::agent("a", "a1"), Step::agent("b", "a2")],
                },
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.step_count(), 3);
        assert_eq!(updated.agents.mode, ExecutionMode::Parallel);
    }

    #[tokio::test]
    async fn test_sync_schedules_reconciles_store() {
        let orch = orchestrator();
        let repo = orch.repository().clone();
        repo.save(&Workflow::new("a", "A").with_trigger("*/5 * * * *"))
            .await
            .unwrap();
        repo.save(
            &Workflow::new("b", "B")
                .with_trigger("0 0 * * *")
                .with_status(WorkflowStatus::Inactive),
        )
        .await
        .unwrap();
        repo.save(&Workflow::new("c", "C").with_trigger("not cron"))
            .await
            .unwrap();

        assert_eq!(orch.sync_schedules().await.unwrap(), 1);
        assert!(orch.scheduler().is_scheduled("a"));

        repo.remove::<Workflow>("a").await.unwrap();
        assert_eq!(orch.sync_schedules().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_missing_workflow() {
        let orch = orchestrator();
        assert!(matches!(
            orch.delete_workflow("ghost").await,
            Err(ConductorError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_records_round_trip_through_store() {
        let orch = orchestrator();
        orch.register_provider(
            ProviderRecord::new("search", "http://127.0.0.1:9", vec!["web_search".into()]),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(orch.capabilities().provider_count().await, 1);

        let fresh = Orchestrator::new(orch.repository().clone(), OrchestratorConfig::default());
        assert_eq!(fresh.restore_providers(Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(fresh.capabilities().candidates("web_search").await.len(), 1);

        assert!(fresh.deregister_provider("search").await.unwrap());
        assert!(!fresh.deregister_provider("search").await.unwrap());
    }
}
