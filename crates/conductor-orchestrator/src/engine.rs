use crate::agents::AgentExecutionManager;
use crate::scheduler::WorkflowLauncher;
use async_trait::async_trait;
use conductor_core::{
    Activity, ConductorError, ConductorResult, Event, EventBus, Execution, ExecutionMode,
    ExecutionTrigger, Repository, Step, Workflow,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs workflows and owns the lifecycle of their execution records.
///
/// Each execution is driven by exactly one worker. A snapshot is kept in the
/// live map while it runs so observers and the definition API can see it.
pub struct ExecutionEngine {
    repository: Repository,
    agents: Arc<AgentExecutionManager>,
    events: EventBus,
    live: Mutex<HashMap<Uuid, Execution>>,
}

impl ExecutionEngine {
    /// Create an engine over the store and agent manager.
    pub fn new(repository: Repository, agents: Arc<AgentExecutionManager>, events: EventBus) -> Self {
        Self {
            repository,
            agents,
            events,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Run a workflow on demand and wait for its terminal state.
    pub async fn execute(&self, workflow_id: &str) -> ConductorResult<Execution> {
        self.execute_with(workflow_id, ExecutionTrigger::Manual)
            .await
    }

    /// Run a workflow to completion.
    ///
    /// Returns `Ok` for both `completed` and `failed` executions; only a
    /// missing workflow or an unreadable store is an error.
    pub async fn execute_with(
        &self,
        workflow_id: &str,
        trigger: ExecutionTrigger,
    ) -> ConductorResult<Execution> {
        let (workflow, execution) = self.begin(workflow_id, trigger).await?;
        Ok(self.drive(workflow, execution).await)
    }

    /// Start a workflow on its own worker.
    ///
    /// The returned snapshot is still `running`; the handle resolves to the
    /// terminal execution.
    pub async fn spawn(
        self: &Arc<Self>,
        workflow_id: &str,
        trigger: ExecutionTrigger,
    ) -> ConductorResult<(Execution, JoinHandle<Execution>)> {
        let (workflow, execution) = self.begin(workflow_id, trigger).await?;
        let snapshot = execution.clone();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.drive(workflow, execution).await });
        Ok((snapshot, handle))
    }

    /// Executions currently running, oldest first.
    pub fn live_executions(&self) -> Vec<Execution> {
        let mut live: Vec<Execution> = self.live.lock().values().cloned().collect();
        live.sort_by_key(|e| e.started_at);
        live
    }

    /// True while any execution of the workflow is still running.
    pub fn is_workflow_live(&self, workflow_id: &str) -> bool {
        self.live
            .lock()
            .values()
            .any(|e| e.workflow_id == workflow_id)
    }

    /// Stored and live executions, newest first, optionally for one workflow.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> ConductorResult<Vec<Execution>> {
        let mut by_id: HashMap<Uuid, Execution> = self
            .repository
            .load_all::<Execution>()
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();
        for execution in self.live_executions() {
            by_id.insert(execution.id, execution);
        }

        let mut executions: Vec<Execution> = by_id
            .into_values()
            .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id))
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions)
    }

    /// One execution, live snapshot first, then the store.
    pub async fn get_execution(&self, id: Uuid) -> ConductorResult<Option<Execution>> {
        if let Some(live) = self.live.lock().get(&id).cloned() {
            return Ok(Some(live));
        }
        self.repository.load::<Execution>(&id.to_string()).await
    }

    /// Fail every stored `running` execution that no worker in this process
    /// drives. Those were cut off by a previous process exit.
    pub async fn recover_interrupted(&self) -> ConductorResult<usize> {
        let stored = self.repository.load_all::<Execution>().await?;
        let mut recovered = 0;
        for mut execution in stored {
            if execution.is_terminal() || self.live.lock().contains_key(&execution.id) {
                continue;
            }
            execution.fail("interrupted by restart");
            warn!(
                workflow_id = %execution.workflow_id,
                execution_id = %execution.id,
                "Execution interrupted by restart marked failed"
            );
            self.record(&execution).await;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn begin(
        &self,
        workflow_id: &str,
        trigger: ExecutionTrigger,
    ) -> ConductorResult<(Workflow, Execution)> {
        let workflow = self
            .repository
            .load::<Workflow>(workflow_id)
            .await?
            .ok_or_else(|| ConductorError::WorkflowNotFound(workflow_id.to_string()))?;

        let execution = Execution::start(&workflow, trigger);
        info!(
            workflow_id = %workflow.id,
            execution_id = %execution.id,
            trigger = ?trigger,
            "Execution started"
        );
        self.live.lock().insert(execution.id, execution.clone());
        self.record(&execution).await;
        Ok((workflow, execution))
    }

    async fn drive(&self, workflow: Workflow, mut execution: Execution) -> Execution {
        let start = Instant::now();
        match self.run_phases(&workflow, &mut execution).await {
            Ok(()) => {
                execution.complete();
                info!(
                    workflow_id = %workflow.id,
                    execution_id = %execution.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Execution completed"
                );
            }
            Err(e) => {
                error!(
                    workflow_id = %workflow.id,
                    execution_id = %execution.id,
                    error = %e,
                    "Execution failed"
                );
                execution.fail(&e);
            }
        }
        self.live.lock().remove(&execution.id);
        self.record(&execution).await;
        execution
    }

    async fn run_phases(
        &self,
        workflow: &Workflow,
        execution: &mut Execution,
    ) -> ConductorResult<()> {
        self.run_sequential("preprocessing", &workflow.preprocessing, execution)
            .await?;
        match workflow.agents.mode {
            ExecutionMode::Sequential => {
                self.run_sequential("agent", &workflow.agents.steps, execution)
                    .await?;
            }
            ExecutionMode::Parallel => {
                self.run_parallel(&workflow.agents.steps, execution).await?;
            }
        }
        self.run_sequential("postprocessing", &workflow.postprocessing, execution)
            .await
    }

    /// Steps in declared order; the first failure stops the phase.
    async fn run_sequential(
        &self,
        phase: &str,
        steps: &[Step],
        execution: &mut Execution,
    ) -> ConductorResult<()> {
        for step in steps {
            execution.log(format!(
                "{phase} step '{}' dispatched to {}",
                step.name, step.target
            ));
            let start = Instant::now();
            let result = self.agents.run_step(&step.target, step.input.clone()).await;
            self.log_outcome(phase, step, start, &result, execution);
            result.map_err(|e| ConductorError::step_failed(step.name.clone(), e))?;
        }
        Ok(())
    }

    /// All steps concurrently; waits for every one to settle before
    /// reporting the first failure in declared order.
    async fn run_parallel(&self, steps: &[Step], execution: &mut Execution) -> ConductorResult<()> {
        if steps.is_empty() {
            return Ok(());
        }
        execution.log(format!("Dispatching {} agent steps in parallel", steps.len()));
        self.refresh(execution);

        let agents = &self.agents;
        let results = join_all(steps.iter().map(|step| async move {
            let start = Instant::now();
            let result = agents.run_step(&step.target, step.input.clone()).await;
            (start, result)
        }))
        .await;

        let mut first_failure = None;
        for (step, (start, result)) in steps.iter().zip(results) {
            self.log_outcome("agent", step, start, &result, execution);
            if let Err(e) = result {
                if first_failure.is_none() {
                    first_failure = Some(ConductorError::step_failed(step.name.clone(), e));
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn log_outcome(
        &self,
        phase: &str,
        step: &Step,
        start: Instant,
        result: &ConductorResult<serde_json::Value>,
        execution: &mut Execution,
    ) {
        let elapsed_ms = start.elapsed().as_millis();
        match result {
            Ok(_) => execution.log(format!(
                "{phase} step '{}' completed in {elapsed_ms}ms",
                step.name
            )),
            Err(e) => execution.log(format!(
                "{phase} step '{}' failed after {elapsed_ms}ms: {e}",
                step.name
            )),
        }
        self.refresh(execution);
    }

    fn refresh(&self, execution: &Execution) {
        if let Some(slot) = self.live.lock().get_mut(&execution.id) {
            *slot = execution.clone();
        }
    }

    /// Persist the execution and its activity record, then announce both.
    async fn record(&self, execution: &Execution) {
        let activity = Activity::for_execution(execution);
        info!(
            workflow_id = %activity.workflow_id,
            execution_id = %activity.execution_id,
            kind = ?activity.kind,
            "{}",
            activity.message
        );
        if let Err(e) = self.repository.save(execution).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
        if let Err(e) = self.repository.save(&activity).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist activity");
        }
        self.events
            .publish(Event::ExecutionUpdated(execution.clone()));
        self.events.publish(Event::ActivityRecorded(activity));
    }
}

#[async_trait]
impl WorkflowLauncher for ExecutionEngine {
    async fn launch(
        &self,
        workflow_id: &str,
        trigger: ExecutionTrigger,
    ) -> ConductorResult<Execution> {
        self.execute_with(workflow_id, trigger).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::AgentHandler;
    use conductor_capability::CapabilityRegistry;
    use conductor_core::{Agent, ExecutionState, Step};

    struct FixedHandler {
        fail: bool,
    }

    #[async_trait]
    impl AgentHandler for FixedHandler {
        async fn execute(
            &self,
            _agent: &Agent,
            _input: serde_json::Value,
        ) -> ConductorResult<serde_json::Value> {
            if self.fail {
                Err(ConductorError::Http("boom".into()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    async fn engine_with(agents: &[(&str, bool)]) -> (Arc<ExecutionEngine>, Repository) {
        let repository = Repository::in_memory();
        let events = EventBus::default();
        let manager = Arc::new(AgentExecutionManager::new(
            Arc::new(CapabilityRegistry::new(events.clone())),
            events.clone(),
        ));
        for (id, fail) in agents {
            manager
                .register(Agent::new(*id, *id), Arc::new(FixedHandler { fail: *fail }))
                .await
                .unwrap();
        }
        (
            Arc::new(ExecutionEngine::new(repository.clone(), manager, events)),
            repository,
        )
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let (engine, _) = engine_with(&[]).await;
        assert!(matches!(
            engine.execute("missing").await,
            Err(ConductorError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let (engine, repo) = engine_with(&[]).await;
        repo.save(&Workflow::new("w", "Empty")).await.unwrap();

        let execution = engine.execute("w").await.unwrap();
        assert_eq!(execution.state, ExecutionState::Completed);
        assert!(execution.ended_at.is_some());
        assert!(!engine.is_workflow_live("w"));

        let stored = engine.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Completed);
        assert_eq!(repo.load_all::<Activity>().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_preprocessing_failure_skips_remaining_phases() {
        let (engine, repo) = engine_with(&[("bad", true), ("good", false)]).await;
        let workflow = Workflow::new("w", "Pre")
            .with_preprocessing(vec![Step::agent("pre", "bad")])
            .with_agents(ExecutionMode::Sequential, vec![Step::agent("main", "good")]);
        repo.save(&workflow).await.unwrap();

        let execution = engine.execute("w").await.unwrap();
        assert_eq!(execution.state, ExecutionState::Failed);
        assert!(execution
            .log
            .last()
            .unwrap()
            .message
            .contains("Step 'pre' failed"));
        assert!(!execution.log.iter().any(|l| l.message.contains("'main'")));
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_orphaned_runs() {
        let (engine, repo) = engine_with(&[]).await;
        let workflow = Workflow::new("w", "Orphaned");
        let orphan = Execution::start(&workflow, ExecutionTrigger::Scheduled);
        let mut finished = Execution::start(&workflow, ExecutionTrigger::Manual);
        finished.complete();
        repo.save(&orphan).await.unwrap();
        repo.save(&finished).await.unwrap();

        assert_eq!(engine.recover_interrupted().await.unwrap(), 1);
        let stored = engine.get_execution(orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Failed);
        assert!(stored.ended_at.is_some());
        assert!(stored
            .log
            .last()
            .unwrap()
            .message
            .contains("interrupted by restart"));

        let activities = repo.load_all::<Activity>().await.unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].execution_id, orphan.id);
        assert_eq!(activities[0].kind, conductor_core::ActivityKind::ExecutionFailed);

        // Nothing left to recover.
        assert_eq!(engine.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_returns_running_snapshot() {
        let (engine, repo) = engine_with(&[("a1", false)]).await;
        repo.save(
            &Workflow::new("w", "Spawned")
                .with_agents(ExecutionMode::Parallel, vec![Step::agent("a", "a1")]),
        )
        .await
        .unwrap();

        let (snapshot, handle) = engine.spawn("w", ExecutionTrigger::Manual).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Running);
        let done = handle.await.unwrap();
        assert_eq!(done.id, snapshot.id);
        assert_eq!(done.state, ExecutionState::Completed);

        let listed = engine.list_executions(Some("w")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(engine.list_executions(Some("other")).await.unwrap().is_empty());
    }
}
