//! Workflow scheduling, agent dispatch and execution.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Definition API and composition root; keeps triggers in sync with stored workflows.
//! - [`ExecutionEngine`] — Runs a workflow's phases and owns the execution record lifecycle.
//! - [`AgentExecutionManager`] — Agent state, statistics, dispatch and capability resolution.
//! - [`Scheduler`] — Cron-based recurring triggers, one per workflow.
//! - [`AgentHandler`] — The opaque work behind an agent.

/// Agent state, statistics and capability resolution.
pub mod agents;
/// Workflow execution engine.
pub mod engine;
/// Agent handler trait and HTTP handler.
pub mod handler;
/// Cron-based workflow scheduler.
pub mod scheduler;
/// Definition API tying the components together.
pub mod service;

pub use agents::{AgentExecutionManager, Resolution};
pub use engine::ExecutionEngine;
pub use handler::{AgentHandler, HttpAgentHandler};
pub use scheduler::{Scheduler, SchedulerConfig, TriggerSchedule, WorkflowLauncher};
pub use service::{Orchestrator, OrchestratorConfig};
