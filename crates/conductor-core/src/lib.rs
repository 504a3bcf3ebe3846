//! Core types and error definitions for the Conductor orchestration core.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the error taxonomy, the workflow/execution/agent data model, the
//! record store collaborator and the event bus that feeds observers.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Workflow`] — Stored definition of steps and an optional trigger.
//! - [`Execution`] — One run of a workflow with its state and log.
//! - [`Agent`] — Capability-bearing unit with dispatch statistics.
//! - [`Repository`] — Typed CRUD over an injected [`RecordStore`].
//! - [`EventBus`] — Broadcast of state changes to the notification layer.

/// Agent state and statistics.
pub mod agent;
/// Error taxonomy.
pub mod error;
/// State-change events and the event bus.
pub mod event;
/// Execution records and activity entries.
pub mod execution;
/// Capability provider snapshots and registrations.
pub mod provider;
/// Record store trait and implementations.
pub mod store;
/// Workflow definitions.
pub mod workflow;

pub use agent::{Agent, AgentStatus, MetricsSnapshot};
pub use error::{ConductorError, ConductorResult};
pub use event::{Channel, Event, EventBus};
pub use execution::{Activity, ActivityKind, Execution, ExecutionState, ExecutionTrigger, LogEntry};
pub use provider::{ProviderRecord, ProviderSnapshot, ProviderStatus};
pub use store::{FileStore, MemoryStore, Record, RecordKind, RecordStore, Repository};
pub use workflow::{AgentSet, ExecutionMode, Step, StepTarget, Workflow, WorkflowStatus};
