//! State-change events and the broadcast bus that carries them.
//!
//! Producers (execution engine, agent manager, capability registry) publish
//! [`Event`]s; the notification layer subscribes and relays them to observers.
//! Events only flow outward, producers never read from the bus.

use crate::agent::{Agent, MetricsSnapshot};
use crate::execution::{Activity, Execution};
use crate::provider::ProviderSnapshot;
use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Named category of broadcast traffic an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Aggregate agent metrics.
    Metrics,
    /// Audit activity records.
    Activities,
    /// Workflow definitions and executions.
    Workflows,
    /// Capability provider health.
    McpServers,
    /// Individual agent state.
    Agents,
}

impl Channel {
    /// Every channel, in wire order.
    pub const ALL: [Channel; 5] = [
        Channel::Metrics,
        Channel::Activities,
        Channel::Workflows,
        Channel::McpServers,
        Channel::Agents,
    ];

    /// Wire name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Metrics => "metrics",
            Channel::Activities => "activities",
            Channel::Workflows => "workflows",
            Channel::McpServers => "mcp_servers",
            Channel::Agents => "agents",
        }
    }

    /// Outbound message type used for pushes on this channel.
    pub fn event_type(self) -> &'static str {
        match self {
            Channel::Metrics => "metrics_updated",
            Channel::Activities => "activity_updated",
            Channel::Workflows => "workflow_updated",
            Channel::McpServers => "mcp_servers_updated",
            Channel::Agents => "agent_updated",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel '{s}'"))
    }
}

/// A state change raised by one of the core components.
#[derive(Debug, Clone)]
pub enum Event {
    /// An execution was created, progressed or terminated.
    ExecutionUpdated(Execution),
    /// A workflow definition was stored.
    WorkflowChanged(Workflow),
    /// An agent changed state or statistics.
    AgentUpdated(Agent),
    /// Aggregate metrics after an agent change.
    MetricsUpdated(MetricsSnapshot),
    /// A provider was registered or its health changed.
    ProviderUpdated(ProviderSnapshot),
    /// A provider was deregistered.
    ProviderRemoved { id: String },
    /// An activity record was written.
    ActivityRecorded(Activity),
}

impl Event {
    /// The single channel this event is delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            Event::ExecutionUpdated(_) | Event::WorkflowChanged(_) => Channel::Workflows,
            Event::AgentUpdated(_) => Channel::Agents,
            Event::MetricsUpdated(_) => Channel::Metrics,
            Event::ProviderUpdated(_) | Event::ProviderRemoved { .. } => Channel::McpServers,
            Event::ActivityRecorded(_) => Channel::Activities,
        }
    }

    /// JSON payload sent to observers.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Event::ExecutionUpdated(e) => serde_json::to_value(e),
            Event::WorkflowChanged(w) => serde_json::to_value(w),
            Event::AgentUpdated(a) => serde_json::to_value(a),
            Event::MetricsUpdated(m) => serde_json::to_value(m),
            Event::ProviderUpdated(p) => serde_json::to_value(p),
            Event::ProviderRemoved { id } => Ok(serde_json::json!({ "id": id, "removed": true })),
            Event::ActivityRecorded(a) => serde_json::to_value(a),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Fan-out bus for [`Event`]s backed by a `tokio::sync::broadcast` channel.
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let channel = event.channel();
        if self.tx.send(event).is_err() {
            tracing::trace!(channel = %channel, "No event subscribers");
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
