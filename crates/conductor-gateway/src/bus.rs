use crate::connection::{Connection, ConnectionManager};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::snapshot::GatewayBackend;
use conductor_core::{Channel, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default interval between heartbeat snapshots.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Relays core events to subscribed observers and answers their requests.
///
/// Traffic only flows outward from the core: the bus reads the event stream
/// and calls into the backend for snapshots and on-demand runs, but nothing
/// in the core depends on it.
pub struct NotificationBus {
    connections: Arc<ConnectionManager>,
    backend: Arc<dyn GatewayBackend>,
    heartbeat: Duration,
}

impl NotificationBus {
    /// Create a bus serving snapshots and runs from `backend`.
    pub fn new(backend: Arc<dyn GatewayBackend>, heartbeat: Duration) -> Self {
        Self {
            connections: ConnectionManager::new(),
            backend,
            heartbeat,
        }
    }

    /// The observer connection registry.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Forward every event on `events` to the subscribers of its channel.
    ///
    /// A lagging relay skips the lost events; heartbeats resynchronise observers.
    pub fn start(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let channel = event.channel();
                        let message = OutboundMessage::update(channel, event.payload()).to_json();
                        let delivered = bus.connections.broadcast(channel, &message).await;
                        debug!(channel = %channel, delivered, "Event relayed");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notification relay lagged behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Notification relay stopped");
        })
    }

    /// Register a new observer. Sends the `connected` greeting and starts its
    /// heartbeat unless the interval is zero.
    pub async fn connect(self: &Arc<Self>) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.add(Connection::new(id, tx)).await;
        self.connections
            .send_to(id, &OutboundMessage::Connected { connection_id: id }.to_json())
            .await;

        if !self.heartbeat.is_zero() {
            let bus = Arc::clone(self);
            let heartbeat = tokio::spawn(async move { bus.run_heartbeat(id).await });
            self.connections.set_heartbeat(id, heartbeat).await;
        }
        (id, rx)
    }

    /// Drop an observer and everything it subscribed to.
    pub async fn disconnect(&self, id: Uuid) {
        self.connections.remove(id).await;
    }

    /// Handle one raw inbound frame from an observer.
    pub async fn handle_text(self: &Arc<Self>, id: Uuid, text: &str) {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => self.handle(id, message).await,
            Err(e) => {
                debug!(connection_id = %id, error = %e, "Malformed inbound message");
                self.reply(id, OutboundMessage::error(format!("invalid message: {e}")))
                    .await;
            }
        }
    }

    /// Handle one decoded inbound message.
    pub async fn handle(self: &Arc<Self>, id: Uuid, message: InboundMessage) {
        let request = message.kind();
        match message {
            InboundMessage::Subscribe { channels } => {
                let current = self.connections.subscribe(id, &channels).await;
                self.ack_channels(id, request, current).await;
            }
            InboundMessage::Unsubscribe { channels } => {
                let current = self.connections.unsubscribe(id, &channels).await;
                self.ack_channels(id, request, current).await;
            }
            InboundMessage::GetSnapshot { channel } => {
                let reply = match self.backend.snapshot(channel).await {
                    Ok(payload) => OutboundMessage::update(channel, payload),
                    Err(e) => OutboundMessage::error(format!("snapshot of '{channel}' failed: {e}")),
                };
                self.reply(id, reply).await;
            }
            InboundMessage::ExecuteWorkflow { id: workflow_id } => {
                self.reply(
                    id,
                    OutboundMessage::Ack {
                        request,
                        channels: None,
                        workflow_id: Some(workflow_id.clone()),
                    },
                )
                .await;

                let bus = Arc::clone(self);
                tokio::spawn(async move {
                    match bus.backend.execute_workflow(&workflow_id).await {
                        Ok(execution) => {
                            info!(
                                connection_id = %id,
                                workflow_id = %workflow_id,
                                execution_id = %execution.id,
                                "Workflow run requested by observer"
                            );
                        }
                        Err(e) => {
                            warn!(connection_id = %id, workflow_id = %workflow_id, error = %e, "Observer run request failed");
                            bus.reply(id, OutboundMessage::error(e.to_string())).await;
                        }
                    }
                });
            }
        }
    }

    async fn ack_channels(&self, id: Uuid, request: &'static str, current: Option<Vec<Channel>>) {
        if let Some(channels) = current {
            self.reply(
                id,
                OutboundMessage::Ack {
                    request,
                    channels: Some(channels),
                    workflow_id: None,
                },
            )
            .await;
        }
    }

    async fn reply(&self, id: Uuid, message: OutboundMessage) {
        self.connections.send_to(id, &message.to_json()).await;
    }

    /// Re-send a fresh snapshot of every subscribed channel at each interval.
    async fn run_heartbeat(&self, id: Uuid) {
        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut timer = tokio::time::interval_at(start, self.heartbeat);
        loop {
            timer.tick().await;
            let Some(channels) = self.connections.subscriptions(id).await else {
                break;
            };
            for channel in channels {
                match self.backend.snapshot(channel).await {
                    Ok(payload) => {
                        let message = OutboundMessage::update(channel, payload).to_json();
                        if !self.connections.send_to(id, &message).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %id, channel = %channel, error = %e, "Heartbeat snapshot failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_core::{
        Agent, ConductorError, ConductorResult, Event, Execution, ExecutionTrigger, MetricsSnapshot,
        Workflow,
    };

    struct StaticBackend;

    #[async_trait]
    impl GatewayBackend for StaticBackend {
        async fn snapshot(&self, channel: Channel) -> ConductorResult<serde_json::Value> {
            Ok(serde_json::json!({ "snapshot": channel.as_str() }))
        }

        async fn execute_workflow(&self, workflow_id: &str) -> ConductorResult<Execution> {
            if workflow_id == "known" {
                Ok(Execution::start(
                    &Workflow::new("known", "Known"),
                    ExecutionTrigger::Manual,
                ))
            } else {
                Err(ConductorError::WorkflowNotFound(workflow_id.to_string()))
            }
        }
    }

    fn bus(heartbeat: Duration) -> Arc<NotificationBus> {
        Arc::new(NotificationBus::new(Arc::new(StaticBackend), heartbeat))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_connect_greets_and_subscribe_acks() {
        let bus = bus(DEFAULT_HEARTBEAT);
        let (id, mut rx) = bus.connect().await;

        let hello = next(&mut rx).await;
        assert_eq!(hello["type"], "connected");
        assert_eq!(hello["connection_id"], id.to_string());

        bus.handle_text(id, r#"{"type":"subscribe","channels":["metrics","workflows"]}"#)
            .await;
        let ack = next(&mut rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["request"], "subscribe");
        assert_eq!(ack["channels"], serde_json::json!(["metrics", "workflows"]));
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error() {
        let bus = bus(DEFAULT_HEARTBEAT);
        let (id, mut rx) = bus.connect().await;
        next(&mut rx).await;

        bus.handle_text(id, "not json").await;
        assert_eq!(next(&mut rx).await["type"], "error");
        bus.handle_text(id, r#"{"type":"subscribe","channels":["nope"]}"#)
            .await;
        assert_eq!(next(&mut rx).await["type"], "error");
    }

    #[tokio::test]
    async fn test_execute_unknown_workflow_acks_then_errors() {
        let bus = bus(DEFAULT_HEARTBEAT);
        let (id, mut rx) = bus.connect().await;
        next(&mut rx).await;

        bus.handle_text(id, r#"{"type":"execute_workflow","id":"ghost"}"#)
            .await;
        let ack = next(&mut rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["workflow_id"], "ghost");
        let err = next(&mut rx).await;
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_relay_routes_by_channel() {
        let events = EventBus::new(16);
        let bus = bus(DEFAULT_HEARTBEAT);
        let _relay = bus.start(&events);

        let (wf_id, mut wf_rx) = bus.connect().await;
        let (all_id, mut all_rx) = bus.connect().await;
        next(&mut wf_rx).await;
        next(&mut all_rx).await;
        bus.connections().subscribe(wf_id, &[Channel::Workflows]).await;
        bus.connections()
            .subscribe(all_id, &[Channel::Workflows, Channel::Metrics])
            .await;

        events.publish(Event::MetricsUpdated(MetricsSnapshot::default()));
        events.publish(Event::WorkflowChanged(Workflow::new("w", "W")));

        assert_eq!(next(&mut all_rx).await["type"], "metrics_updated");
        assert_eq!(next(&mut all_rx).await["type"], "workflow_updated");
        assert_eq!(next(&mut wf_rx).await["type"], "workflow_updated");

        events.publish(Event::AgentUpdated(Agent::new("a", "A")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(wf_rx.try_recv().is_err());
        assert!(all_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_resends_subscribed_snapshots() {
        let bus = bus(Duration::from_secs(30));
        let (id, mut rx) = bus.connect().await;
        next(&mut rx).await;
        bus.connections().subscribe(id, &[Channel::Agents]).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let beat = next(&mut rx).await;
        assert_eq!(beat["type"], "agent_updated");
        assert_eq!(beat["payload"]["snapshot"], "agents");

        bus.disconnect(id).await;
        assert_eq!(bus.connections().connection_count().await, 0);
    }
}
