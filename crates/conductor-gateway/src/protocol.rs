use conductor_core::Channel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Requests an observer can send, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Add channels to the connection's subscriptions.
    Subscribe { channels: Vec<Channel> },
    /// Remove channels from the connection's subscriptions.
    Unsubscribe { channels: Vec<Channel> },
    /// Send the current state of one channel.
    GetSnapshot { channel: Channel },
    /// Start a workflow run.
    ExecuteWorkflow { id: String },
}

impl InboundMessage {
    /// Wire name of the request, echoed in acks.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Subscribe { .. } => "subscribe",
            InboundMessage::Unsubscribe { .. } => "unsubscribe",
            InboundMessage::GetSnapshot { .. } => "get_snapshot",
            InboundMessage::ExecuteWorkflow { .. } => "execute_workflow",
        }
    }
}

/// Messages pushed to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// First message on every connection.
    Connected { connection_id: Uuid },
    /// Acknowledges an inbound request.
    Ack {
        request: &'static str,
        channels: Option<Vec<Channel>>,
        workflow_id: Option<String>,
    },
    /// A request failed.
    Error { message: String },
    /// `<channel>_updated` push, from an event, a snapshot request or a heartbeat.
    Update {
        channel: Channel,
        payload: serde_json::Value,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame<'a> {
    Connected {
        connection_id: Uuid,
    },
    Ack {
        request: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        channels: Option<&'a [Channel]>,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_id: Option<&'a str>,
    },
    Error {
        message: &'a str,
    },
}

#[derive(Serialize)]
struct UpdateFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: Channel,
    payload: &'a serde_json::Value,
}

impl OutboundMessage {
    /// An error reply.
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    /// A channel update carrying `payload`.
    pub fn update(channel: Channel, payload: serde_json::Value) -> Self {
        OutboundMessage::Update { channel, payload }
    }

    /// Wire form of the message.
    pub fn to_json(&self) -> String {
        let encoded = match self {
            OutboundMessage::Connected { connection_id } => serde_json::to_string(&Frame::Connected {
                connection_id: *connection_id,
            }),
            OutboundMessage::Ack {
                request,
                channels,
                workflow_id,
            } => serde_json::to_string(&Frame::Ack {
                request,
                channels: channels.as_deref(),
                workflow_id: workflow_id.as_deref(),
            }),
            OutboundMessage::Error { message } => {
                serde_json::to_string(&Frame::Error { message })
            }
            OutboundMessage::Update { channel, payload } => serde_json::to_string(&UpdateFrame {
                kind: channel.event_type(),
                channel: *channel,
                payload,
            }),
        };
        encoded.unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "message": format!("encoding failed: {e}") })
                .to_string()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"subscribe","channels":["workflows","mcp_servers"]}"#)
                .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Subscribe {
                channels: vec![Channel::Workflows, Channel::McpServers]
            }
        );

        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"execute_workflow","id":"nightly"}"#).unwrap();
        assert_eq!(msg.kind(), "execute_workflow");

        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":"subscribe","channels":["bogus"]}"#).is_err());
        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_update_uses_channel_event_name() {
        let json = OutboundMessage::update(Channel::McpServers, serde_json::json!([1])).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "mcp_servers_updated");
        assert_eq!(value["channel"], "mcp_servers");
        assert_eq!(value["payload"], serde_json::json!([1]));
    }

    #[test]
    fn test_ack_omits_absent_fields() {
        let json = OutboundMessage::Ack {
            request: "execute_workflow",
            channels: None,
            workflow_id: Some("w".into()),
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["workflow_id"], "w");
        assert!(value.get("channels").is_none());
    }
}
