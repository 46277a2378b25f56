use crate::models::{Message, Notification};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket events from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    /// Messages received over this socket
    #[serde(rename = "ack")]
    Ack { message_ids: Vec<Uuid> },

    /// Everything up to and including `up_to_seq` has been read
    #[serde(rename = "ack_read")]
    AckRead { up_to_seq: i64 },

    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsOutboundEvent {
    #[serde(rename = "message")]
    Message { message: Message },

    #[serde(rename = "message.edited")]
    MessageEdited { message: Message },

    #[serde(rename = "message.deleted")]
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
        seq: i64,
    },

    /// Sent once right after subscribing
    #[serde(rename = "backlog")]
    Backlog {
        conversation_id: Uuid,
        latest_seq: i64,
        last_read_seq: i64,
        notifications: Vec<Notification>,
    },

    #[serde(rename = "read")]
    ReadAcknowledged {
        conversation_id: Uuid,
        last_read_seq: i64,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_events_parse_from_tagged_json() {
        let evt: WsInboundEvent = serde_json::from_str(r#"{"type":"ack_read","up_to_seq":4}"#).unwrap();
        assert!(matches!(evt, WsInboundEvent::AckRead { up_to_seq: 4 }));

        let evt: WsInboundEvent = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(evt, WsInboundEvent::Heartbeat));
    }

    #[test]
    fn deleted_event_uses_dotted_type() {
        let evt = WsOutboundEvent::MessageDeleted {
            conversation_id: Uuid::nil(),
            message_id: Uuid::nil(),
            seq: 9,
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "message.deleted");
        assert_eq!(json["seq"], 9);
    }
}
