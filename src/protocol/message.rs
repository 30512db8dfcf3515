//! Tagged decode of inbound frames and encoding of control messages.

use super::envelope::{Envelope, Ref};
use super::ProtocolConfig;
use crate::error::{RealtimeError, Result};
use crate::types::{EventType, TableKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// A row change as delivered to subscriber callbacks.
///
/// This is the inner payload only; the outer envelope is never exposed to
/// subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(rename = "type")]
    pub event: EventType,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

/// Outbound control messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Join a table channel for the given change events.
    Join {
        key: TableKey,
        events: BTreeSet<EventType>,
    },
    /// Leave a table channel.
    Leave { key: TableKey },
    /// Liveness signal on the control topic.
    Heartbeat,
}

impl ControlMessage {
    pub fn to_envelope(&self, protocol: &ProtocolConfig, reference: Ref) -> Envelope {
        match self {
            ControlMessage::Join { key, events } => {
                let changes: Vec<Value> = events
                    .iter()
                    .map(|event| {
                        json!({
                            "event": event.as_str(),
                            "schema": key.schema(),
                            "table": key.table(),
                        })
                    })
                    .collect();
                let mut config = serde_json::Map::new();
                config.insert(protocol.changes_key.clone(), Value::Array(changes));
                Envelope::new(
                    key.topic(&protocol.topic_prefix),
                    protocol.join_event(),
                    Some(reference),
                    json!({ "config": config }),
                )
            }
            ControlMessage::Leave { key } => Envelope::new(
                key.topic(&protocol.topic_prefix),
                protocol.leave_event(),
                Some(reference),
                json!({}),
            ),
            ControlMessage::Heartbeat => Envelope::new(
                protocol.control_topic.clone(),
                protocol.heartbeat_event(),
                Some(reference),
                json!({}),
            ),
        }
    }

    /// Recognise an outbound control frame. Returns `None` for anything
    /// else; used when inspecting recorded traffic.
    pub fn from_envelope(envelope: &Envelope, protocol: &ProtocolConfig) -> Option<Self> {
        if envelope.event == protocol.heartbeat_event() && envelope.topic == protocol.control_topic {
            return Some(ControlMessage::Heartbeat);
        }
        let key = TableKey::from_topic(&protocol.topic_prefix, &envelope.topic)?;
        if envelope.event == protocol.leave_event() {
            return Some(ControlMessage::Leave { key });
        }
        if envelope.event != protocol.join_event() {
            return None;
        }
        let events = envelope
            .payload
            .get("config")?
            .get(&protocol.changes_key)?
            .as_array()?
            .iter()
            .filter_map(|change| change.get("event")?.as_str()?.parse().ok())
            .collect();
        Some(ControlMessage::Join { key, events })
    }
}

/// Inbound frames, decoded into a closed set of kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// A row change on a joined table.
    Change { key: TableKey, change: ChangePayload },
    /// Acknowledgement of a join, leave or heartbeat.
    Reply {
        topic: String,
        reference: Option<Ref>,
        status: String,
    },
    /// The server reported a channel error.
    ChannelError { topic: String },
    /// The server closed a channel.
    ChannelClosed { topic: String },
    /// Anything else (presence, system notices, ...).
    Unknown { topic: String, event: String },
}

impl InboundMessage {
    pub fn decode(envelope: Envelope, protocol: &ProtocolConfig) -> Result<Self> {
        let event = envelope.event.as_str();
        if event == protocol.changes_key {
            return decode_change(envelope, protocol);
        }
        if event == protocol.reply_event() {
            let status = envelope
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let reference = envelope.reference();
            return Ok(InboundMessage::Reply {
                topic: envelope.topic,
                reference,
                status,
            });
        }
        if event == protocol.error_event() {
            return Ok(InboundMessage::ChannelError {
                topic: envelope.topic,
            });
        }
        if event == protocol.close_event() {
            return Ok(InboundMessage::ChannelClosed {
                topic: envelope.topic,
            });
        }
        Ok(InboundMessage::Unknown {
            topic: envelope.topic,
            event: envelope.event,
        })
    }
}

fn decode_change(envelope: Envelope, protocol: &ProtocolConfig) -> Result<InboundMessage> {
    let Envelope { topic, payload, .. } = envelope;
    let data = match payload {
        Value::Object(mut map) => match map.remove("data") {
            Some(data) => data,
            None if map.contains_key("type") => Value::Object(map),
            None => {
                return Err(RealtimeError::Protocol(format!(
                    "change on {topic} carries no data"
                )))
            }
        },
        other => {
            return Err(RealtimeError::Protocol(format!(
                "change on {topic} has non-object payload: {other}"
            )))
        }
    };
    let change: ChangePayload = serde_json::from_value(data)
        .map_err(|e| RealtimeError::Protocol(format!("bad change on {topic}: {e}")))?;
    let key = match TableKey::from_topic(&protocol.topic_prefix, &topic) {
        Some(key) => key,
        None => TableKey::new(change.schema.clone(), change.table.clone())
            .map_err(|e| RealtimeError::Protocol(e.to_string()))?,
    };
    Ok(InboundMessage::Change { key, change })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableKey {
        TableKey::new("public", "users").unwrap()
    }

    #[test]
    fn test_join_envelope_carries_every_event() {
        let protocol = ProtocolConfig::default();
        let message = ControlMessage::Join {
            key: users(),
            events: [EventType::Update, EventType::Insert].into_iter().collect(),
        };
        let envelope = message.to_envelope(&protocol, Ref(3));

        assert_eq!(envelope.topic, "realtime:public:users");
        assert_eq!(envelope.event, "phx_join");
        assert_eq!(envelope.reference.as_deref(), Some("3"));
        assert_eq!(
            envelope.payload,
            json!({"config": {"postgres_changes": [
                {"event": "INSERT", "schema": "public", "table": "users"},
                {"event": "UPDATE", "schema": "public", "table": "users"},
            ]}})
        );
        assert_eq!(ControlMessage::from_envelope(&envelope, &protocol), Some(message));
    }

    #[test]
    fn test_leave_and_heartbeat_envelopes() {
        let protocol = ProtocolConfig::default();

        let leave = ControlMessage::Leave { key: users() }.to_envelope(&protocol, Ref(4));
        assert_eq!(leave.event, "phx_leave");
        assert_eq!(leave.payload, json!({}));

        let heartbeat = ControlMessage::Heartbeat.to_envelope(&protocol, Ref(5));
        assert_eq!(heartbeat.topic, "phoenix");
        assert_eq!(heartbeat.event, "heartbeat");
        assert_eq!(
            ControlMessage::from_envelope(&heartbeat, &protocol),
            Some(ControlMessage::Heartbeat)
        );
    }

    #[test]
    fn test_decode_nested_change() {
        let protocol = ProtocolConfig::default();
        let envelope = Envelope::decode(
            r#"{"topic":"realtime:public:users","event":"postgres_changes","ref":null,
                "payload":{"ids":[1],"data":{"type":"UPDATE","schema":"public","table":"users",
                "record":{"id":1,"name":"b"},"old_record":{"id":1},
                "commit_timestamp":"2024-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        match InboundMessage::decode(envelope, &protocol).unwrap() {
            InboundMessage::Change { key, change } => {
                assert_eq!(key, users());
                assert_eq!(change.event, EventType::Update);
                assert_eq!(change.record, Some(json!({"id": 1, "name": "b"})));
                assert_eq!(change.old_record, Some(json!({"id": 1})));
                assert_eq!(change.commit_timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
            }
            other => panic!("Expected Change, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_flat_change_payload() {
        let protocol = ProtocolConfig::default();
        let envelope = Envelope::new(
            "realtime:public:users",
            "postgres_changes",
            None,
            json!({"type": "DELETE", "schema": "public", "table": "users", "old_record": {"id": 9}}),
        );
        let message = InboundMessage::decode(envelope, &protocol).unwrap();
        assert!(matches!(
            message,
            InboundMessage::Change { change: ChangePayload { event: EventType::Delete, .. }, .. }
        ));
    }

    #[test]
    fn test_decode_change_errors_are_protocol_errors() {
        let protocol = ProtocolConfig::default();
        let cases = [
            json!({"ids": [1]}),
            json!({"data": {"type": "TRUNCATE", "schema": "public", "table": "users"}}),
            json!("not an object"),
        ];
        for payload in cases {
            let envelope = Envelope::new("realtime:public:users", "postgres_changes", None, payload);
            assert!(matches!(
                InboundMessage::decode(envelope, &protocol),
                Err(RealtimeError::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_decode_control_replies() {
        let protocol = ProtocolConfig::default();

        let reply = Envelope::new(
            "realtime:public:users",
            "phx_reply",
            Some(Ref(12)),
            json!({"status": "ok", "response": {}}),
        );
        assert_eq!(
            InboundMessage::decode(reply, &protocol).unwrap(),
            InboundMessage::Reply {
                topic: "realtime:public:users".to_string(),
                reference: Some(Ref(12)),
                status: "ok".to_string(),
            }
        );

        let error = Envelope::new("realtime:public:users", "phx_error", None, json!({}));
        assert!(matches!(
            InboundMessage::decode(error, &protocol).unwrap(),
            InboundMessage::ChannelError { .. }
        ));

        let presence = Envelope::new("realtime:public:users", "presence_state", None, json!({}));
        assert!(matches!(
            InboundMessage::decode(presence, &protocol).unwrap(),
            InboundMessage::Unknown { .. }
        ));
    }
}
