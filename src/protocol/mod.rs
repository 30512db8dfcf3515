//! Channel protocol spoken over the realtime socket.
//!
//! Every frame is a JSON envelope `{topic, event, ref, payload}`. Outbound
//! control traffic is limited to three verbs:
//! - join a table channel with the set of requested change events
//! - leave a table channel
//! - heartbeat on the reserved control topic
//!
//! Inbound frames are decoded once, at this boundary, into a closed set of
//! message kinds ([`InboundMessage`]); the rest of the crate matches on
//! variants instead of comparing event strings.

mod envelope;
mod message;

pub use envelope::{Envelope, Ref, RefCounter};
pub use message::{ChangePayload, ControlMessage, InboundMessage};

/// Names used on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Prefix of table topics (`<prefix>:<schema>:<table>`).
    pub topic_prefix: String,

    /// Prefix of control verbs (`<prefix>_join`, `<prefix>_leave`, ...).
    pub control_prefix: String,

    /// Reserved topic used for heartbeats.
    pub control_topic: String,

    /// Join config key and inbound change event name.
    pub changes_key: String,

    /// Websocket endpoint path appended to the instance base URL.
    pub endpoint_path: String,

    /// Protocol version sent as the `vsn` query parameter.
    pub version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "realtime".to_string(),
            control_prefix: "phx".to_string(),
            control_topic: "phoenix".to_string(),
            changes_key: "postgres_changes".to_string(),
            endpoint_path: "/realtime/v1/websocket".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

impl ProtocolConfig {
    pub fn join_event(&self) -> String {
        format!("{}_join", self.control_prefix)
    }

    pub fn leave_event(&self) -> String {
        format!("{}_leave", self.control_prefix)
    }

    pub fn reply_event(&self) -> String {
        format!("{}_reply", self.control_prefix)
    }

    pub fn error_event(&self) -> String {
        format!("{}_error", self.control_prefix)
    }

    pub fn close_event(&self) -> String {
        format!("{}_close", self.control_prefix)
    }

    pub fn heartbeat_event(&self) -> &'static str {
        "heartbeat"
    }
}
