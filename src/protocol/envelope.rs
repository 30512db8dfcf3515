//! The JSON frame envelope and connection-scoped refs.

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// One frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    /// Decimal ref as a string. Inbound broadcasts carry `null`.
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Envelope {
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        reference: Option<Ref>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            reference: reference.map(|r| r.to_string()),
            payload,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame. Anything that is not an envelope is a
    /// protocol error.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| RealtimeError::Protocol(format!("malformed envelope: {e}")))
    }

    /// The numeric ref, if present and well formed.
    pub fn reference(&self) -> Option<Ref> {
        self.reference.as_deref()?.parse().ok().map(Ref)
    }
}

/// Correlation id attached to outbound control messages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref(pub u64);

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.0)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic ref source. One counter lives as long as its managed
/// connection, so refs are never reused across reconnects.
#[derive(Debug)]
pub struct RefCounter {
    next: AtomicU64,
}

impl RefCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Ref {
        Ref(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RefCounter {
    fn default() -> Self {
        Self::new()
    }
}
