//! Core types for the realtime connection pool.

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Row-change event type delivered by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Insert, EventType::Update, EventType::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(EventType::Insert),
            "UPDATE" => Ok(EventType::Update),
            "DELETE" => Ok(EventType::Delete),
            other => Err(RealtimeError::Configuration(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

/// A (schema, table) pair. Identifies exactly one upstream channel.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTableKey")]
pub struct TableKey {
    schema: String,
    table: String,
}

/// Unchecked serialized form; goes through [`TableKey::new`].
#[derive(Deserialize)]
struct RawTableKey {
    schema: String,
    table: String,
}

impl TryFrom<RawTableKey> for TableKey {
    type Error = RealtimeError;

    fn try_from(raw: RawTableKey) -> Result<Self> {
        TableKey::new(raw.schema, raw.table)
    }
}

impl TableKey {
    /// Create a validated key. Neither part may be empty or contain the
    /// topic delimiter `:`.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let table = table.into();
        validate_topic_part("schema", &schema)?;
        validate_topic_part("table", &table)?;
        Ok(Self { schema, table })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Channel topic for this table: `<prefix>:<schema>:<table>`.
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.schema, self.table)
    }

    /// Parse a channel topic back into a key. Returns `None` for topics
    /// outside `prefix` or with the wrong shape.
    pub fn from_topic(prefix: &str, topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix(prefix)?.strip_prefix(':')?;
        let (schema, table) = rest.split_once(':')?;
        TableKey::new(schema, table).ok()
    }
}

fn validate_topic_part(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RealtimeError::Configuration(format!("{what} must not be empty")));
    }
    if value.contains(':') {
        return Err(RealtimeError::Configuration(format!(
            "{what} must not contain ':' (got {value:?})"
        )));
    }
    Ok(())
}

impl fmt::Debug for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableKey({}.{})", self.schema, self.table)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Identifier of an independent logical subscriber.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        SubscriberId(s.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        SubscriberId(s)
    }
}

/// API credential for a backend instance. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Credential(secret.into())
    }

    /// The plain secret, for building the handshake request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(RealtimeError::Configuration(
                "credential must not be empty".to_string(),
            ));
        }
        if self.0.chars().any(char::is_whitespace) {
            return Err(RealtimeError::Configuration(
                "credential must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Credential::new(s)
    }
}

/// Everything needed to reach one backend instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Pool key. One managed connection exists per distinct name.
    pub name: String,
    /// Base HTTP(S) or WS(S) URL of the instance.
    pub base_url: String,
    pub credential: Credential,
}

impl InstanceDescriptor {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        credential: impl Into<Credential>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            credential: credential.into(),
        }
    }

    /// Check the descriptor before any connection attempt is made.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RealtimeError::Configuration(
                "instance name must not be empty".to_string(),
            ));
        }
        const SCHEMES: [&str; 4] = ["https://", "http://", "wss://", "ws://"];
        let host = SCHEMES
            .iter()
            .find_map(|scheme| self.base_url.strip_prefix(scheme));
        match host {
            Some(rest) if !rest.trim_matches('/').is_empty() => {}
            _ => {
                return Err(RealtimeError::Configuration(format!(
                    "invalid base URL for instance {}: {:?}",
                    self.name, self.base_url
                )))
            }
        }
        self.credential.validate()
    }
}

/// Wall-clock timestamp (milliseconds since the Unix epoch).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// Time elapsed since this timestamp (zero if it lies in the future).
    pub fn elapsed(&self) -> Duration {
        let delta = Timestamp::now().0.saturating_sub(self.0);
        Duration::from_millis(delta.max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parse_and_display() {
        assert_eq!("insert".parse::<EventType>().unwrap(), EventType::Insert);
        assert_eq!(" UPDATE ".parse::<EventType>().unwrap(), EventType::Update);
        assert_eq!(EventType::Delete.to_string(), "DELETE");
        assert!(matches!(
            "TRUNCATE".parse::<EventType>(),
            Err(RealtimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_table_key_deserialize_validates() {
        let key: TableKey =
            serde_json::from_value(serde_json::json!({"schema": "public", "table": "users"}))
                .unwrap();
        assert_eq!(key, TableKey::new("public", "users").unwrap());

        for bad in [
            serde_json::json!({"schema": "", "table": "users"}),
            serde_json::json!({"schema": "public", "table": "a:b"}),
            serde_json::json!({"schema": "pub:lic", "table": "users"}),
        ] {
            assert!(serde_json::from_value::<TableKey>(bad).is_err());
        }
    }

    #[test]
    fn test_event_type_serde_uses_wire_names() {
        let json = serde_json::to_string(&EventType::Insert).unwrap();
        assert_eq!(json, "\"INSERT\"");
        let parsed: EventType = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(parsed, EventType::Delete);
    }

    #[test]
    fn test_table_key_topic() {
        let key = TableKey::new("public", "users").unwrap();
        assert_eq!(key.topic("realtime"), "realtime:public:users");
        assert_eq!(
            TableKey::from_topic("realtime", "realtime:public:users"),
            Some(key)
        );
        assert_eq!(TableKey::from_topic("realtime", "phoenix"), None);
        assert_eq!(TableKey::from_topic("realtime", "realtime:public"), None);
        assert_eq!(TableKey::from_topic("realtime", "other:public:users"), None);
    }

    #[test]
    fn test_table_key_rejects_bad_parts() {
        assert!(TableKey::new("", "users").is_err());
        assert!(TableKey::new("public", "  ").is_err());
        assert!(TableKey::new("pub:lic", "users").is_err());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let descriptor = InstanceDescriptor::new("main", "https://db.example.com", "s3cret-key");
        let rendered = format!("{:?}", descriptor);
        assert!(!rendered.contains("s3cret-key"));
        assert!(rendered.contains("Credential(***)"));
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(InstanceDescriptor::new("main", "https://db.example.com", "key")
            .validate()
            .is_ok());
        assert!(InstanceDescriptor::new("main", "wss://db.example.com/", "key")
            .validate()
            .is_ok());

        let cases = [
            InstanceDescriptor::new("", "https://db.example.com", "key"),
            InstanceDescriptor::new("main", "db.example.com", "key"),
            InstanceDescriptor::new("main", "https://", "key"),
            InstanceDescriptor::new("main", "https://db.example.com", ""),
            InstanceDescriptor::new("main", "https://db.example.com", "has space"),
        ];
        for descriptor in cases {
            assert!(
                matches!(descriptor.validate(), Err(RealtimeError::Configuration(_))),
                "expected configuration error for {:?}",
                descriptor
            );
        }
    }
}
