//! Message types for bus operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // ASCII alphanumeric plus separators used by subscription queues
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Validated topic name for pub/sub fan-out
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Create new topic name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "topic".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get topic name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages within the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

/// Opaque principal blob identifying the sender of a message.
///
/// The engine never interprets the contents; it only stores and forwards
/// them so receivers can perform their own authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity(#[serde(with = "bytes_serde")] Bytes);

impl SenderIdentity {
    /// Wrap an opaque principal blob
    pub fn new(blob: impl Into<Bytes>) -> Self {
        Self(blob.into())
    }

    /// An empty identity for anonymous senders
    pub fn anonymous() -> Self {
        Self(Bytes::new())
    }

    /// Get the raw principal bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Base64 form used by relational stores
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose, Engine as _};
        general_purpose::STANDARD.encode(&self.0)
    }

    /// Decode the base64 form used by relational stores
    pub fn from_base64(encoded: &str) -> Result<Self, ValidationError> {
        use base64::{engine::general_purpose, Engine as _};
        let decoded =
            general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| ValidationError::InvalidFormat {
                    field: "sender".to_string(),
                    message: e.to_string(),
                })?;
        Ok(Self(Bytes::from(decoded)))
    }
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Header name reserved for the unique message identifier
pub const HEADER_MESSAGE_ID: &str = "Message-Id";
/// Header name reserved for the destination queue or topic
pub const HEADER_DESTINATION: &str = "Destination";
/// Header name reserved for correlating replies with their request
pub const HEADER_CORRELATION_ID: &str = "Correlation-Id";

/// Ordered multimap of header name to string value.
///
/// Names compare case-insensitively but keep their first-seen spelling.
/// Values may span multiple lines; in the wire form continuation lines are
/// indicated by leading whitespace and folded back with `\n` on parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing values for the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for a name with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Get the first value for a name, if any
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a name in insertion order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Remove all values for a name
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Check whether a name is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of header entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Render the wire form: `Name: value` lines, with multi-line values
    /// continued on lines starting with a tab.
    pub fn to_wire_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            let mut lines = value.split('\n');
            let first = lines.next().unwrap_or("");
            let _ = writeln!(out, "{}: {}", name, first);
            for continuation in lines {
                let _ = writeln!(out, "\t{}", continuation);
            }
        }
        out
    }

    /// Parse the wire form produced by [`HeaderMap::to_wire_string`].
    ///
    /// Lines starting with whitespace continue the previous header's value.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let mut map = Self::new();
        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let (_, value) = map.entries.last_mut().ok_or_else(|| {
                    ValidationError::InvalidFormat {
                        field: "headers".to_string(),
                        message: "continuation line without a preceding header".to_string(),
                    }
                })?;
                value.push('\n');
                value.push_str(line.trim_start());
                continue;
            }
            let (name, value) =
                line.split_once(':')
                    .ok_or_else(|| ValidationError::InvalidFormat {
                        field: "headers".to_string(),
                        message: format!("malformed header line: {line}"),
                    })?;
            map.append(name.trim(), value.trim_start());
        }
        Ok(map)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// An application message: headers plus an opaque content body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub headers: HeaderMap,
    pub content: String,
}

impl Message {
    /// Create new message with content
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            headers: HeaderMap::new(),
            content: content.into(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the destination header
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.headers.set(HEADER_DESTINATION, destination);
        self
    }

    /// Set the correlation header for reply tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.headers.set(HEADER_CORRELATION_ID, correlation_id);
        self
    }

    /// Get the message id header, if present
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(HEADER_MESSAGE_ID)
    }

    /// Get the destination header, if present
    pub fn destination(&self) -> Option<&str> {
        self.headers.get(HEADER_DESTINATION)
    }

    /// Get the correlation header, if present
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(HEADER_CORRELATION_ID)
    }

    /// Start a reply to this message: a fresh message whose correlation
    /// header carries this message's id.
    pub fn reply_template(&self) -> Message {
        let mut reply = Message::default();
        if let Some(id) = self.message_id() {
            reply.headers.set(HEADER_CORRELATION_ID, id);
        }
        reply
    }
}

// ============================================================================
// Queued Messages
// ============================================================================

/// Delivery status of a queued message.
///
/// Exactly one status holds at any time; a message is never both
/// acknowledged and abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Awaiting a successful delivery
    Pending,
    /// Delivered and acknowledged by a handler
    Acknowledged,
    /// Dead-lettered after exhausting delivery attempts
    Abandoned,
}

/// A message on a queue together with its delivery metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub message: Message,
    pub sender: SenderIdentity,
    pub attempt_count: u32,
    pub enqueued_at: Timestamp,
    pub acknowledged_at: Option<Timestamp>,
    pub abandoned_at: Option<Timestamp>,
}

impl QueuedMessage {
    /// Wrap a message for queueing.
    ///
    /// Takes the id from the `Message-Id` header when present, otherwise
    /// generates one and stamps it onto the headers. Attempt count starts
    /// at zero.
    pub fn new(mut message: Message, sender: SenderIdentity) -> Self {
        let id = match message.message_id() {
            Some(existing) => MessageId::from_str(existing).unwrap_or_default(),
            None => {
                let id = MessageId::new();
                message.headers.set(HEADER_MESSAGE_ID, id.as_str());
                id
            }
        };

        Self {
            id,
            message,
            sender,
            attempt_count: 0,
            enqueued_at: Timestamp::now(),
            acknowledged_at: None,
            abandoned_at: None,
        }
    }

    /// Derive the current status from the terminal timestamps
    pub fn status(&self) -> MessageStatus {
        match (self.acknowledged_at, self.abandoned_at) {
            (Some(_), _) => MessageStatus::Acknowledged,
            (None, Some(_)) => MessageStatus::Abandoned,
            (None, None) => MessageStatus::Pending,
        }
    }

    /// Record a successful delivery. No-op if already abandoned.
    pub fn mark_acknowledged(&mut self, at: Timestamp) {
        if self.abandoned_at.is_none() {
            self.acknowledged_at = Some(at);
        }
    }

    /// Record terminal failure. No-op if already acknowledged.
    pub fn mark_abandoned(&mut self, at: Timestamp) {
        if self.acknowledged_at.is_none() {
            self.abandoned_at = Some(at);
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
