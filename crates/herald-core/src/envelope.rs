//! Outbound frame shape and queued messages.
//!
//! Every frame is a JSON object with a `type`, a `timestamp` (UTC, RFC 3339
//! with millisecond precision), and type-specific fields flattened next to
//! them:
//!
//! ```json
//! {"type":"task_progress","timestamp":"2026-01-01T00:00:00.000Z","taskId":"t1","percent":42}
//! ```
//!
//! A `batch` frame carries `messages`, an ordered list of envelopes in the
//! same shape. Only the outer frame has `type: "batch"`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::scope::Target;

/// Frame type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Liveness frame sent by the heartbeat monitor.
    Heartbeat,
    /// Background job progress tick.
    TaskProgress,
    /// Project lifecycle change.
    ProjectUpdate,
    /// Free-form message to a user.
    UserMessage,
    /// Server-side error notice.
    Error,
    /// Asks the client to reconnect (sent on shutdown).
    Reconnect,
    /// Wrapper around several envelopes for one target.
    Batch,
}

impl MessageType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::TaskProgress => "task_progress",
            Self::ProjectUpdate => "project_update",
            Self::UserMessage => "user_message",
            Self::Error => "error",
            Self::Reconnect => "reconnect",
            Self::Batch => "batch",
        }
    }
}

/// Format a timestamp the way every frame carries it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn serialize_timestamp<S: Serializer>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
        None => serializer.serialize_none(),
    }
}

/// One outbound frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Delivery timestamp, stamped by the broadcaster.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    /// Type-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Empty envelope of the given type.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            timestamp: None,
            fields: Map::new(),
        }
    }

    /// Add a field. `type` and `timestamp` are reserved and ignored.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" && key != "timestamp" {
            let _ = self.fields.insert(key, value.into());
        }
        self
    }

    /// Set the timestamp, replacing any previous one.
    #[must_use]
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat)
    }

    /// Job progress tick.
    pub fn task_progress(task_id: impl Into<String>, percent: u8, status: impl Into<String>) -> Self {
        Self::new(MessageType::TaskProgress)
            .with("taskId", task_id.into())
            .with("percent", percent.min(100))
            .with("status", status.into())
    }

    /// Project lifecycle event.
    pub fn project_update(project_id: impl Into<String>, event: impl Into<String>) -> Self {
        Self::new(MessageType::ProjectUpdate)
            .with("projectId", project_id.into())
            .with("event", event.into())
    }

    /// Free-form user message.
    pub fn user_message(text: impl Into<String>) -> Self {
        Self::new(MessageType::UserMessage).with("message", text.into())
    }

    /// Error notice with a machine-readable code.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(MessageType::Error)
            .with("code", code.into())
            .with("message", message.into())
    }

    /// Reconnect request.
    pub fn reconnect(reason: impl Into<String>) -> Self {
        Self::new(MessageType::Reconnect).with("reason", reason.into())
    }

    /// Wrap several envelopes into one `batch` frame, preserving order.
    pub fn batch(items: Vec<Envelope>) -> Self {
        let messages = items.into_iter().map(Envelope::into_value).collect();
        Self::new(MessageType::Batch).with("messages", Value::Array(messages))
    }

    /// Number of items carried by a `batch` frame (1 for any other frame).
    pub fn item_count(&self) -> usize {
        match (self.kind, self.fields.get("messages")) {
            (MessageType::Batch, Some(Value::Array(items))) => items.len(),
            _ => 1,
        }
    }

    /// Convert to a JSON object.
    pub fn into_value(self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        let _ = map.insert("type".into(), Value::String(self.kind.as_str().into()));
        if let Some(ts) = self.timestamp {
            let _ = map.insert("timestamp".into(), Value::String(format_timestamp(&ts)));
        }
        map.extend(self.fields);
        Value::Object(map)
    }

    /// Encode as wire text.
    pub fn encode(&self) -> String {
        self.clone().into_value().to_string()
    }
}

/// A message waiting in the intake queue.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Where the message goes.
    pub target: Target,
    /// The frame to deliver.
    pub envelope: Envelope,
    /// When the producer handed it over.
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    /// New message stamped with the current time.
    pub fn new(target: Target, envelope: Envelope) -> Self {
        Self {
            target,
            envelope,
            enqueued_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
