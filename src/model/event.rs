//! Typed activity observations
//!
//! `details` has a known shape for the event types the core emits itself.
//! Anything else (imported rows, unknown types) is kept as an opaque JSON
//! value so nothing is lost on a round trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::json;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    FileChange,
    CodeChange,
    PromptResponse,
    Activity,
    TerminalCommand,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FileChange => "file_change",
            Self::CodeChange => "code_change",
            Self::PromptResponse => "prompt_response",
            Self::Activity => "activity",
            Self::TerminalCommand => "terminal_command",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "file_change" => Self::FileChange,
            "code_change" => Self::CodeChange,
            "prompt_response" => Self::PromptResponse,
            "activity" => Self::Activity,
            "terminal_command" => Self::TerminalCommand,
            _ => Self::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d).map(Self::from)
    }
}

impl Default for EventType {
    fn default() -> Self {
        Self::Activity
    }
}

/// Diff statistics for one significant change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeStats {
    pub file_path: String,
    pub chars_added: i64,
    pub chars_removed: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    /// Absolute difference between new and old content length
    pub diff_size: i64,
    pub entry_id: Option<String>,
    pub prompt_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Add,
    #[default]
    Change,
    Unlink,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileChange {
    pub file_path: String,
    pub change: FileChangeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptResponse {
    pub file_path: Option<String>,
    pub prompt: String,
    pub response: String,
    pub entry_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRun {
    pub command: String,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
}

/// Event payload, shaped by `EventType`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventDetails {
    CodeChange(ChangeStats),
    FileChange(FileChange),
    PromptResponse(PromptResponse),
    TerminalCommand(CommandRun),
    Opaque(Value),
}

impl Default for EventDetails {
    fn default() -> Self {
        Self::Opaque(Value::Object(Default::default()))
    }
}

impl EventDetails {
    /// Interpret a raw JSON value according to the event type. A value that
    /// does not fit the expected shape stays opaque.
    pub fn decode(event_type: &EventType, value: Value) -> Self {
        fn typed<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
            serde_json::from_value(value.clone()).ok()
        }
        let value = match value {
            // Older rows carry details as a string-encoded object
            Value::String(s) => json::decode_blob(Some(&s)).unwrap_or(Value::Null),
            other => other,
        };
        let decoded = match event_type {
            EventType::CodeChange => typed(&value).map(Self::CodeChange),
            EventType::FileChange => typed(&value).map(Self::FileChange),
            EventType::PromptResponse => typed(&value).map(Self::PromptResponse),
            EventType::TerminalCommand => typed(&value).map(Self::TerminalCommand),
            _ => None,
        };
        match decoded {
            // Only type the value when no field would be dropped on the way back
            Some(d) if covers(&d.to_value(), &value) => d,
            _ => Self::Opaque(value),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// File path carried by the details, when the shape has one
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::CodeChange(c) => Some(c.file_path.as_str()),
            Self::FileChange(f) => Some(f.file_path.as_str()),
            Self::PromptResponse(p) => p.file_path.as_deref(),
            Self::Opaque(v) => v.get("file_path").and_then(Value::as_str),
            Self::TerminalCommand(_) => None,
        }
    }
}

fn covers(typed: &Value, original: &Value) -> bool {
    match (typed, original) {
        (Value::Object(t), Value::Object(o)) => o.iter().all(|(k, v)| t.get(k) == Some(v)),
        _ => false,
    }
}

/// A typed activity observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EventRecord")]
pub struct Event {
    pub id: String,
    pub session_id: Option<String>,
    pub workspace_path: Option<String>,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub details: EventDetails,
    pub annotation: Option<String>,
    pub ai_generated: bool,
    pub tags: Vec<String>,
    pub intent: Option<String>,
    pub source: Option<String>,
    pub file_path: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, details: EventDetails) -> Self {
        let file_path = details.file_path().map(str::to_string);
        Self {
            id: String::new(),
            session_id: None,
            workspace_path: None,
            timestamp: json::now(),
            event_type,
            details,
            annotation: None,
            ai_generated: false,
            tags: Vec::new(),
            intent: None,
            source: None,
            file_path,
        }
    }

    /// Point the details at the entry (and prompt) this event describes
    pub fn set_link(&mut self, entry_id: &str, prompt_id: Option<i64>) {
        match &mut self.details {
            EventDetails::CodeChange(stats) => {
                stats.entry_id = Some(entry_id.to_string());
                stats.prompt_id = prompt_id;
            }
            EventDetails::PromptResponse(pr) => pr.entry_id = Some(entry_id.to_string()),
            _ => {}
        }
    }

    /// Effective file path: the column, else whatever the details carry
    pub fn path(&self) -> Option<&str> {
        self.file_path.as_deref().or_else(|| self.details.file_path())
    }
}

/// Wire and column shape of an event before `details` is typed
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventRecord {
    id: String,
    session_id: Option<String>,
    workspace_path: Option<String>,
    #[serde(with = "json::timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    event_type: EventType,
    details: Value,
    annotation: Option<String>,
    #[serde(deserialize_with = "json::flag")]
    ai_generated: bool,
    #[serde(deserialize_with = "json::container")]
    tags: Vec<String>,
    intent: Option<String>,
    source: Option<String>,
    file_path: Option<String>,
}

impl From<EventRecord> for Event {
    fn from(r: EventRecord) -> Self {
        let details = EventDetails::decode(&r.event_type, r.details);
        Self {
            id: r.id,
            session_id: r.session_id,
            workspace_path: r.workspace_path,
            timestamp: r.timestamp,
            event_type: r.event_type,
            details,
            annotation: r.annotation,
            ai_generated: r.ai_generated,
            tags: r.tags,
            intent: r.intent,
            source: r.source,
            file_path: r.file_path,
        }
    }
}
