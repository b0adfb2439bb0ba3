//! Entries: captured code changes and prompt/response pairs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::json;

/// Where an entry came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Filewatcher,
    Mcp,
    Import,
    #[default]
    #[serde(other)]
    Manual,
}

impl EntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filewatcher => "filewatcher",
            Self::Mcp => "mcp",
            Self::Import => "import",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "filewatcher" => Self::Filewatcher,
            "mcp" => Self::Mcp,
            "import" => Self::Import,
            _ => Self::Manual,
        }
    }
}

/// A captured code change, optionally attributed to a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entry {
    /// Empty until persisted; the store assigns a UUID when absent
    pub id: String,
    pub session_id: Option<String>,
    pub workspace_path: Option<String>,
    pub file_path: Option<String>,
    pub source: EntrySource,
    pub before_code: Option<String>,
    pub after_code: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "json::container")]
    pub tags: Vec<String>,
    /// Set at most once, by attribution or by the importer
    #[serde(deserialize_with = "json::int_opt")]
    pub prompt_id: Option<i64>,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    pub model_info: Option<Value>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            id: String::new(),
            session_id: None,
            workspace_path: None,
            file_path: None,
            source: EntrySource::default(),
            before_code: None,
            after_code: None,
            notes: None,
            timestamp: json::now(),
            tags: Vec::new(),
            prompt_id: None,
            entry_type: None,
            model_info: None,
        }
    }
}

impl Entry {
    /// New code-change entry for a file, timestamped now
    pub fn code_change(
        file_path: impl Into<String>,
        before: impl Into<String>,
        after: impl Into<String>,
        source: EntrySource,
    ) -> Self {
        Self {
            file_path: Some(file_path.into()),
            before_code: Some(before.into()),
            after_code: Some(after.into()),
            source,
            entry_type: Some("code_change".to_string()),
            ..Self::default()
        }
    }

    /// Carries a diff, as opposed to a logged prompt/response pair
    pub fn is_code_change(&self) -> bool {
        self.entry_type.as_deref() != Some("prompt_response")
            && (self.before_code.is_some() || self.after_code.is_some())
    }
}

/// An entry joined with the prompt it is attributed to
#[derive(Debug, Clone, Serialize)]
pub struct EntryWithPrompt {
    #[serde(flatten)]
    pub entry: Entry,
    pub prompt: Option<super::Prompt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_reads_as_manual() {
        let e: Entry = serde_json::from_str(r#"{"source": "cursor-db"}"#).unwrap();
        assert_eq!(e.source, EntrySource::Manual);
        let e: Entry = serde_json::from_str(r#"{"source": "mcp"}"#).unwrap();
        assert_eq!(e.source, EntrySource::Mcp);
    }

    #[test]
    fn test_prompt_response_is_not_a_code_change() {
        let change = Entry::code_change("/w/a.py", "a", "b", EntrySource::Mcp);
        assert!(change.is_code_change());
        let logged = Entry {
            file_path: Some("/w/a.py".into()),
            after_code: Some("reply".into()),
            entry_type: Some("prompt_response".into()),
            ..Entry::default()
        };
        assert!(!logged.is_code_change());
        assert!(!Entry::default().is_code_change());
    }

    #[test]
    fn test_type_field_renamed() {
        let e: Entry = serde_json::from_str(r#"{"type": "prompt_response"}"#).unwrap();
        assert_eq!(e.entry_type.as_deref(), Some("prompt_response"));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "prompt_response");
    }
}
