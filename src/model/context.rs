//! Editor-state rows: context snapshots, workspaces, and the abstraction-tier
//! rows (motifs, rung 2 edit scripts) that downstream views compute and the
//! core only persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::json;

/// Which files were in the model's context at a given moment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSnapshot {
    pub id: String,
    #[serde(deserialize_with = "json::int_opt")]
    pub prompt_id: Option<i64>,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    pub workspace_path: Option<String>,
    /// File the prompt's change landed in, when known
    pub target_file: Option<String>,
    #[serde(deserialize_with = "json::container")]
    pub context_files: Vec<String>,
    pub file_count: i64,
    pub context_usage: Option<f64>,
    #[serde(deserialize_with = "json::container")]
    pub metadata: Map<String, Value>,
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self {
            id: String::new(),
            prompt_id: None,
            timestamp: json::now(),
            workspace_path: None,
            target_file: None,
            context_files: Vec::new(),
            file_count: 0,
            context_usage: None,
            metadata: Map::new(),
        }
    }
}

/// A top-level directory treated as one project; keyed by path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workspace {
    pub path: String,
    pub name: Option<String>,
    #[serde(with = "json::timestamp")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "json::timestamp")]
    pub last_seen: DateTime<Utc>,
    pub entry_count: i64,
    pub prompt_count: i64,
    #[serde(deserialize_with = "json::container")]
    pub metadata: Map<String, Value>,
}

impl Default for Workspace {
    fn default() -> Self {
        let now = json::now();
        Self {
            path: String::new(),
            name: None,
            first_seen: now,
            last_seen: now,
            entry_count: 0,
            prompt_count: 0,
            metadata: Map::new(),
        }
    }
}

impl Workspace {
    pub fn for_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Self {
            path,
            name,
            ..Self::default()
        }
    }
}

/// A recurring edit pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Motif {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub rung: Option<String>,
    pub occurrences: i64,
    #[serde(deserialize_with = "json::container")]
    pub pattern: Vec<Value>,
    #[serde(deserialize_with = "json::container")]
    pub metadata: Map<String, Value>,
    #[serde(with = "json::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Default for Motif {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: None,
            rung: None,
            occurrences: 0,
            pattern: Vec::new(),
            metadata: Map::new(),
            created_at: json::now(),
        }
    }
}

/// Statement-level edit operations derived from one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rung2EditScript {
    pub id: String,
    pub entry_id: Option<String>,
    pub file_path: Option<String>,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "json::container")]
    pub operations: Vec<Value>,
    #[serde(deserialize_with = "json::container")]
    pub metadata: Map<String, Value>,
}

impl Default for Rung2EditScript {
    fn default() -> Self {
        Self {
            id: String::new(),
            entry_id: None,
            file_path: None,
            timestamp: json::now(),
            operations: Vec::new(),
            metadata: Map::new(),
        }
    }
}
