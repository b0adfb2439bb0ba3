//! Typed edges between files
//!
//! ```text
//! EDIT_SEQUENCE     a.py ──→ b.py        consecutive edits ≤ 5 min apart
//! MODEL_CONTEXT     ctx.py ──→ target.py file was in context for the change
//! TOOL_INTERACTION  (external) ──→ a.py  a terminal command named the file
//! IMPORT            a.ts ──→ b.ts        relative import that resolves
//! ```
//!
//! Edges with the same (type, source, target) are merged and their weight
//! counts occurrences.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::model::{json as jsonfmt, ContextSnapshot, Entry, Prompt, TerminalCommand};

pub const EDIT_SEQUENCE_GAP_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    EditSequence,
    ModelContext,
    ToolInteraction,
    Import,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EditSequence => "EDIT_SEQUENCE",
            Self::ModelContext => "MODEL_CONTEXT",
            Self::ToolInteraction => "TOOL_INTERACTION",
            Self::Import => "IMPORT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileGraphEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    /// `None` for an external source (terminal)
    pub source: Option<String>,
    pub target: String,
    pub weight: u32,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub id: String,
    pub name: String,
    pub changes: u32,
    pub workspace_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileGraph {
    pub nodes: Vec<FileNode>,
    pub edges: Vec<FileGraphEdge>,
}

impl FileGraph {
    pub fn edges_of(&self, edge_type: EdgeType) -> impl Iterator<Item = &FileGraphEdge> {
        self.edges.iter().filter(move |e| e.edge_type == edge_type)
    }
}

/// Rows the graph is derived from
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphInput<'a> {
    pub entries: &'a [Entry],
    pub prompts: &'a [Prompt],
    pub snapshots: &'a [ContextSnapshot],
    pub commands: &'a [TerminalCommand],
}

type EdgeKey = (EdgeType, Option<String>, String);

#[derive(Default)]
struct EdgeSet {
    edges: BTreeMap<EdgeKey, (u32, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl EdgeSet {
    fn add(&mut self, edge_type: EdgeType, source: Option<&str>, target: &str, at: Option<DateTime<Utc>>) {
        if source == Some(target) {
            return;
        }
        let slot = self
            .edges
            .entry((edge_type, source.map(str::to_string), target.to_string()))
            .or_insert((0, at, at));
        slot.0 += 1;
        if let Some(at) = at {
            slot.1 = Some(slot.1.map_or(at, |f| f.min(at)));
            slot.2 = Some(slot.2.map_or(at, |l| l.max(at)));
        }
    }

    fn finish(self) -> Vec<FileGraphEdge> {
        self.edges
            .into_iter()
            .map(|((edge_type, source, target), (weight, first, last))| {
                let mut metadata = Map::new();
                if let Some(first) = first {
                    metadata.insert("first_at".into(), json!(jsonfmt::format_ts(&first)));
                }
                if let Some(last) = last {
                    metadata.insert("last_at".into(), json!(jsonfmt::format_ts(&last)));
                }
                FileGraphEdge {
                    id: format!(
                        "{}:{}->{}",
                        edge_type.as_str(),
                        source.as_deref().unwrap_or("external"),
                        target
                    ),
                    edge_type,
                    source,
                    target,
                    weight,
                    metadata,
                }
            })
            .collect()
    }
}

pub fn build(input: GraphInput<'_>) -> FileGraph {
    let mut edges = EdgeSet::default();
    let mut nodes: BTreeMap<String, FileNode> = BTreeMap::new();

    let mut diffs: Vec<&Entry> = input
        .entries
        .iter()
        .filter(|e| e.is_code_change())
        .filter(|e| e.file_path.as_deref().is_some_and(|p| !p.is_empty()))
        .collect();
    diffs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    for entry in &diffs {
        let path = entry.file_path.as_deref().unwrap_or_default();
        let node = nodes.entry(path.to_string()).or_insert_with(|| FileNode {
            id: path.to_string(),
            name: file_name(path).to_string(),
            changes: 0,
            workspace_path: entry.workspace_path.clone(),
        });
        node.changes += 1;
    }

    edit_sequence(&diffs, &mut edges);
    model_context(&input, &mut edges);
    tool_interaction(&diffs, input.commands, &mut edges);
    imports(&diffs, &nodes, &mut edges);

    // Endpoints that only appear in edges (context files never edited)
    let mut graph = FileGraph {
        nodes: Vec::new(),
        edges: edges.finish(),
    };
    for edge in &graph.edges {
        for path in edge.source.iter().chain(std::iter::once(&edge.target)) {
            nodes.entry(path.clone()).or_insert_with(|| FileNode {
                id: path.clone(),
                name: file_name(path).to_string(),
                changes: 0,
                workspace_path: None,
            });
        }
    }
    graph.nodes = nodes.into_values().collect();
    graph
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn edit_sequence(diffs: &[&Entry], edges: &mut EdgeSet) {
    let max_gap = TimeDelta::seconds(EDIT_SEQUENCE_GAP_SECS);
    for pair in diffs.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let (Some(fa), Some(fb)) = (a.file_path.as_deref(), b.file_path.as_deref()) else {
            continue;
        };
        if fa != fb && b.timestamp - a.timestamp <= max_gap {
            edges.add(EdgeType::EditSequence, Some(fa), fb, Some(b.timestamp));
        }
    }
}

fn model_context(input: &GraphInput<'_>, edges: &mut EdgeSet) {
    for snap in input.snapshots {
        let Some(target) = snap.target_file.as_deref() else {
            continue;
        };
        for ctx in &snap.context_files {
            edges.add(EdgeType::ModelContext, Some(ctx), target, Some(snap.timestamp));
        }
    }
    // Linked prompts: their context files fed the change they were attributed to
    let by_id: HashMap<&str, &Entry> = input.entries.iter().map(|e| (e.id.as_str(), e)).collect();
    for prompt in input.prompts {
        let Some(entry) = prompt.linked_entry_id.as_deref().and_then(|id| by_id.get(id)) else {
            continue;
        };
        let Some(target) = entry.file_path.as_deref() else {
            continue;
        };
        for ctx in &prompt.context_files {
            edges.add(EdgeType::ModelContext, Some(ctx), target, Some(prompt.timestamp));
        }
    }
}

fn tool_interaction(diffs: &[&Entry], commands: &[TerminalCommand], edges: &mut EdgeSet) {
    // Each known file with the spellings a command might use for it
    let mut known: Vec<(String, Vec<String>)> = Vec::new();
    let mut seen = HashSet::new();
    for entry in diffs {
        let Some(path) = entry.file_path.as_deref() else { continue };
        if !seen.insert(path) {
            continue;
        }
        let mut spellings = vec![path.to_string()];
        if let Some(ws) = entry.workspace_path.as_deref() {
            if let Some(rel) = path.strip_prefix(ws).map(|r| r.trim_start_matches('/')) {
                if !rel.is_empty() {
                    spellings.push(rel.to_string());
                }
            }
        }
        known.push((path.to_string(), spellings));
    }
    for cmd in commands {
        for (path, spellings) in &known {
            if spellings.iter().any(|s| mentions(&cmd.command, s)) {
                edges.add(EdgeType::ToolInteraction, None, path, Some(cmd.timestamp));
            }
        }
    }
}

/// `needle` appears in `command` as a whole token, optionally behind `./`
fn mentions(command: &str, needle: &str) -> bool {
    let boundary = |c: Option<char>| {
        c.map_or(true, |c| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '=' | ':' | ';' | '(' | ')' | '<' | '>')
        })
    };
    command.match_indices(needle).any(|(i, _)| {
        let head = &command[..i];
        let head = head.strip_suffix("./").unwrap_or(head);
        boundary(head.chars().next_back()) && boundary(command[i + needle.len()..].chars().next())
    })
}

fn import_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // import x from './y'  /  export * from '../y'  /  import './y'
            r#"(?m)(?:import|export)\s+(?:[^'"]*?\s+from\s+)?['"](\.{1,2}/[^'"]+)['"]"#,
            // require('./y')  /  import('./y')
            r#"(?:require|import)\s*\(\s*['"](\.{1,2}/[^'"]+)['"]\s*\)"#,
            // from .y import z  /  from ..pkg.y import z
            r"(?m)^\s*from\s+(\.+[A-Za-z_][\w.]*)\s+import\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Relative import specifiers in `code`, as paths relative to the importer's directory
pub fn relative_imports(code: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for re in import_patterns() {
        for cap in re.captures_iter(code) {
            let Some(module) = cap.get(1).map(|m| m.as_str()) else { continue };
            if module.starts_with("./") || module.starts_with("../") {
                out.push(PathBuf::from(module));
            } else {
                // Python: one leading dot is this package, each extra dot goes up
                let dots = module.chars().take_while(|c| *c == '.').count();
                let mut path = PathBuf::new();
                for _ in 1..dots {
                    path.push("..");
                }
                for part in module[dots..].split('.') {
                    path.push(part);
                }
                out.push(path);
            }
        }
    }
    out
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn imports(diffs: &[&Entry], nodes: &BTreeMap<String, FileNode>, edges: &mut EdgeSet) {
    // (directory, stem) → known file
    let mut by_stem: HashMap<(PathBuf, String), &str> = HashMap::new();
    for path in nodes.keys() {
        let p = Path::new(path);
        if let (Some(dir), Some(stem)) = (p.parent(), p.file_stem()) {
            by_stem.insert((dir.to_path_buf(), stem.to_string_lossy().into_owned()), path);
        }
    }
    for entry in diffs {
        let (Some(importer), Some(code)) = (entry.file_path.as_deref(), entry.after_code.as_deref()) else {
            continue;
        };
        let Some(dir) = Path::new(importer).parent() else { continue };
        for module in relative_imports(code) {
            let resolved = normalize(&dir.join(&module));
            let (Some(rdir), Some(stem)) = (resolved.parent(), resolved.file_stem()) else {
                continue;
            };
            let key = (rdir.to_path_buf(), stem.to_string_lossy().into_owned());
            if let Some(target) = by_stem.get(&key) {
                edges.add(EdgeType::Import, Some(importer), target, Some(entry.timestamp));
            }
        }
    }
}
