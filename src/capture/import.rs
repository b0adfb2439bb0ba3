//! Database import with id-collision strategies
//!
//! Accepts the export shape (`{metadata, entries, prompts, …}`) or the backup
//! file shape (`{metadata, data: {entries, prompts, events}, stats}`). The
//! whole import runs in one transaction: a database error rolls everything
//! back, while a row that does not decode is counted under `errors` and
//! skipped.
//!
//! | strategy    | id absent | id present                             |
//! |-------------|-----------|----------------------------------------|
//! | `skip`      | insert    | keep existing                          |
//! | `overwrite` | insert    | replace                                |
//! | `merge`     | insert    | union containers, overwrite scalars    |
//! | `append`    | insert    | insert under a fresh id                |

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlate::CorrelationCache;
use crate::error::{Error, Result};
use crate::model::{
    json, new_id, ContextSnapshot, Entry, Event, EventDetails, Prompt, PromptStatus,
    TerminalCommand, Workspace,
};
use crate::storage::{self, Executor, Record, SqlValue, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Skip,
    Overwrite,
    Merge,
    Append,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportOptions {
    pub overwrite: bool,
    #[serde(alias = "dry_run")]
    pub dry_run: bool,
    #[serde(alias = "workspace_filter")]
    pub workspace_filter: Option<String>,
    #[serde(alias = "merge_strategy")]
    pub merge_strategy: Option<MergeStrategy>,
}

impl ImportOptions {
    /// An explicit strategy wins; otherwise `overwrite` picks between the two defaults
    pub fn strategy(&self) -> MergeStrategy {
        match self.merge_strategy {
            Some(s) => s,
            None if self.overwrite => MergeStrategy::Overwrite,
            None => MergeStrategy::Skip,
        }
    }
}

/// Rows per table, still raw so each one can fail to decode on its own
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub entries: Vec<Value>,
    pub prompts: Vec<Value>,
    pub events: Vec<Value>,
    pub terminal_commands: Vec<Value>,
    pub context_snapshots: Vec<Value>,
    pub workspaces: Vec<Value>,
}

#[derive(Deserialize)]
struct BackupShape {
    data: Dataset,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Shape {
    Backup(BackupShape),
    Export(Dataset),
}

impl Dataset {
    pub fn from_value(value: Value) -> Result<Self> {
        match serde_json::from_value::<Shape>(value) {
            Ok(Shape::Backup(b)) => Ok(b.data),
            Ok(Shape::Export(d)) => Ok(d),
            Err(e) => Err(Error::invalid(format!("import data: {e}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportRequest {
    pub data: Value,
    pub options: ImportOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub total: u64,
    pub imported: u64,
    pub skipped: u64,
    /// Outside the workspace filter
    pub filtered: u64,
    /// Rows that did not decode
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub dry_run: bool,
    pub strategy: MergeStrategy,
    pub stats: BTreeMap<&'static str, TableStats>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-entity behaviour
// ─────────────────────────────────────────────────────────────────────────────

trait Importable: Record + Serialize + DeserializeOwned + Clone {
    fn workspace(&self) -> Option<&str>;

    /// Give the row a key when it arrived without one
    fn ensure_key(&mut self) {}

    /// Drop the key so the row lands as new. False when the key is natural
    /// (workspaces), in which case append behaves like skip.
    fn fresh_key(&mut self) -> bool;

    fn write(&self, ex: &mut dyn Executor) -> Result<Option<i64>> {
        storage::upsert(ex, self)?;
        Ok(None)
    }
}

macro_rules! string_keyed {
    ($ty:ty, $ws:ident) => {
        impl Importable for $ty {
            fn workspace(&self) -> Option<&str> {
                self.$ws.as_deref()
            }
            fn ensure_key(&mut self) {
                if self.id.is_empty() {
                    self.id = new_id();
                }
            }
            fn fresh_key(&mut self) -> bool {
                self.id = new_id();
                true
            }
        }
    };
}

string_keyed!(Entry, workspace_path);
string_keyed!(Event, workspace_path);
string_keyed!(TerminalCommand, workspace);
string_keyed!(ContextSnapshot, workspace_path);

impl Importable for Prompt {
    fn workspace(&self) -> Option<&str> {
        self.workspace_path.as_deref()
    }
    fn fresh_key(&mut self) -> bool {
        self.id = None;
        true
    }
    fn write(&self, ex: &mut dyn Executor) -> Result<Option<i64>> {
        storage::save_prompt(ex, self).map(Some)
    }
}

impl Importable for Workspace {
    fn workspace(&self) -> Option<&str> {
        Some(&self.path)
    }
    fn fresh_key(&mut self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Merge
// ─────────────────────────────────────────────────────────────────────────────

/// Combine `incoming` into `existing`: arrays union (existing order first),
/// objects take the union of keys, everything else is overwritten. Only keys
/// present in `incoming` are touched. A string standing in for a container
/// (older exports) is decoded first.
pub fn merge_values(existing: Value, incoming: &Value) -> Value {
    let (Value::Object(mut base), Value::Object(patch)) = (existing, incoming) else {
        return incoming.clone();
    };
    for (key, new) in patch {
        let new = match (base.get(key), new) {
            (Some(Value::Array(_) | Value::Object(_)), Value::String(s)) => {
                json::decode_blob(Some(s)).unwrap_or_else(|| new.clone())
            }
            _ => new.clone(),
        };
        let merged = match (base.remove(key), new) {
            (Some(Value::Array(mut old)), Value::Array(add)) => {
                for v in add {
                    if !old.contains(&v) {
                        old.push(v);
                    }
                }
                Value::Array(old)
            }
            (Some(Value::Object(mut old)), Value::Object(add)) => {
                old.extend(add);
                Value::Object(old)
            }
            (_, new) => new,
        };
        base.insert(key.clone(), merged);
    }
    Value::Object(base)
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

struct TableRun<'a> {
    strategy: MergeStrategy,
    dry_run: bool,
    filter: Option<&'a str>,
}

impl TableRun<'_> {
    fn keep(&self, workspace: Option<&str>) -> bool {
        match self.filter {
            None => true,
            Some(f) => workspace.is_some_and(|w| w.starts_with(f)),
        }
    }

    /// Import one table. `patch` adjusts each decoded row before it is
    /// written; `on_write` sees (incoming row, row as written, stored prompt id).
    fn run<R: Importable>(
        &self,
        ex: &mut dyn Executor,
        rows: &[Value],
        mut patch: impl FnMut(&mut R),
        mut on_write: impl FnMut(&R, &R, Option<i64>),
    ) -> Result<TableStats> {
        let mut stats = TableStats {
            total: rows.len() as u64,
            ..Default::default()
        };
        for raw in rows {
            let mut row: R = match serde_json::from_value(raw.clone()) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(table = R::TABLE, error = %e, "import row does not decode");
                    stats.errors += 1;
                    continue;
                }
            };
            if !self.keep(row.workspace()) {
                stats.filtered += 1;
                continue;
            }
            patch(&mut row);

            let key = row.key();
            let present = key != SqlValue::Null && storage::exists::<R>(ex, &key)?;
            let row = match (present, self.strategy) {
                (false, _) | (true, MergeStrategy::Overwrite) => Some(row),
                (true, MergeStrategy::Skip) => None,
                (true, MergeStrategy::Append) => {
                    let mut fresh = row.clone();
                    if fresh.fresh_key() {
                        if !self.dry_run {
                            fresh.ensure_key();
                            let stored = fresh.write(ex)?;
                            on_write(&row, &fresh, stored);
                        }
                        stats.imported += 1;
                    } else {
                        stats.skipped += 1;
                    }
                    continue;
                }
                (true, MergeStrategy::Merge) => match storage::find::<R>(ex, &key)? {
                    Some(existing) => {
                        let merged = merge_values(serde_json::to_value(&existing)?, raw);
                        Some(serde_json::from_value(merged)?)
                    }
                    None => Some(row),
                },
            };
            let Some(mut row) = row else {
                stats.skipped += 1;
                continue;
            };
            if !self.dry_run {
                let incoming = row.clone();
                row.ensure_key();
                let stored = row.write(ex)?;
                on_write(&incoming, &row, stored);
            }
            stats.imported += 1;
        }
        Ok(stats)
    }
}

/// Keys rewritten during one import, old → as stored
#[derive(Default)]
struct Links {
    prompts: HashMap<i64, i64>,
    entries: HashMap<String, String>,
    /// Entry id as stored → its prompt after reconciliation
    entry_prompt: HashMap<String, Option<i64>>,
}

fn remap_prompt(prompts: &HashMap<i64, i64>, id: Option<i64>) -> Option<i64> {
    id.map(|old| prompts.get(&old).copied().unwrap_or(old))
}

impl Links {
    fn prompt(&self, id: Option<i64>) -> Option<i64> {
        remap_prompt(&self.prompts, id)
    }

    fn entry(&self, id: Option<String>) -> Option<String> {
        id.map(|old| self.entries.get(&old).cloned().unwrap_or(old))
    }

    fn relink_event(&self, event: &mut Event) {
        match &mut event.details {
            EventDetails::CodeChange(stats) => {
                stats.entry_id = self.entry(stats.entry_id.take());
                let settled = stats
                    .entry_id
                    .as_ref()
                    .and_then(|e| self.entry_prompt.get(e));
                stats.prompt_id = match settled {
                    Some(settled) => *settled,
                    None => self.prompt(stats.prompt_id),
                };
            }
            EventDetails::PromptResponse(pr) => pr.entry_id = self.entry(pr.entry_id.take()),
            _ => {}
        }
    }
}

/// Make both sides of every prompt ↔ entry link written by this import agree.
///
/// An entry keeps its `prompt_id` only when that prompt is `linked` to it. A
/// prompt written by this import that still names the entry under its old id
/// (or names none) is pointed at the stored entry. Appended prompts whose entry
/// did not come along are settled as `captured`.
fn reconcile_links(
    ex: &mut dyn Executor,
    links: &mut Links,
    written: &[(String, String, Option<i64>)],
) -> Result<()> {
    let imported: HashSet<i64> = links.prompts.values().copied().collect();
    let mut claimed: HashSet<i64> = HashSet::new();

    for (old_id, new_id, prompt_id) in written {
        let settled = match prompt_id {
            None => None,
            Some(pid) => {
                let prompt = storage::find::<Prompt>(ex, &SqlValue::Integer(*pid))?;
                match prompt {
                    Some(p) if p.status == PromptStatus::Linked => {
                        let link = p.linked_entry_id.as_deref();
                        if link == Some(new_id.as_str()) {
                            Some(*pid)
                        } else if imported.contains(pid)
                            && (link.is_none() || link == Some(old_id.as_str()))
                        {
                            ex.execute(
                                "UPDATE prompts SET linked_entry_id = ? WHERE id = ?",
                                &[new_id.into(), SqlValue::Integer(*pid)],
                            )?;
                            Some(*pid)
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            }
        };
        if settled.is_none() && prompt_id.is_some() {
            ex.execute(
                "UPDATE entries SET prompt_id = NULL WHERE id = ?",
                &[new_id.into()],
            )?;
        }
        if let Some(pid) = settled {
            claimed.insert(pid);
        }
        links.entry_prompt.insert(new_id.clone(), settled);
    }

    // Appended linked prompts whose entry stayed behind
    for (old, new) in &links.prompts {
        if old == new || claimed.contains(new) {
            continue;
        }
        if let Some(p) = storage::find::<Prompt>(ex, &SqlValue::Integer(*new))? {
            if p.status == PromptStatus::Linked {
                ex.execute(
                    "UPDATE prompts SET status = ?, linked_entry_id = NULL WHERE id = ?",
                    &[PromptStatus::Captured.as_str().into(), SqlValue::Integer(*new)],
                )?;
            }
        }
    }
    Ok(())
}

/// Run an import. Tables go prompts, entries, then the rows that point at
/// them, so keys rewritten by `append` are carried onto every reference in
/// the same transaction.
pub fn import(
    store: &Store,
    cache: Option<&CorrelationCache>,
    dataset: &Dataset,
    options: &ImportOptions,
) -> Result<ImportReport> {
    let strategy = options.strategy();
    let run = TableRun {
        strategy,
        dry_run: options.dry_run,
        filter: options.workspace_filter.as_deref().filter(|f| !f.is_empty()),
    };

    let stats = store.transaction(|ex| {
        let mut stats = BTreeMap::new();
        let mut links = Links::default();
        let mut written_entries = Vec::new();

        stats.insert(
            "workspaces",
            run.run::<Workspace>(ex, &dataset.workspaces, |_| {}, |_, _, _| {})?,
        );
        stats.insert(
            "prompts",
            run.run::<Prompt>(ex, &dataset.prompts, |_| {}, |incoming: &Prompt, _, stored| {
                if let (Some(old), Some(new)) = (incoming.id, stored) {
                    links.prompts.insert(old, new);
                }
            })?,
        );
        stats.insert(
            "entries",
            run.run::<Entry>(
                ex,
                &dataset.entries,
                |entry| entry.prompt_id = remap_prompt(&links.prompts, entry.prompt_id),
                |incoming: &Entry, written: &Entry, _| {
                    if !incoming.id.is_empty() && incoming.id != written.id {
                        links.entries.insert(incoming.id.clone(), written.id.clone());
                    }
                    written_entries.push((
                        incoming.id.clone(),
                        written.id.clone(),
                        written.prompt_id,
                    ));
                },
            )?,
        );
        if !run.dry_run {
            reconcile_links(ex, &mut links, &written_entries)?;
        }
        stats.insert(
            "events",
            run.run::<Event>(ex, &dataset.events, |e| links.relink_event(e), |_, _, _| {})?,
        );
        stats.insert(
            "terminal_commands",
            run.run::<TerminalCommand>(
                ex,
                &dataset.terminal_commands,
                |c| {
                    c.linked_entry_id = links.entry(c.linked_entry_id.take());
                    c.linked_prompt_id = links.prompt(c.linked_prompt_id);
                },
                |_, _, _| {},
            )?,
        );
        stats.insert(
            "context_snapshots",
            run.run::<ContextSnapshot>(
                ex,
                &dataset.context_snapshots,
                |s| s.prompt_id = links.prompt(s.prompt_id),
                |_, _, _| {},
            )?,
        );
        Ok(stats)
    })?;

    if !options.dry_run {
        if let Some(cache) = cache {
            cache.clear();
        }
    }
    let imported: u64 = stats.values().map(|s| s.imported).sum();
    tracing::info!(?strategy, dry_run = options.dry_run, imported, "import finished");
    Ok(ImportReport {
        dry_run: options.dry_run,
        strategy,
        stats,
    })
}

/// Decode a request body and import it
pub fn import_request(
    store: &Store,
    cache: Option<&CorrelationCache>,
    request: ImportRequest,
) -> Result<ImportReport> {
    if request.data.is_null() {
        return Err(Error::invalid("import body has no data"));
    }
    let dataset = Dataset::from_value(request.data)?;
    import(store, cache, &dataset, &request.options)
}

/// Helper for tests and callers that hold typed rows
pub fn rows<T: Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|i| serde_json::to_value(i).map_err(Error::from))
        .collect()
}
