//! Persistence layer: one operation set over two SQL backends
//!
//! # Architecture
//!
//! ```text
//! capture / turns / api
//!     │  (spawn_blocking)
//!     ▼
//! Store ─── records.rs (row mapping per table)
//!     │ ─── schema.rs  (migrations, metadata.schema_version)
//!     │
//!     ├──→ r2d2 Pool<SqliteConnectionManager>     (embedded, WAL)
//!     └──→ r2d2 Pool<PostgresConnectionManager>   (DATABASE_URL)
//! ```
//!
//! Every method is synchronous and may block on I/O. Async callers go
//! through `tokio::task::spawn_blocking`.

mod driver;
mod postgres;
mod queries;
mod records;
mod retry;
mod schema;
mod sqlite;


use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use driver::{Dialect, Executor, Row, SqlValue};
pub use queries::{EventFilter, TerminalFilter};
pub use records::Record;
pub use schema::SCHEMA_VERSION;

use crate::error::{Error, Result};
use crate::model::{
    new_id, ContextSnapshot, ConversationTurn, Entry, Event, Motif, Prompt, PromptStatus,
    Rung2EditScript, TerminalCommand, Workspace,
};

// ─────────────────────────────────────────────────────────────────────────────
// Connection settings
// ─────────────────────────────────────────────────────────────────────────────

/// Pool sizing shared by both backends
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_idle: u32,
    pub max_size: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_size: 20,
            connection_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Which backend to open
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseTarget {
    /// SQLite file
    Embedded(PathBuf),
    /// `postgres://` URL
    Networked(String),
}

#[derive(Clone)]
enum Backend {
    Sqlite {
        pool: sqlite::SqlitePool,
        path: PathBuf,
    },
    Postgres {
        pool: postgres::PgPool,
    },
}

/// Counts and identity of the open store
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub schema_version: i64,
    pub entries: i64,
    pub prompts: i64,
    pub pending_prompts: i64,
    pub linked_prompts: i64,
    pub events: i64,
    pub terminal_commands: i64,
    pub context_snapshots: i64,
    pub workspaces: i64,
    pub motifs: i64,
    pub conversation_turns: i64,
    pub conversations: i64,
    pub rung2_edit_scripts: i64,
    /// Embedded backend only
    pub db_size_bytes: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the persistence backend. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    backend: Backend,
}

impl Store {
    /// Open the backend named by `target` and run migrations.
    ///
    /// Blocking: the networked driver drives its own runtime, so this must run
    /// on a plain thread or inside `spawn_blocking`.
    pub fn open(target: &DatabaseTarget, settings: &PoolSettings) -> Result<Self> {
        let backend = match target {
            DatabaseTarget::Embedded(path) => Backend::Sqlite {
                pool: sqlite::open_pool(path, settings)?,
                path: path.clone(),
            },
            DatabaseTarget::Networked(url) => Backend::Postgres {
                pool: postgres::open_pool(url, settings)?,
            },
        };
        let store = Self { backend };
        let version = store.transaction(schema::migrate)?;
        tracing::info!(
            backend = store.dialect().name(),
            schema_version = version,
            "Store opened"
        );
        Ok(store)
    }

    /// Embedded store at `path` with default pool settings
    pub fn open_sqlite(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(
            &DatabaseTarget::Embedded(path.as_ref().to_path_buf()),
            &PoolSettings::default(),
        )
    }

    pub fn dialect(&self) -> Dialect {
        match self.backend {
            Backend::Sqlite { .. } => Dialect::Sqlite,
            Backend::Postgres { .. } => Dialect::Postgres,
        }
    }

    /// Run `f` on a pooled connection without a transaction
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut dyn Executor) -> Result<T>) -> Result<T> {
        match &self.backend {
            Backend::Sqlite { pool, .. } => {
                let conn = pool.get()?;
                f(&mut sqlite::SqliteExecutor::new(&conn))
            }
            Backend::Postgres { pool } => {
                let mut client = pool.get()?;
                f(&mut postgres::PgExecutor::new(&mut *client))
            }
        }
    }

    /// Run `f` inside a transaction. Any error rolls back, so a failed write
    /// leaves no partial rows behind.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut dyn Executor) -> Result<T>) -> Result<T> {
        match &self.backend {
            Backend::Sqlite { pool, .. } => {
                let mut conn = pool.get()?;
                let tx =
                    conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let out = f(&mut sqlite::SqliteExecutor::new(&tx))?;
                tx.commit()?;
                Ok(out)
            }
            Backend::Postgres { pool } => {
                let mut client = pool.get()?;
                let mut tx = client.transaction()?;
                let out = f(&mut postgres::PgExecutor::new(&mut tx))?;
                tx.commit()?;
                Ok(out)
            }
        }
    }

    /// Read with transient-failure retry
    pub fn read<T>(&self, f: impl Fn(&mut dyn Executor) -> Result<T>) -> Result<T> {
        retry::retry_transient(|| self.with_conn(&f))
    }

    /// Cheap liveness probe
    pub fn ping(&self) -> Result<()> {
        self.read(|ex| ex.query("SELECT 1 AS ok", &[]).map(|_| ()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Generic row operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace on primary key; all non-key columns are overwritten
    pub fn upsert_by_id<R: Record>(&self, record: &R) -> Result<()> {
        self.transaction(|ex| upsert(ex, record))
    }

    /// Insert unless a row with the same key exists. Returns whether it inserted.
    pub fn insert_if_absent<R: Record>(&self, record: &R) -> Result<bool> {
        self.transaction(|ex| insert_if_absent(ex, record))
    }

    pub fn exists<R: Record>(&self, key: impl Into<SqlValue>) -> Result<bool> {
        let key = key.into();
        self.read(|ex| exists::<R>(ex, &key))
    }

    pub fn get<R: Record>(&self, key: impl Into<SqlValue>) -> Result<Option<R>> {
        let key = key.into();
        self.read(|ex| find::<R>(ex, &key))
    }

    /// Every row of a table in key order (exports and backups)
    pub fn all<R: Record>(&self) -> Result<Vec<R>> {
        self.read(|ex| {
            let sql = format!(
                "SELECT {} FROM {} ORDER BY {}",
                R::COLUMNS.join(", "),
                R::TABLE,
                R::KEY
            );
            Ok(ex.query(&sql, &[])?.iter().map(R::from_row).collect())
        })
    }

    pub fn count(&self, table: &str) -> Result<i64> {
        self.read(|ex| count(ex, table))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Upsert an entry, assigning an id when absent. Returns the stored value.
    pub fn save_entry(&self, mut entry: Entry) -> Result<Entry> {
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        self.upsert_by_id(&entry)?;
        Ok(entry)
    }

    /// Upsert a prompt. Without an id the database assigns one.
    pub fn save_prompt(&self, mut prompt: Prompt) -> Result<Prompt> {
        let id = self.transaction(|ex| save_prompt(ex, &prompt))?;
        prompt.id = Some(id);
        Ok(prompt)
    }

    pub fn save_event(&self, mut event: Event) -> Result<Event> {
        if event.id.is_empty() {
            event.id = new_id();
        }
        self.upsert_by_id(&event)?;
        Ok(event)
    }

    pub fn save_terminal_command(&self, mut command: TerminalCommand) -> Result<TerminalCommand> {
        if command.id.is_empty() {
            command.id = new_id();
        }
        command.truncate_streams();
        self.upsert_by_id(&command)?;
        Ok(command)
    }

    pub fn save_context_snapshot(&self, mut snapshot: ContextSnapshot) -> Result<ContextSnapshot> {
        if snapshot.id.is_empty() {
            snapshot.id = new_id();
        }
        if snapshot.file_count == 0 {
            snapshot.file_count = snapshot.context_files.len() as i64;
        }
        self.upsert_by_id(&snapshot)?;
        Ok(snapshot)
    }

    pub fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        if workspace.path.is_empty() {
            return Err(Error::invalid("workspace path is empty"));
        }
        self.upsert_by_id(workspace)
    }

    pub fn save_motif(&self, mut motif: Motif) -> Result<Motif> {
        if motif.id.is_empty() {
            motif.id = new_id();
        }
        self.upsert_by_id(&motif)?;
        Ok(motif)
    }

    pub fn save_rung2_edit_script(&self, mut script: Rung2EditScript) -> Result<Rung2EditScript> {
        if script.id.is_empty() {
            script.id = new_id();
        }
        self.upsert_by_id(&script)?;
        Ok(script)
    }

    /// Insert or replace a turn. A different turn already holding the same
    /// `(conversation_id, turn_index)` fails with `ConstraintViolation`.
    pub fn save_turn(&self, mut turn: ConversationTurn) -> Result<ConversationTurn> {
        if turn.id.is_empty() {
            turn.id = new_id();
        }
        self.upsert_by_id(&turn)?;
        Ok(turn)
    }

    /// Write the mutable columns of an existing turn
    pub fn update_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let params = vec![
            SqlValue::from(&turn.content),
            turn.prompt_tokens.into(),
            turn.completion_tokens.into(),
            turn.total_tokens.into(),
            turn.request_end_time.into(),
            turn.request_duration_ms.into(),
            turn.first_token_time.into(),
            turn.time_to_first_token_ms.into(),
            turn.thinking_time_seconds.into(),
            crate::model::json::encode(&turn.code_blocks)?.into(),
            crate::model::json::encode(&turn.metadata)?.into(),
            SqlValue::from(&turn.id),
        ];
        let n = self.transaction(|ex| {
            ex.execute(
                "UPDATE conversation_turns SET content = ?, prompt_tokens = ?, \
                 completion_tokens = ?, total_tokens = ?, request_end_time = ?, \
                 request_duration_ms = ?, first_token_time = ?, time_to_first_token_ms = ?, \
                 thinking_time_seconds = ?, code_blocks = ?, metadata = ? WHERE id = ?",
                &params,
            )
        })?;
        if n == 0 {
            return Err(Error::NotFound(format!("turn {}", turn.id)));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity reads
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_entry(&self, id: &str) -> Result<Entry> {
        self.get::<Entry>(id)?
            .ok_or_else(|| Error::NotFound(format!("entry {}", id)))
    }

    pub fn get_prompt(&self, id: i64) -> Result<Prompt> {
        self.get::<Prompt>(id)?
            .ok_or_else(|| Error::NotFound(format!("prompt {}", id)))
    }

    pub fn get_event(&self, id: &str) -> Result<Event> {
        self.get::<Event>(id)?
            .ok_or_else(|| Error::NotFound(format!("event {}", id)))
    }

    pub fn get_turn(&self, id: &str) -> Result<ConversationTurn> {
        self.get::<ConversationTurn>(id)?
            .ok_or_else(|| Error::NotFound(format!("turn {}", id)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Prompt attribution
    // ─────────────────────────────────────────────────────────────────────────

    /// Most recent `pending` prompt: newest timestamp, then highest id
    pub fn latest_pending_prompt(&self) -> Result<Option<Prompt>> {
        self.read(latest_pending_prompt)
    }

    /// Save a change entry, attributing it to the latest pending prompt in the
    /// same transaction. Returns the stored entry and the linked prompt, if any.
    ///
    /// The prompt moves `pending → linked` through a conditional update, so two
    /// racing changes can never both claim it.
    pub fn save_entry_with_attribution(&self, mut entry: Entry) -> Result<(Entry, Option<Prompt>)> {
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        self.transaction(|ex| {
            let mut linked = None;
            if entry.prompt_id.is_none() {
                if let Some(mut prompt) = latest_pending_prompt(ex)? {
                    let id = prompt.id.unwrap_or_default();
                    let claimed = ex.execute(
                        "UPDATE prompts SET status = 'linked', linked_entry_id = ? \
                         WHERE id = ? AND status = 'pending'",
                        &[SqlValue::from(&entry.id), id.into()],
                    )?;
                    if claimed == 1 {
                        entry.prompt_id = Some(id);
                        prompt.status = PromptStatus::Linked;
                        prompt.linked_entry_id = Some(entry.id.clone());
                        linked = Some(prompt);
                    }
                }
            }
            upsert(ex, &entry)?;
            Ok((entry, linked))
        })
    }

    /// Link an existing entry to a pending prompt. Both sides are conditional;
    /// returns false when either was already linked.
    pub fn link_entry_to_prompt(&self, entry_id: &str, prompt_id: i64) -> Result<bool> {
        self.transaction(|ex| {
            let entry_set = ex.execute(
                "UPDATE entries SET prompt_id = ? WHERE id = ? AND prompt_id IS NULL",
                &[prompt_id.into(), entry_id.into()],
            )?;
            if entry_set == 0 {
                return Ok(false);
            }
            let prompt_set = ex.execute(
                "UPDATE prompts SET status = 'linked', linked_entry_id = ? \
                 WHERE id = ? AND status = 'pending'",
                &[entry_id.into(), prompt_id.into()],
            )?;
            if prompt_set == 0 {
                // Undo our half inside the same transaction
                ex.execute(
                    "UPDATE entries SET prompt_id = NULL WHERE id = ?",
                    &[entry_id.into()],
                )?;
                return Ok(false);
            }
            Ok(true)
        })
    }

    /// Conditional status move. Returns false if the prompt was not in `from`.
    pub fn set_prompt_status(&self, id: i64, from: PromptStatus, to: PromptStatus) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::invalid(format!(
                "prompt status cannot move {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let n = self.transaction(|ex| {
            ex.execute(
                "UPDATE prompts SET status = ? WHERE id = ? AND status = ?",
                &[to.as_str().into(), id.into(), from.as_str().into()],
            )
        })?;
        Ok(n == 1)
    }

    /// Move every `pending` prompt older than `cutoff` to `captured`
    pub fn capture_stale_prompts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.transaction(|ex| {
            ex.execute(
                "UPDATE prompts SET status = 'captured' WHERE status = 'pending' AND timestamp < ?",
                &[cutoff.into()],
            )
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stats
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<StoreStats> {
        let mut stats = self.read(|ex| {
            Ok(StoreStats {
                backend: ex.dialect().name(),
                schema_version: schema::current_version(ex)?,
                entries: count(ex, "entries")?,
                prompts: count(ex, "prompts")?,
                pending_prompts: count_prompts_with_status(ex, PromptStatus::Pending)?,
                linked_prompts: count_prompts_with_status(ex, PromptStatus::Linked)?,
                events: count(ex, "events")?,
                terminal_commands: count(ex, "terminal_commands")?,
                context_snapshots: count(ex, "context_snapshots")?,
                workspaces: count(ex, "workspaces")?,
                motifs: count(ex, "motifs")?,
                conversation_turns: count(ex, "conversation_turns")?,
                conversations: count(ex, "conversations")?,
                rung2_edit_scripts: count(ex, "rung2_edit_scripts")?,
                db_size_bytes: None,
            })
        })?;
        if let Backend::Sqlite { path, .. } = &self.backend {
            stats.db_size_bytes = sqlite::file_size(path);
        }
        Ok(stats)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor-level helpers (usable inside a transaction)
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn upsert<R: Record>(ex: &mut dyn Executor, record: &R) -> Result<()> {
    if record.key() == SqlValue::Null {
        return Err(Error::Internal(format!("{} upsert without key", R::TABLE)));
    }
    let sql = driver::upsert_sql(R::TABLE, R::KEY, R::COLUMNS, R::UPSERT_OVERRIDES);
    ex.execute(&sql, &record.to_params()?)?;
    Ok(())
}

pub(crate) fn insert_if_absent<R: Record>(ex: &mut dyn Executor, record: &R) -> Result<bool> {
    let sql = ex.dialect().insert_ignore(R::TABLE, R::KEY, R::COLUMNS);
    Ok(ex.execute(&sql, &record.to_params()?)? > 0)
}

pub(crate) fn exists<R: Record>(ex: &mut dyn Executor, key: &SqlValue) -> Result<bool> {
    let sql = format!("SELECT 1 AS hit FROM {} WHERE {} = ?", R::TABLE, R::KEY);
    Ok(ex.query_one(&sql, std::slice::from_ref(key))?.is_some())
}

pub(crate) fn find<R: Record>(ex: &mut dyn Executor, key: &SqlValue) -> Result<Option<R>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        R::COLUMNS.join(", "),
        R::TABLE,
        R::KEY
    );
    Ok(ex
        .query_one(&sql, std::slice::from_ref(key))?
        .map(|row| R::from_row(&row)))
}

fn count(ex: &mut dyn Executor, table: &str) -> Result<i64> {
    Ok(ex
        .query_one(&format!("SELECT COUNT(*) AS n FROM {}", table), &[])?
        .and_then(|r| r.int("n"))
        .unwrap_or(0))
}

fn count_prompts_with_status(ex: &mut dyn Executor, status: PromptStatus) -> Result<i64> {
    Ok(ex
        .query_one(
            "SELECT COUNT(*) AS n FROM prompts WHERE status = ?",
            &[status.as_str().into()],
        )?
        .and_then(|r| r.int("n"))
        .unwrap_or(0))
}

/// Insert a prompt without id (database assigns) or upsert one with an id
pub(crate) fn save_prompt(ex: &mut dyn Executor, prompt: &Prompt) -> Result<i64> {
    match prompt.id {
        Some(id) => {
            upsert(ex, prompt)?;
            if let Some(sql) = ex.dialect().resync_serial(Prompt::TABLE, Prompt::KEY) {
                ex.query(&sql, &[])?;
            }
            Ok(id)
        }
        None => {
            let columns = &Prompt::COLUMNS[1..];
            let params = prompt.to_params()?.split_off(1);
            let sql = format!(
                "INSERT INTO prompts ({}) VALUES ({}) RETURNING id",
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            );
            ex.query_one(&sql, &params)?
                .and_then(|r| r.int("id"))
                .ok_or_else(|| Error::Internal("prompt insert returned no id".into()))
        }
    }
}

fn latest_pending_prompt(ex: &mut dyn Executor) -> Result<Option<Prompt>> {
    let sql = format!(
        "SELECT {} FROM prompts WHERE status = 'pending' ORDER BY timestamp DESC, id DESC LIMIT 1",
        Prompt::COLUMNS.join(", ")
    );
    Ok(ex.query_one(&sql, &[])?.map(|r| Prompt::from_row(&r)))
}
