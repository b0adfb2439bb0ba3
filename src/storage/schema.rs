//! Schema creation and migrations
//!
//! The version lives in `metadata.schema_version`. Each step is idempotent so
//! a crash between the DDL and the version bump is harmless on the next boot.

use super::driver::{Executor, SqlValue};
use crate::error::Result;

/// Version this build writes
pub const SCHEMA_VERSION: i64 = 2;

/// Bring the schema up to `SCHEMA_VERSION`
pub fn migrate(ex: &mut dyn Executor) -> Result<i64> {
    ex.execute_batch("CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT)")?;

    let current = current_version(ex)?;
    if current < 1 {
        apply_schema_v1(ex)?;
    }
    if current < 2 {
        migrate_v1_to_v2(ex)?;
    }
    Ok(current_version(ex)?.max(SCHEMA_VERSION))
}

pub fn current_version(ex: &mut dyn Executor) -> Result<i64> {
    let row = ex.query_one(
        "SELECT value FROM metadata WHERE key = 'schema_version'",
        &[],
    )?;
    Ok(row.and_then(|r| r.int("value")).unwrap_or(0))
}

fn set_version(ex: &mut dyn Executor, version: i64) -> Result<()> {
    ex.execute(
        "INSERT INTO metadata (key, value) VALUES ('schema_version', ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        &[SqlValue::Text(version.to_string())],
    )?;
    Ok(())
}

/// Add a column unless it is already there
pub fn add_column_if_missing(
    ex: &mut dyn Executor,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<bool> {
    let sql = ex.dialect().column_exists_sql();
    let present = ex
        .query_one(sql, &[table.into(), column.into()])?
        .and_then(|r| r.int("present"))
        .unwrap_or(0)
        > 0;
    if present {
        return Ok(false);
    }
    let decl = ex.dialect().ddl(decl);
    ex.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    Ok(true)
}

/// Initial schema (v1)
fn apply_schema_v1(ex: &mut dyn Executor) -> Result<()> {
    let ddl = ex.dialect().ddl(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            session_id TEXT,
            workspace_path TEXT,
            file_path TEXT,
            source TEXT NOT NULL DEFAULT 'manual',
            before_code TEXT,
            after_code TEXT,
            notes TEXT,
            timestamp TEXT NOT NULL,
            tags TEXT,
            prompt_id {int},
            type TEXT,
            model_info TEXT
        );

        CREATE TABLE IF NOT EXISTS prompts (
            id {serial_pk},
            timestamp TEXT NOT NULL,
            text TEXT NOT NULL,
            workspace_path TEXT,
            workspace_id TEXT,
            workspace_name TEXT,
            source TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            mode TEXT,
            message_role TEXT,
            model_type TEXT,
            model_name TEXT,
            context_usage {real},
            context_file_count {int},
            conversation_id TEXT,
            parent_conversation_id TEXT,
            composer_id TEXT,
            lines_added {int},
            lines_removed {int},
            thinking_time_seconds {real},
            prompt_tokens {int},
            completion_tokens {int},
            total_tokens {int},
            context_window_size {int},
            context_files TEXT,
            terminal_blocks TEXT,
            attachment_count {int}
        );

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            session_id TEXT,
            workspace_path TEXT,
            timestamp TEXT NOT NULL,
            type TEXT NOT NULL,
            details TEXT,
            annotation TEXT,
            ai_generated {int} NOT NULL DEFAULT 0,
            tags TEXT,
            intent TEXT,
            source TEXT,
            file_path TEXT
        );

        CREATE TABLE IF NOT EXISTS terminal_commands (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            command TEXT NOT NULL,
            workspace TEXT,
            shell TEXT,
            source TEXT,
            exit_code {int},
            duration_ms {int},
            output TEXT,
            error TEXT,
            session_id TEXT,
            linked_entry_id TEXT,
            linked_prompt_id {int}
        );

        CREATE TABLE IF NOT EXISTS context_snapshots (
            id TEXT PRIMARY KEY,
            prompt_id {int},
            timestamp TEXT NOT NULL,
            workspace_path TEXT,
            context_files TEXT,
            file_count {int} NOT NULL DEFAULT 0,
            context_usage {real},
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS workspaces (
            path TEXT PRIMARY KEY,
            name TEXT,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            entry_count {int} NOT NULL DEFAULT 0,
            prompt_count {int} NOT NULL DEFAULT 0,
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS motifs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            rung TEXT,
            occurrences {int} NOT NULL DEFAULT 0,
            pattern TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_turns (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            turn_index {int} NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            model_name TEXT,
            model_provider TEXT,
            prompt_tokens {int} NOT NULL DEFAULT 0,
            completion_tokens {int} NOT NULL DEFAULT 0,
            total_tokens {int} NOT NULL DEFAULT 0,
            request_start_time TEXT,
            request_end_time TEXT,
            request_duration_ms {int},
            first_token_time TEXT,
            time_to_first_token_ms {int},
            thinking_time_seconds {real},
            streaming {int} NOT NULL DEFAULT 0,
            context_files TEXT,
            referenced_files TEXT,
            code_blocks TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (conversation_id, turn_index)
        );

        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            turn_count {int} NOT NULL DEFAULT 0,
            user_turns {int} NOT NULL DEFAULT 0,
            assistant_turns {int} NOT NULL DEFAULT 0,
            total_prompt_tokens {int} NOT NULL DEFAULT 0,
            total_completion_tokens {int} NOT NULL DEFAULT 0,
            total_tokens {int} NOT NULL DEFAULT 0,
            total_duration_ms {int} NOT NULL DEFAULT 0,
            first_turn_at TEXT,
            last_turn_at TEXT,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS rung2_edit_scripts (
            id TEXT PRIMARY KEY,
            entry_id TEXT,
            file_path TEXT,
            timestamp TEXT NOT NULL,
            operations TEXT,
            metadata TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp);
        CREATE INDEX IF NOT EXISTS idx_entries_workspace ON entries(workspace_path);
        CREATE INDEX IF NOT EXISTS idx_entries_prompt ON entries(prompt_id);
        CREATE INDEX IF NOT EXISTS idx_prompts_timestamp ON prompts(timestamp);
        CREATE INDEX IF NOT EXISTS idx_prompts_status ON prompts(status);
        CREATE INDEX IF NOT EXISTS idx_prompts_workspace ON prompts(workspace_path);
        CREATE INDEX IF NOT EXISTS idx_prompts_conversation ON prompts(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_workspace ON events(workspace_path);
        CREATE INDEX IF NOT EXISTS idx_terminal_timestamp ON terminal_commands(timestamp);
        CREATE INDEX IF NOT EXISTS idx_terminal_workspace ON terminal_commands(workspace);
        CREATE INDEX IF NOT EXISTS idx_snapshots_prompt ON context_snapshots(prompt_id);
        CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON context_snapshots(timestamp);
        CREATE INDEX IF NOT EXISTS idx_turns_conversation ON conversation_turns(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_rung2_timestamp ON rung2_edit_scripts(timestamp);
        "#,
    );
    ex.execute_batch(&ddl)?;
    set_version(ex, 1)?;
    tracing::info!(backend = ex.dialect().name(), "Created database schema v1");
    Ok(())
}

/// v1 → v2: attribution back-references and image counts
fn migrate_v1_to_v2(ex: &mut dyn Executor) -> Result<()> {
    add_column_if_missing(ex, "prompts", "linked_entry_id", "TEXT")?;
    add_column_if_missing(ex, "prompts", "image_count", "{int}")?;
    add_column_if_missing(ex, "context_snapshots", "target_file", "TEXT")?;
    set_version(ex, 2)?;
    tracing::info!("Migrated database from v1 to v2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteExecutor;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut ex = SqliteExecutor::new(&conn);
        assert_eq!(migrate(&mut ex).unwrap(), SCHEMA_VERSION);
        assert_eq!(migrate(&mut ex).unwrap(), SCHEMA_VERSION);
        assert_eq!(current_version(&mut ex).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_add_column_is_noop_when_present() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut ex = SqliteExecutor::new(&conn);
        migrate(&mut ex).unwrap();
        assert!(!add_column_if_missing(&mut ex, "prompts", "linked_entry_id", "TEXT").unwrap());
        assert!(add_column_if_missing(&mut ex, "prompts", "extra_note", "TEXT").unwrap());
        assert!(!add_column_if_missing(&mut ex, "prompts", "extra_note", "TEXT").unwrap());
    }

    #[test]
    fn test_v1_database_gains_v2_columns() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut ex = SqliteExecutor::new(&conn);
        ex.execute_batch("CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT)")
            .unwrap();
        apply_schema_v1(&mut ex).unwrap();
        assert_eq!(current_version(&mut ex).unwrap(), 1);

        migrate(&mut ex).unwrap();
        let row = ex
            .query_one(
                "SELECT COUNT(*) AS present FROM pragma_table_info('prompts') WHERE name = 'image_count'",
                &[],
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.int("present"), Some(1));
    }
}
