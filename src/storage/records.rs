//! Row mapping for every persisted entity
//!
//! Each table is described once: its columns (key first), how a value turns
//! into parameters in that order, and how a row turns back into a value.
//! Generic upsert, insert-if-absent and lookup are built from that.

use serde_json::Value;

use super::driver::{Row, SqlValue};
use crate::error::Result;
use crate::model::{
    json, ContextSnapshot, ConversationStats, ConversationTurn, Entry, EntrySource, Event,
    EventDetails, EventType, Motif, Prompt, PromptStatus, Rung2EditScript, TerminalCommand,
    TurnRole, Workspace,
};

/// A value stored as one row of one table
pub trait Record: Sized {
    const TABLE: &'static str;
    const KEY: &'static str;
    /// Key column first
    const COLUMNS: &'static [&'static str];
    /// Replacement update expressions used on upsert conflict
    const UPSERT_OVERRIDES: &'static [(&'static str, &'static str)] = &[];

    /// Current key; `Null` when the store must assign one
    fn key(&self) -> SqlValue;

    /// Parameters in `COLUMNS` order
    fn to_params(&self) -> Result<Vec<SqlValue>>;

    fn from_row(row: &Row) -> Self;
}

fn text_key(id: &str) -> SqlValue {
    if id.is_empty() {
        SqlValue::Null
    } else {
        SqlValue::Text(id.to_string())
    }
}

fn blob(value: &Option<Value>) -> SqlValue {
    value.as_ref().and_then(json::encode_blob).into()
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

impl Record for Entry {
    const TABLE: &'static str = "entries";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "session_id",
        "workspace_path",
        "file_path",
        "source",
        "before_code",
        "after_code",
        "notes",
        "timestamp",
        "tags",
        "prompt_id",
        "type",
        "model_info",
    ];
    // An entry's prompt link is written once
    const UPSERT_OVERRIDES: &'static [(&'static str, &'static str)] =
        &[("prompt_id", "COALESCE(entries.prompt_id, excluded.prompt_id)")];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            (&self.session_id).into(),
            (&self.workspace_path).into(),
            (&self.file_path).into(),
            self.source.as_str().into(),
            (&self.before_code).into(),
            (&self.after_code).into(),
            (&self.notes).into(),
            self.timestamp.into(),
            json::encode(&self.tags)?.into(),
            self.prompt_id.into(),
            (&self.entry_type).into(),
            blob(&self.model_info),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.string("id"),
            session_id: row.text("session_id"),
            workspace_path: row.text("workspace_path"),
            file_path: row.text("file_path"),
            source: EntrySource::parse(&row.string("source")),
            before_code: row.text("before_code"),
            after_code: row.text("after_code"),
            notes: row.text("notes"),
            timestamp: row.ts_or_epoch("timestamp"),
            tags: row.json("tags"),
            prompt_id: row.int("prompt_id"),
            entry_type: row.text("type"),
            model_info: json::decode_blob(row.text("model_info").as_deref()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

impl Record for Prompt {
    const TABLE: &'static str = "prompts";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "timestamp",
        "text",
        "workspace_path",
        "workspace_id",
        "workspace_name",
        "source",
        "status",
        "mode",
        "message_role",
        "model_type",
        "model_name",
        "context_usage",
        "context_file_count",
        "conversation_id",
        "parent_conversation_id",
        "composer_id",
        "lines_added",
        "lines_removed",
        "thinking_time_seconds",
        "prompt_tokens",
        "completion_tokens",
        "total_tokens",
        "context_window_size",
        "context_files",
        "terminal_blocks",
        "attachment_count",
        "image_count",
        "linked_entry_id",
    ];
    // A linked prompt never leaves `linked`, and keeps its entry
    const UPSERT_OVERRIDES: &'static [(&'static str, &'static str)] = &[
        (
            "status",
            "CASE WHEN prompts.status = 'linked' THEN prompts.status ELSE excluded.status END",
        ),
        (
            "linked_entry_id",
            "COALESCE(prompts.linked_entry_id, excluded.linked_entry_id)",
        ),
    ];

    fn key(&self) -> SqlValue {
        self.id.into()
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            self.timestamp.into(),
            (&self.text).into(),
            (&self.workspace_path).into(),
            (&self.workspace_id).into(),
            (&self.workspace_name).into(),
            (&self.source).into(),
            self.status.as_str().into(),
            (&self.mode).into(),
            (&self.message_role).into(),
            (&self.model_type).into(),
            (&self.model_name).into(),
            self.context_usage.into(),
            self.context_file_count.into(),
            (&self.conversation_id).into(),
            (&self.parent_conversation_id).into(),
            (&self.composer_id).into(),
            self.lines_added.into(),
            self.lines_removed.into(),
            self.thinking_time_seconds.into(),
            self.prompt_tokens.into(),
            self.completion_tokens.into(),
            self.total_tokens.into(),
            self.context_window_size.into(),
            json::encode(&self.context_files)?.into(),
            json::encode(&self.terminal_blocks)?.into(),
            self.attachment_count.into(),
            self.image_count.into(),
            (&self.linked_entry_id).into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.int("id"),
            timestamp: row.ts_or_epoch("timestamp"),
            text: row.string("text"),
            workspace_path: row.text("workspace_path"),
            workspace_id: row.text("workspace_id"),
            workspace_name: row.text("workspace_name"),
            source: row.string("source"),
            status: PromptStatus::parse(&row.string("status")),
            mode: row.text("mode"),
            message_role: row.text("message_role"),
            model_type: row.text("model_type"),
            model_name: row.text("model_name"),
            context_usage: row.real("context_usage"),
            context_file_count: row.int("context_file_count"),
            conversation_id: row.text("conversation_id"),
            parent_conversation_id: row.text("parent_conversation_id"),
            composer_id: row.text("composer_id"),
            lines_added: row.int("lines_added"),
            lines_removed: row.int("lines_removed"),
            thinking_time_seconds: row.real("thinking_time_seconds"),
            prompt_tokens: row.int("prompt_tokens"),
            completion_tokens: row.int("completion_tokens"),
            total_tokens: row.int("total_tokens"),
            context_window_size: row.int("context_window_size"),
            context_files: row.json("context_files"),
            terminal_blocks: row.json("terminal_blocks"),
            attachment_count: row.int("attachment_count"),
            image_count: row.int("image_count"),
            linked_entry_id: row.text("linked_entry_id"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

impl Record for Event {
    const TABLE: &'static str = "events";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "session_id",
        "workspace_path",
        "timestamp",
        "type",
        "details",
        "annotation",
        "ai_generated",
        "tags",
        "intent",
        "source",
        "file_path",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            (&self.session_id).into(),
            (&self.workspace_path).into(),
            self.timestamp.into(),
            self.event_type.as_str().into(),
            json::encode(&self.details)?.into(),
            (&self.annotation).into(),
            self.ai_generated.into(),
            json::encode(&self.tags)?.into(),
            (&self.intent).into(),
            (&self.source).into(),
            (&self.file_path).into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        let event_type = EventType::from(row.string("type"));
        let details = json::decode_blob(row.text("details").as_deref())
            .map(|v| EventDetails::decode(&event_type, v))
            .unwrap_or_default();
        Self {
            id: row.string("id"),
            session_id: row.text("session_id"),
            workspace_path: row.text("workspace_path"),
            timestamp: row.ts_or_epoch("timestamp"),
            event_type,
            details,
            annotation: row.text("annotation"),
            ai_generated: row.flag("ai_generated"),
            tags: row.json("tags"),
            intent: row.text("intent"),
            source: row.text("source"),
            file_path: row.text("file_path"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal commands
// ─────────────────────────────────────────────────────────────────────────────

impl Record for TerminalCommand {
    const TABLE: &'static str = "terminal_commands";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "timestamp",
        "command",
        "workspace",
        "shell",
        "source",
        "exit_code",
        "duration_ms",
        "output",
        "error",
        "session_id",
        "linked_entry_id",
        "linked_prompt_id",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            self.timestamp.into(),
            (&self.command).into(),
            (&self.workspace).into(),
            (&self.shell).into(),
            (&self.source).into(),
            self.exit_code.into(),
            self.duration_ms.into(),
            (&self.output).into(),
            (&self.error).into(),
            (&self.session_id).into(),
            (&self.linked_entry_id).into(),
            self.linked_prompt_id.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.string("id"),
            timestamp: row.ts_or_epoch("timestamp"),
            command: row.string("command"),
            workspace: row.text("workspace"),
            shell: row.text("shell"),
            source: row.string("source"),
            exit_code: row.int("exit_code"),
            duration_ms: row.int("duration_ms"),
            output: row.text("output"),
            error: row.text("error"),
            session_id: row.text("session_id"),
            linked_entry_id: row.text("linked_entry_id"),
            linked_prompt_id: row.int("linked_prompt_id"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation turns and rollups
// ─────────────────────────────────────────────────────────────────────────────

impl Record for ConversationTurn {
    const TABLE: &'static str = "conversation_turns";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "conversation_id",
        "turn_index",
        "role",
        "content",
        "model_name",
        "model_provider",
        "prompt_tokens",
        "completion_tokens",
        "total_tokens",
        "request_start_time",
        "request_end_time",
        "request_duration_ms",
        "first_token_time",
        "time_to_first_token_ms",
        "thinking_time_seconds",
        "streaming",
        "context_files",
        "referenced_files",
        "code_blocks",
        "metadata",
        "created_at",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            (&self.conversation_id).into(),
            self.turn_index.into(),
            self.role.as_str().into(),
            (&self.content).into(),
            (&self.model_name).into(),
            (&self.model_provider).into(),
            self.prompt_tokens.into(),
            self.completion_tokens.into(),
            self.total_tokens.into(),
            self.request_start_time.into(),
            self.request_end_time.into(),
            self.request_duration_ms.into(),
            self.first_token_time.into(),
            self.time_to_first_token_ms.into(),
            self.thinking_time_seconds.into(),
            self.streaming.into(),
            json::encode(&self.context_files)?.into(),
            json::encode(&self.referenced_files)?.into(),
            json::encode(&self.code_blocks)?.into(),
            json::encode(&self.metadata)?.into(),
            self.created_at.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.string("id"),
            conversation_id: row.string("conversation_id"),
            turn_index: row.int("turn_index").unwrap_or(0),
            role: TurnRole::parse(&row.string("role")),
            content: row.string("content"),
            model_name: row.text("model_name"),
            model_provider: row.text("model_provider"),
            prompt_tokens: row.int("prompt_tokens").unwrap_or(0),
            completion_tokens: row.int("completion_tokens").unwrap_or(0),
            total_tokens: row.int("total_tokens").unwrap_or(0),
            request_start_time: row.ts("request_start_time"),
            request_end_time: row.ts("request_end_time"),
            request_duration_ms: row.int("request_duration_ms"),
            first_token_time: row.ts("first_token_time"),
            time_to_first_token_ms: row.int("time_to_first_token_ms"),
            thinking_time_seconds: row.real("thinking_time_seconds"),
            streaming: row.flag("streaming"),
            context_files: row.json("context_files"),
            referenced_files: row.json("referenced_files"),
            code_blocks: row.json("code_blocks"),
            metadata: row.json("metadata"),
            created_at: row.ts_or_epoch("created_at"),
        }
    }
}

impl Record for ConversationStats {
    const TABLE: &'static str = "conversations";
    const KEY: &'static str = "conversation_id";
    const COLUMNS: &'static [&'static str] = &[
        "conversation_id",
        "turn_count",
        "user_turns",
        "assistant_turns",
        "total_prompt_tokens",
        "total_completion_tokens",
        "total_tokens",
        "total_duration_ms",
        "first_turn_at",
        "last_turn_at",
        "updated_at",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.conversation_id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            self.turn_count.into(),
            self.user_turns.into(),
            self.assistant_turns.into(),
            self.total_prompt_tokens.into(),
            self.total_completion_tokens.into(),
            self.total_tokens.into(),
            self.total_duration_ms.into(),
            self.first_turn_at.into(),
            self.last_turn_at.into(),
            self.updated_at.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            conversation_id: row.string("conversation_id"),
            turn_count: row.int("turn_count").unwrap_or(0),
            user_turns: row.int("user_turns").unwrap_or(0),
            assistant_turns: row.int("assistant_turns").unwrap_or(0),
            total_prompt_tokens: row.int("total_prompt_tokens").unwrap_or(0),
            total_completion_tokens: row.int("total_completion_tokens").unwrap_or(0),
            total_tokens: row.int("total_tokens").unwrap_or(0),
            total_duration_ms: row.int("total_duration_ms").unwrap_or(0),
            first_turn_at: row.ts("first_turn_at"),
            last_turn_at: row.ts("last_turn_at"),
            updated_at: row.ts("updated_at"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Editor state and derived tiers
// ─────────────────────────────────────────────────────────────────────────────

impl Record for ContextSnapshot {
    const TABLE: &'static str = "context_snapshots";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "prompt_id",
        "timestamp",
        "workspace_path",
        "target_file",
        "context_files",
        "file_count",
        "context_usage",
        "metadata",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            self.prompt_id.into(),
            self.timestamp.into(),
            (&self.workspace_path).into(),
            (&self.target_file).into(),
            json::encode(&self.context_files)?.into(),
            self.file_count.into(),
            self.context_usage.into(),
            json::encode(&self.metadata)?.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.string("id"),
            prompt_id: row.int("prompt_id"),
            timestamp: row.ts_or_epoch("timestamp"),
            workspace_path: row.text("workspace_path"),
            target_file: row.text("target_file"),
            context_files: row.json("context_files"),
            file_count: row.int("file_count").unwrap_or(0),
            context_usage: row.real("context_usage"),
            metadata: row.json("metadata"),
        }
    }
}

impl Record for Workspace {
    const TABLE: &'static str = "workspaces";
    const KEY: &'static str = "path";
    const COLUMNS: &'static [&'static str] = &[
        "path",
        "name",
        "first_seen",
        "last_seen",
        "entry_count",
        "prompt_count",
        "metadata",
    ];
    // Re-registering a workspace only moves `last_seen` forward
    const UPSERT_OVERRIDES: &'static [(&'static str, &'static str)] = &[
        ("first_seen", "workspaces.first_seen"),
        ("name", "COALESCE(excluded.name, workspaces.name)"),
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.path)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            (&self.name).into(),
            self.first_seen.into(),
            self.last_seen.into(),
            self.entry_count.into(),
            self.prompt_count.into(),
            json::encode(&self.metadata)?.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            path: row.string("path"),
            name: row.text("name"),
            first_seen: row.ts_or_epoch("first_seen"),
            last_seen: row.ts_or_epoch("last_seen"),
            entry_count: row.int("entry_count").unwrap_or(0),
            prompt_count: row.int("prompt_count").unwrap_or(0),
            metadata: row.json("metadata"),
        }
    }
}

impl Record for Motif {
    const TABLE: &'static str = "motifs";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "description",
        "rung",
        "occurrences",
        "pattern",
        "metadata",
        "created_at",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            (&self.name).into(),
            (&self.description).into(),
            (&self.rung).into(),
            self.occurrences.into(),
            json::encode(&self.pattern)?.into(),
            json::encode(&self.metadata)?.into(),
            self.created_at.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.string("id"),
            name: row.string("name"),
            description: row.text("description"),
            rung: row.text("rung"),
            occurrences: row.int("occurrences").unwrap_or(0),
            pattern: row.json("pattern"),
            metadata: row.json("metadata"),
            created_at: row.ts_or_epoch("created_at"),
        }
    }
}

impl Record for Rung2EditScript {
    const TABLE: &'static str = "rung2_edit_scripts";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "entry_id",
        "file_path",
        "timestamp",
        "operations",
        "metadata",
    ];

    fn key(&self) -> SqlValue {
        text_key(&self.id)
    }

    fn to_params(&self) -> Result<Vec<SqlValue>> {
        Ok(vec![
            self.key(),
            (&self.entry_id).into(),
            (&self.file_path).into(),
            self.timestamp.into(),
            json::encode(&self.operations)?.into(),
            json::encode(&self.metadata)?.into(),
        ])
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.string("id"),
            entry_id: row.text("entry_id"),
            file_path: row.text("file_path"),
            timestamp: row.ts_or_epoch("timestamp"),
            operations: row.json("operations"),
            metadata: row.json("metadata"),
        }
    }
}
