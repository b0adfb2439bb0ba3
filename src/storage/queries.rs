//! Read paths: recent rows, filtered history, joins and conversation rollups

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::driver::{Executor, SqlValue};
use super::records::Record;
use super::{upsert, Store};
use crate::error::Result;
use crate::model::{
    new_id, ContextSnapshot, ConversationStats, ConversationTurn, Entry, EntryWithPrompt, Event, Prompt,
    TerminalCommand, TurnRole,
};

/// Filter for `/api/activity`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub workspace: Option<String>,
}

/// Filter for `/api/terminal/history`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TerminalFilter {
    pub limit: Option<i64>,
    pub source: Option<String>,
    pub workspace: Option<String>,
    #[serde(rename = "exitCode", alias = "exit_code")]
    pub exit_code: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 10_000;

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// WHERE-clause accumulator for single-table selects
#[derive(Debug, Clone, Default)]
struct Query {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl Query {
    fn push(mut self, clause: &str, value: impl Into<SqlValue>) -> Self {
        self.clauses.push(clause.to_string());
        self.params.push(value.into());
        self
    }

    fn since(self, column: &str, since: Option<DateTime<Utc>>) -> Self {
        match since {
            Some(ts) => self.push(&format!("{column} >= ?"), ts),
            None => self,
        }
    }

    fn until(self, column: &str, until: Option<DateTime<Utc>>) -> Self {
        match until {
            Some(ts) => self.push(&format!("{column} <= ?"), ts),
            None => self,
        }
    }

    /// Exact workspace or anything beneath it
    fn workspace(mut self, column: &str, workspace: Option<&str>) -> Self {
        if let Some(ws) = workspace.filter(|w| !w.is_empty()) {
            let ws = ws.trim_end_matches('/');
            self.clauses
                .push(format!("({column} = ? OR {column} LIKE ?)"));
            self.params.push(ws.into());
            self.params.push(format!("{ws}/%").into());
        }
        self
    }

    fn run<R: Record>(&self, ex: &mut dyn Executor, order: &str, limit: Option<i64>) -> Result<Vec<R>> {
        let mut sql = format!("SELECT {} FROM {}", R::COLUMNS.join(", "), R::TABLE);
        if !self.clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
        let mut params = self.params.clone();
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            params.push(limit.into());
        }
        Ok(ex.query(&sql, &params)?.iter().map(R::from_row).collect())
    }
}

impl Store {
    pub fn get_recent_entries(&self, limit: Option<i64>) -> Result<Vec<Entry>> {
        let limit = clamp_limit(limit);
        self.read(|ex| Query::default().run(ex, "timestamp DESC, id DESC", Some(limit)))
    }

    pub fn get_recent_prompts(&self, limit: Option<i64>) -> Result<Vec<Prompt>> {
        let limit = clamp_limit(limit);
        self.read(|ex| Query::default().run(ex, "timestamp DESC, id DESC", Some(limit)))
    }

    pub fn get_recent_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let query = Query::default()
            .since("timestamp", filter.since)
            .workspace("workspace_path", filter.workspace.as_deref());
        let limit = clamp_limit(filter.limit);
        self.read(|ex| query.run(ex, "timestamp DESC, id DESC", Some(limit)))
    }

    pub fn get_terminal_history(&self, filter: &TerminalFilter) -> Result<Vec<TerminalCommand>> {
        let mut query = Query::default().workspace("workspace", filter.workspace.as_deref());
        if let Some(source) = filter.source.as_deref().filter(|s| !s.is_empty()) {
            query = query.push("source = ?", source);
        }
        if let Some(code) = filter.exit_code {
            query = query.push("exit_code = ?", code);
        }
        let limit = clamp_limit(filter.limit);
        self.read(|ex| query.run(ex, "timestamp DESC, id DESC", Some(limit)))
    }

    /// Entries with their linked prompt, newest first
    pub fn query_with_joins(&self, limit: Option<i64>) -> Result<Vec<EntryWithPrompt>> {
        let limit = clamp_limit(limit);
        let entry_cols = Entry::COLUMNS
            .iter()
            .map(|c| format!("e.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let prompt_cols = Prompt::COLUMNS
            .iter()
            .map(|c| format!("p.{c} AS p_{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {entry_cols}, {prompt_cols} FROM entries e \
             LEFT JOIN prompts p ON p.id = e.prompt_id \
             ORDER BY e.timestamp DESC, e.id DESC LIMIT ?"
        );
        self.read(|ex| {
            Ok(ex
                .query(&sql, &[limit.into()])?
                .iter()
                .map(|row| {
                    let joined = row.prefixed("p_");
                    let prompt = joined.int("id").map(|_| Prompt::from_row(&joined));
                    EntryWithPrompt {
                        entry: Entry::from_row(row),
                        prompt,
                    }
                })
                .collect())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Time windows (correlation, analytics)
    // ─────────────────────────────────────────────────────────────────────────

    pub fn entries_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        workspace: Option<&str>,
    ) -> Result<Vec<Entry>> {
        let query = Query::default()
            .since("timestamp", since)
            .until("timestamp", until)
            .workspace("workspace_path", workspace);
        self.read(|ex| query.run(ex, "timestamp ASC, id ASC", None))
    }

    pub fn prompts_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Prompt>> {
        let query = Query::default()
            .since("timestamp", since)
            .until("timestamp", until);
        self.read(|ex| query.run(ex, "timestamp ASC, id ASC", None))
    }

    pub fn events_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let query = Query::default()
            .since("timestamp", since)
            .until("timestamp", until);
        self.read(|ex| query.run(ex, "timestamp ASC, id ASC", None))
    }

    pub fn terminal_between(
        &self,
        since: Option<DateTime<Utc>>,
        workspace: Option<&str>,
    ) -> Result<Vec<TerminalCommand>> {
        let query = Query::default()
            .since("timestamp", since)
            .workspace("workspace", workspace);
        self.read(|ex| query.run(ex, "timestamp ASC, id ASC", None))
    }

    pub fn snapshots_between(
        &self,
        since: Option<DateTime<Utc>>,
        workspace: Option<&str>,
    ) -> Result<Vec<ContextSnapshot>> {
        let query = Query::default()
            .since("timestamp", since)
            .workspace("workspace_path", workspace);
        self.read(|ex| query.run(ex, "timestamp ASC, id ASC", None))
    }

    /// Turns of every conversation created since `since`
    pub fn turns_between(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ConversationTurn>> {
        let query = Query::default().since("created_at", since);
        self.read(|ex| query.run(ex, "created_at ASC, id ASC", None))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────────

    /// Turns of one conversation in `turn_index` order
    pub fn get_turns(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        let query = Query::default().push("conversation_id = ?", conversation_id);
        self.read(|ex| query.run(ex, "turn_index ASC", None))
    }

    pub fn count_turns(&self, conversation_id: &str) -> Result<i64> {
        self.read(|ex| count_turns(ex, conversation_id))
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationStats>> {
        self.get::<ConversationStats>(conversation_id)
    }

    /// Insert `turn` at the next free `turn_index` and refresh the rollup, in
    /// one transaction. A concurrent writer claiming the same index makes this
    /// fail with `ConstraintViolation`; the caller re-reads and retries.
    pub fn append_turn(
        &self,
        mut turn: ConversationTurn,
    ) -> Result<(ConversationTurn, ConversationStats)> {
        if turn.id.is_empty() {
            turn.id = new_id();
        }
        self.transaction(move |ex| {
            turn.turn_index = count_turns(ex, &turn.conversation_id)?;
            upsert(ex, &turn)?;
            let stats = rollup_conversation(ex, &turn.conversation_id)?;
            Ok((turn, stats))
        })
    }

    /// Recompute and store the rollup row for one conversation
    pub fn rollup_conversation(&self, conversation_id: &str) -> Result<ConversationStats> {
        self.transaction(|ex| rollup_conversation(ex, conversation_id))
    }
}

pub(crate) fn count_turns(ex: &mut dyn Executor, conversation_id: &str) -> Result<i64> {
    Ok(ex
        .query_one(
            "SELECT COUNT(*) AS n FROM conversation_turns WHERE conversation_id = ?",
            &[conversation_id.into()],
        )?
        .and_then(|r| r.int("n"))
        .unwrap_or(0))
}

/// Aggregate in Rust rather than SQL: `SUM` over `BIGINT` comes back as
/// `NUMERIC` on the networked backend.
pub(crate) fn rollup_conversation(
    ex: &mut dyn Executor,
    conversation_id: &str,
) -> Result<ConversationStats> {
    let turns: Vec<ConversationTurn> = Query::default()
        .push("conversation_id = ?", conversation_id)
        .run(ex, "turn_index ASC", None)?;

    let mut stats = ConversationStats {
        conversation_id: conversation_id.to_string(),
        turn_count: turns.len() as i64,
        updated_at: Some(crate::model::json::now()),
        ..Default::default()
    };
    for turn in &turns {
        match turn.role {
            TurnRole::User => stats.user_turns += 1,
            TurnRole::Assistant => stats.assistant_turns += 1,
        }
        stats.total_prompt_tokens += turn.prompt_tokens;
        stats.total_completion_tokens += turn.completion_tokens;
        stats.total_tokens += turn.total_tokens;
        stats.total_duration_ms += turn.request_duration_ms.unwrap_or(0);
        let at = turn.request_start_time.unwrap_or(turn.created_at);
        stats.first_turn_at = Some(stats.first_turn_at.map_or(at, |t| t.min(at)));
        stats.last_turn_at = Some(stats.last_turn_at.map_or(at, |t| t.max(at)));
    }
    upsert(ex, &stats)?;
    Ok(stats)
}
