//! Aggregated statistics for the `/api/analytics/*` endpoints
//!
//! ```text
//! Store ──*_between(since)──→ rows ──→ context()      → ContextAnalytics
//!                                  ├──→ errors()       → ErrorAnalytics
//!                                  └──→ productivity() → ProductivityAnalytics
//! ```
//!
//! The aggregation functions are pure so they can be tested on hand-built
//! rows; `Analytics` only loads the window and hands the rows over.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{json, ConversationTurn, Entry, Event, EventDetails, Prompt, PromptStatus, TerminalCommand, TurnRole};
use crate::storage::Store;

/// Length of the "most frequent" lists
pub const TOP_N: usize = 10;

/// Window shared by all analytics endpoints
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalyticsQuery {
    #[serde(with = "json::timestamp_opt")]
    pub since: Option<DateTime<Utc>>,
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked {
    pub name: String,
    pub count: u64,
}

/// Most frequent names first, ties broken alphabetically
fn top_n<'a>(names: impl Iterator<Item = &'a str>, n: usize) -> Vec<Ranked> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }
    let mut ranked: Vec<Ranked> = counts
        .into_iter()
        .map(|(name, count)| Ranked {
            name: name.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(n);
    ranked
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0u64), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn day(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

fn in_workspace(path: Option<&str>, workspace: Option<&str>) -> bool {
    match workspace.filter(|w| !w.is_empty()) {
        None => true,
        Some(ws) => {
            let ws = ws.trim_end_matches('/');
            path.is_some_and(|p| p == ws || p.starts_with(&format!("{ws}/")))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context usage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextAnalytics {
    pub prompts: u64,
    pub avg_context_usage: Option<f64>,
    pub avg_context_file_count: Option<f64>,
    /// Prompts whose context usage is above 80%
    pub high_usage_prompts: u64,
    pub top_context_files: Vec<Ranked>,
    pub prompts_by_model: BTreeMap<String, u64>,
}

pub fn context(prompts: &[Prompt]) -> ContextAnalytics {
    let mut by_model = BTreeMap::new();
    for p in prompts {
        let model = p.model_name.clone().unwrap_or_else(|| "unknown".to_string());
        *by_model.entry(model).or_default() += 1;
    }
    ContextAnalytics {
        prompts: prompts.len() as u64,
        avg_context_usage: mean(prompts.iter().filter_map(|p| p.context_usage)),
        avg_context_file_count: mean(
            prompts
                .iter()
                .filter_map(|p| p.context_file_count)
                .map(|n| n as f64),
        ),
        high_usage_prompts: prompts
            .iter()
            .filter(|p| p.context_usage.is_some_and(|u| u > 80.0))
            .count() as u64,
        top_context_files: top_n(
            prompts.iter().flat_map(|p| p.context_files.iter().map(String::as_str)),
            TOP_N,
        ),
        prompts_by_model: by_model,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorAnalytics {
    pub commands: u64,
    pub failed_commands: u64,
    /// `failed_commands / commands`, 0 when nothing ran
    pub failure_rate: f64,
    pub top_failing_commands: Vec<Ranked>,
    /// Events whose type names an error, plus failed command events
    pub error_events: u64,
    pub error_events_by_type: BTreeMap<String, u64>,
}

fn is_error_event(event: &Event) -> bool {
    match &event.details {
        EventDetails::TerminalCommand(run) => run.exit_code.is_some_and(|c| c != 0),
        _ => event.event_type.as_str().contains("error"),
    }
}

pub fn errors(commands: &[TerminalCommand], events: &[Event]) -> ErrorAnalytics {
    let failed: Vec<&TerminalCommand> = commands.iter().filter(|c| c.failed()).collect();
    let mut by_type = BTreeMap::new();
    for event in events.iter().filter(|e| is_error_event(e)) {
        *by_type
            .entry(event.event_type.as_str().to_string())
            .or_default() += 1;
    }
    ErrorAnalytics {
        commands: commands.len() as u64,
        failed_commands: failed.len() as u64,
        failure_rate: if commands.is_empty() {
            0.0
        } else {
            failed.len() as f64 / commands.len() as f64
        },
        top_failing_commands: top_n(failed.iter().map(|c| c.command.trim()), TOP_N),
        error_events: by_type.values().sum(),
        error_events_by_type: by_type,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Productivity
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductivityAnalytics {
    pub entries: u64,
    pub prompts: u64,
    pub entries_per_day: BTreeMap<String, u64>,
    pub prompts_per_day: BTreeMap<String, u64>,
    pub lines_added: i64,
    pub lines_removed: i64,
    /// Share of settled prompts (linked or captured) that led to code
    pub linked_ratio: f64,
    pub assistant_turns: u64,
    pub avg_time_to_first_token_ms: Option<f64>,
    pub avg_request_duration_ms: Option<f64>,
}

pub fn productivity(
    entries: &[Entry],
    prompts: &[Prompt],
    events: &[Event],
    turns: &[ConversationTurn],
) -> ProductivityAnalytics {
    let mut out = ProductivityAnalytics {
        entries: entries.len() as u64,
        prompts: prompts.len() as u64,
        ..Default::default()
    };
    for e in entries {
        *out.entries_per_day.entry(day(&e.timestamp)).or_default() += 1;
    }
    for p in prompts {
        *out.prompts_per_day.entry(day(&p.timestamp)).or_default() += 1;
    }
    for event in events {
        if let EventDetails::CodeChange(stats) = &event.details {
            out.lines_added += stats.lines_added;
            out.lines_removed += stats.lines_removed;
        }
    }

    let linked = prompts
        .iter()
        .filter(|p| p.status == PromptStatus::Linked)
        .count();
    let settled = prompts
        .iter()
        .filter(|p| p.status != PromptStatus::Pending)
        .count();
    if settled > 0 {
        out.linked_ratio = linked as f64 / settled as f64;
    }

    let assistant: Vec<&ConversationTurn> = turns
        .iter()
        .filter(|t| t.role == TurnRole::Assistant)
        .collect();
    out.assistant_turns = assistant.len() as u64;
    out.avg_time_to_first_token_ms =
        mean(assistant.iter().filter_map(|t| t.time_to_first_token_ms).map(|v| v as f64));
    out.avg_request_duration_ms =
        mean(assistant.iter().filter_map(|t| t.request_duration_ms).map(|v| v as f64));
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Loader
// ─────────────────────────────────────────────────────────────────────────────

/// Loads a window from the store and aggregates it. Blocking.
#[derive(Clone)]
pub struct Analytics {
    store: Store,
}

impl Analytics {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn prompts(&self, q: &AnalyticsQuery) -> Result<Vec<Prompt>> {
        let workspace = q.workspace.as_deref();
        Ok(self
            .store
            .prompts_between(q.since, None)?
            .into_iter()
            .filter(|p| in_workspace(p.workspace_path.as_deref(), workspace))
            .collect())
    }

    fn events(&self, q: &AnalyticsQuery) -> Result<Vec<Event>> {
        let workspace = q.workspace.as_deref();
        Ok(self
            .store
            .events_between(q.since, None)?
            .into_iter()
            .filter(|e| in_workspace(e.workspace_path.as_deref(), workspace))
            .collect())
    }

    pub fn context(&self, q: &AnalyticsQuery) -> Result<ContextAnalytics> {
        Ok(context(&self.prompts(q)?))
    }

    pub fn errors(&self, q: &AnalyticsQuery) -> Result<ErrorAnalytics> {
        let commands = self.store.terminal_between(q.since, q.workspace.as_deref())?;
        Ok(errors(&commands, &self.events(q)?))
    }

    pub fn productivity(&self, q: &AnalyticsQuery) -> Result<ProductivityAnalytics> {
        let entries = self.store.entries_between(q.since, None, q.workspace.as_deref())?;
        let turns = self.store.turns_between(q.since)?;
        Ok(productivity(&entries, &self.prompts(q)?, &self.events(q)?, &turns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeStats, CommandRun, EventType};

    fn prompt(model: Option<&str>, usage: Option<f64>, files: &[&str]) -> Prompt {
        Prompt {
            model_name: model.map(str::to_string),
            context_usage: usage,
            context_file_count: Some(files.len() as i64),
            context_files: files.iter().map(|f| f.to_string()).collect(),
            ..Prompt::pending("p", "api")
        }
    }

    #[test]
    fn test_context_averages_and_rankings() {
        let prompts = vec![
            prompt(Some("sonnet"), Some(50.0), &["a.rs", "b.rs"]),
            prompt(Some("sonnet"), Some(90.0), &["a.rs"]),
            prompt(None, None, &[]),
        ];
        let ctx = context(&prompts);
        assert_eq!(ctx.prompts, 3);
        assert_eq!(ctx.avg_context_usage, Some(70.0));
        assert_eq!(ctx.avg_context_file_count, Some(1.0));
        assert_eq!(ctx.high_usage_prompts, 1);
        assert_eq!(ctx.top_context_files[0], Ranked { name: "a.rs".into(), count: 2 });
        assert_eq!(ctx.prompts_by_model["sonnet"], 2);
        assert_eq!(ctx.prompts_by_model["unknown"], 1);
    }

    #[test]
    fn test_context_of_nothing() {
        let ctx = context(&[]);
        assert_eq!(ctx.avg_context_usage, None);
        assert!(ctx.top_context_files.is_empty());
    }

    #[test]
    fn test_errors_rate_and_events() {
        let mut ok = TerminalCommand::new("cargo build", "hook");
        ok.exit_code = Some(0);
        let mut bad = TerminalCommand::new("cargo test", "hook");
        bad.exit_code = Some(101);
        let commands = vec![ok, bad.clone(), bad];

        let failed_run = Event::new(
            EventType::TerminalCommand,
            EventDetails::TerminalCommand(CommandRun {
                command: "make".into(),
                exit_code: Some(2),
                duration_ms: None,
            }),
        );
        let build_error = Event::new(EventType::Other("build_error".into()), EventDetails::default());
        let benign = Event::new(EventType::Activity, EventDetails::default());

        let report = errors(&commands, &[failed_run, build_error, benign]);
        assert_eq!(report.failed_commands, 2);
        assert!((report.failure_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.top_failing_commands[0].name, "cargo test");
        assert_eq!(report.error_events, 2);
        assert_eq!(report.error_events_by_type["build_error"], 1);
    }

    #[test]
    fn test_productivity_rollup() {
        let entries = vec![Entry::code_change("/w/a.py", "", "x", crate::model::EntrySource::Filewatcher)];
        let mut linked = Prompt::pending("a", "api");
        linked.status = PromptStatus::Linked;
        let mut captured = Prompt::pending("b", "api");
        captured.status = PromptStatus::Captured;
        let pending = Prompt::pending("c", "api");

        let change = Event::new(
            EventType::CodeChange,
            EventDetails::CodeChange(ChangeStats {
                lines_added: 7,
                lines_removed: 2,
                ..Default::default()
            }),
        );
        let turns = vec![
            ConversationTurn {
                role: TurnRole::Assistant,
                time_to_first_token_ms: Some(200),
                request_duration_ms: Some(800),
                ..Default::default()
            },
            ConversationTurn {
                role: TurnRole::Assistant,
                time_to_first_token_ms: Some(400),
                request_duration_ms: None,
                ..Default::default()
            },
            ConversationTurn::default(),
        ];

        let report = productivity(&entries, &[linked, captured, pending], &[change], &turns);
        assert_eq!(report.entries, 1);
        assert_eq!(report.prompts, 3);
        assert_eq!(report.lines_added, 7);
        assert_eq!(report.lines_removed, 2);
        assert!((report.linked_ratio - 0.5).abs() < 1e-9);
        assert_eq!(report.assistant_turns, 2);
        assert_eq!(report.avg_time_to_first_token_ms, Some(300.0));
        assert_eq!(report.avg_request_duration_ms, Some(800.0));
        assert_eq!(report.entries_per_day.values().sum::<u64>(), 1);
    }

    #[test]
    fn test_workspace_prefix_filter() {
        assert!(in_workspace(Some("/w/app"), Some("/w")));
        assert!(in_workspace(Some("/w"), Some("/w/")));
        assert!(!in_workspace(Some("/work"), Some("/w")));
        assert!(!in_workspace(None, Some("/w")));
        assert!(in_workspace(None, None));
    }
}
