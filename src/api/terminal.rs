// Terminal endpoints - Command history and shell hook reports

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::{extract::Query, extract::State, Json};
use serde::Serialize;

use super::{success, ApiError, AppState, Success};
use crate::capture::terminal::{self, HookReport};
use crate::model::TerminalCommand;
use crate::storage::TerminalFilter;

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    /// Most recent first
    pub commands: Vec<TerminalCommand>,
}

/// GET /api/terminal/history - Returns captured commands
///
/// Query params:
///   - limit: Max commands to return (default: 100)
///   - source: `history`, `hook` or `import`
///   - workspace: Workspace path
///   - exitCode: Only commands that exited with this code
pub async fn get_terminal_history(
    State(state): State<AppState>,
    query: Result<Query<TerminalFilter>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(filter) = query?;
    let commands = state
        .blocking(move |s| s.store().get_terminal_history(&filter))
        .await?;
    Ok(Json(HistoryResponse {
        count: commands.len(),
        commands,
    }))
}

#[derive(Debug, Serialize)]
pub struct Recorded {
    pub id: String,
    pub seq: u64,
}

/// POST /api/terminal/commands - Record one command reported by a shell hook
pub async fn post_terminal_command(
    State(state): State<AppState>,
    body: Result<Json<HookReport>, JsonRejection>,
) -> Result<Json<Success<Recorded>>, ApiError> {
    let Json(report) = body?;
    let (command, seq) = state
        .blocking(move |s| terminal::record_hook(&s.recorder, report))
        .await?;
    Ok(success(Recorded {
        id: command.id,
        seq,
    }))
}
