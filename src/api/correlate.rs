// Correlation endpoints - Prompt/event relationships and the file graph

use std::sync::Arc;

use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::{extract::Path, extract::Query, extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::correlate::{FileGraph, Mode, Scored};
use crate::error::Error;
use crate::model::{json, Event, Prompt};

#[derive(Debug, Default, Deserialize)]
pub struct RelatedQuery {
    /// `time` (default) or `sequence`
    pub mode: Option<String>,
}

impl RelatedQuery {
    fn mode(&self) -> Result<Mode, ApiError> {
        match self.mode.as_deref() {
            None | Some("") => Ok(Mode::Time),
            Some(raw) => Mode::parse(raw)
                .ok_or_else(|| Error::invalid(format!("unknown mode '{raw}'")).into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RelatedEventsResponse {
    pub prompt_id: i64,
    pub mode: Mode,
    pub events: Arc<Vec<Scored<Event>>>,
}

/// GET /api/prompts/:id/related-events - Events that followed a prompt, best first
///
/// Query params:
///   - mode: `time` (top 10 within 15 minutes) or `sequence` (position-based)
pub async fn get_related_events(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    query: Result<Query<RelatedQuery>, QueryRejection>,
) -> Result<Json<RelatedEventsResponse>, ApiError> {
    let Path(prompt_id) = id?;
    let Query(query) = query?;
    let mode = query.mode()?;
    let events = state
        .blocking(move |s| s.correlator.related_events(prompt_id, mode))
        .await?;
    Ok(Json(RelatedEventsResponse {
        prompt_id,
        mode,
        events,
    }))
}

#[derive(Debug, Serialize)]
pub struct RelatedPromptsResponse {
    pub event_id: String,
    pub mode: Mode,
    pub prompts: Arc<Vec<Scored<Prompt>>>,
}

/// GET /api/events/:id/related-prompts - Prompts that plausibly led to an event
pub async fn get_related_prompts(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    query: Result<Query<RelatedQuery>, QueryRejection>,
) -> Result<Json<RelatedPromptsResponse>, ApiError> {
    let Path(event_id) = id?;
    let Query(query) = query?;
    let mode = query.mode()?;
    let lookup = event_id.clone();
    let prompts = state
        .blocking(move |s| s.correlator.related_prompts(&lookup, mode))
        .await?;
    Ok(Json(RelatedPromptsResponse {
        event_id,
        mode,
        prompts,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileGraphQuery {
    pub workspace: Option<String>,
    #[serde(with = "json::timestamp_opt")]
    pub since: Option<DateTime<Utc>>,
}

/// GET /api/file-graph - Files as nodes, four kinds of relationship as edges
pub async fn get_file_graph(
    State(state): State<AppState>,
    query: Result<Query<FileGraphQuery>, QueryRejection>,
) -> Result<Json<Arc<FileGraph>>, ApiError> {
    let Query(query) = query?;
    let graph = state
        .blocking(move |s| {
            let workspace = query.workspace.as_deref().filter(|w| !w.is_empty());
            s.correlator.file_graph(workspace, query.since)
        })
        .await?;
    Ok(Json(graph))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use crate::model::{ChangeStats, Entry, EntrySource, Event, EventDetails, EventType, Prompt};
    use axum::http::StatusCode;

    fn change(state: &super::AppState, path: &str) -> String {
        let mut entry = Entry::code_change(path, "", "z".repeat(30), EntrySource::Filewatcher);
        entry.workspace_path = Some("/w".into());
        let event = Event::new(
            EventType::CodeChange,
            EventDetails::CodeChange(ChangeStats {
                file_path: path.into(),
                ..Default::default()
            }),
        );
        state.recorder.record_change(entry, event).unwrap().event.id
    }

    #[tokio::test]
    async fn test_related_both_directions() {
        let (_db, state) = state();
        let (prompt, _) = state
            .recorder
            .record_prompt(Prompt::pending("touch /w/a.py", "api"))
            .unwrap();
        let event_id = change(&state, "/w/a.py");
        let prompt_id = prompt.id.unwrap();

        let (status, body) = call(
            &state,
            "GET",
            &format!("/api/events/{event_id}/related-prompts"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "time");
        assert_eq!(body["prompts"][0]["item"]["id"], prompt_id);

        let (status, body) = call(
            &state,
            "GET",
            &format!("/api/prompts/{prompt_id}/related-events?mode=sequence"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "sequence");
        assert_eq!(body["events"][0]["item"]["id"], event_id.as_str());
    }

    #[tokio::test]
    async fn test_bad_mode_and_id() {
        let (_db, state) = state();
        let (status, _) = call(&state, "GET", "/api/prompts/1/related-events?mode=vibes", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&state, "GET", "/api/prompts/abc/related-events", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&state, "GET", "/api/prompts/77/related-events", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_file_graph_endpoint() {
        let (_db, state) = state();
        change(&state, "/w/a.py");
        change(&state, "/w/b.py");
        let (status, body) = call(&state, "GET", "/api/file-graph?workspace=/w", None).await;
        assert_eq!(status, StatusCode::OK);
        let edges = body["edges"].as_array().unwrap();
        assert!(edges.iter().any(|e| e["type"] == "EDIT_SEQUENCE"));
        assert_eq!(body["nodes"].as_array().unwrap().len(), 2);
    }
}
