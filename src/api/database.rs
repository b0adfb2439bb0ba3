// Database export / import endpoints

use axum::extract::rejection::JsonRejection;
use axum::{extract::State, Json};

use super::{success, ApiError, AppState, Success};
use crate::backup::{self, Export};
use crate::capture::import::{self, ImportReport, ImportRequest};

/// GET /api/export/database - Full JSON snapshot of the exported tables
///
/// Shape: `{metadata, entries, prompts, events, terminal_commands,
/// context_snapshots, workspaces, stats}`
pub async fn export_database(State(state): State<AppState>) -> Result<Json<Export>, ApiError> {
    let export = state.blocking(|s| backup::export(s.store())).await?;
    tracing::info!(
        entries = export.data.entries.len(),
        prompts = export.data.prompts.len(),
        events = export.data.events.len(),
        "database exported"
    );
    Ok(Json(export))
}

/// POST /api/import/database - Import an export or backup file
///
/// Body: `{data, options: {overwrite, dryRun, workspaceFilter, mergeStrategy}}`
/// where `mergeStrategy` is one of `skip` (default), `overwrite`, `merge`, `append`.
pub async fn import_database(
    State(state): State<AppState>,
    body: Result<Json<ImportRequest>, JsonRejection>,
) -> Result<Json<Success<ImportReport>>, ApiError> {
    let Json(request) = body?;
    let report = state
        .blocking(move |s| import::import_request(s.store(), Some(s.correlator.cache().as_ref()), request))
        .await?;
    Ok(success(report))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use crate::model::{Entry, EntrySource};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_export_then_import_elsewhere() {
        let (_src_db, src) = state();
        let mut entry = Entry::code_change("/w/a.py", "", "print(1)", EntrySource::Manual);
        entry.id = "42".into();
        src.recorder.record_entry(entry).unwrap();

        let (status, export) = call(&src, "GET", "/api/export/database", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(export["entries"][0]["id"], "42");
        assert!(export["metadata"]["schema_version"].is_number());

        let (_dst_db, dst) = state();
        let (status, body) = call(
            &dst,
            "POST",
            "/api/import/database",
            Some(json!({"data": export, "options": {"dryRun": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dryRun"], true);
        assert_eq!(body["stats"]["entries"]["imported"], 1);
        assert!(dst.store().get_entry("42").is_err());

        let (_, body) = call(
            &dst,
            "POST",
            "/api/import/database",
            Some(json!({"data": export, "options": {"mergeStrategy": "skip"}})),
        )
        .await;
        assert_eq!(body["success"], true);
        assert_eq!(dst.store().get_entry("42").unwrap().after_code.as_deref(), Some("print(1)"));

        let (_, body) = call(
            &dst,
            "POST",
            "/api/import/database",
            Some(json!({"data": export})),
        )
        .await;
        assert_eq!(body["stats"]["entries"]["skipped"], 1);
        assert_eq!(body["stats"]["entries"]["imported"], 0);
    }

    #[tokio::test]
    async fn test_import_without_data_is_rejected() {
        let (_db, state) = state();
        let (status, _) = call(&state, "POST", "/api/import/database", Some(json!({"options": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_rejected() {
        let (_db, state) = state();
        let (status, _) = call(
            &state,
            "POST",
            "/api/import/database",
            Some(json!({"data": {}, "options": {"mergeStrategy": "clobber"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
