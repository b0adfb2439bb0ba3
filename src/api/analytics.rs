// Analytics endpoints - Aggregates over a time window

use axum::extract::rejection::QueryRejection;
use axum::{extract::Query, extract::State, Json};

use super::{ApiError, AppState};
use crate::analytics::{AnalyticsQuery, ContextAnalytics, ErrorAnalytics, ProductivityAnalytics};

/// GET /api/analytics/context - Context window usage and the files fed to models
///
/// Query params:
///   - since: Lower time bound (default: all time)
///   - workspace: Workspace path
pub async fn get_context_analytics(
    State(state): State<AppState>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Json<ContextAnalytics>, ApiError> {
    let Query(query) = query?;
    let report = state.blocking(move |s| s.analytics.context(&query)).await?;
    Ok(Json(report))
}

/// GET /api/analytics/errors - Failing terminal commands and error events
pub async fn get_error_analytics(
    State(state): State<AppState>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Json<ErrorAnalytics>, ApiError> {
    let Query(query) = query?;
    let report = state.blocking(move |s| s.analytics.errors(&query)).await?;
    Ok(Json(report))
}

/// GET /api/analytics/productivity - Output per day, attribution rate, model latency
pub async fn get_productivity_analytics(
    State(state): State<AppState>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Json<ProductivityAnalytics>, ApiError> {
    let Query(query) = query?;
    let report = state.blocking(move |s| s.analytics.productivity(&query)).await?;
    Ok(Json(report))
}
