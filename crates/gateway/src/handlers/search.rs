//! Knowledge base search handler

use axum::{extract::State, Json};
use condoportal_common::{
    auth::AuthContext,
    dify::{RetrievalQuery, RetrievalRecord},
    errors::Result,
    metrics,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

use crate::AppState;

/// Search request
#[derive(Debug, Deserialize, Validate)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 1000, message = "query must be 1-1000 characters"))]
    pub query: String,

    /// Maximum results to return (defaults to `dify.top_k`)
    #[validate(range(min = 1, max = 50, message = "top_k must be between 1 and 50"))]
    pub top_k: Option<u32>,

    /// Minimum relevance score (defaults to `dify.score_threshold`)
    #[validate(range(min = 0.0, max = 1.0, message = "score_threshold must be between 0 and 1"))]
    pub score_threshold: Option<f64>,
}

/// Search response
#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<RetrievalRecord>,
    pub total: usize,
    pub latency_ms: u64,
}

/// Retrieve matching segments from the knowledge base
pub async fn search(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    request.validate()?;
    let start = Instant::now();

    let query = RetrievalQuery {
        query: request.query.trim().to_string(),
        top_k: request.top_k.unwrap_or(state.config.dify.top_k),
        score_threshold: request.score_threshold.or(state.config.dify.score_threshold),
    };
    let results = state.knowledge_base.retrieve(&query).await?;

    let elapsed = start.elapsed();
    metrics::record_search(elapsed.as_secs_f64(), results.len());
    tracing::info!(
        uid = %auth.uid,
        results = results.len(),
        latency_ms = elapsed.as_millis() as u64,
        "Search completed"
    );

    Ok(Json(SearchResponse {
        query: query.query,
        total: results.len(),
        results,
        latency_ms: elapsed.as_millis() as u64,
    }))
}
