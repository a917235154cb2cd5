//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use condoportal_common::errors::{AppError, Result};
use serde::Serialize;
use std::time::Instant;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub config: CheckResult,
    pub knowledge_base: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn up(latency_ms: Option<u64>) -> Self {
        Self {
            status: "up".to_string(),
            latency_ms,
            error: None,
        }
    }

    fn down(error: String) -> Self {
        Self {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(error),
        }
    }

    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

/// Liveness check: always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: condoportal_common::VERSION,
    })
}

/// Readiness check: configuration and knowledge base reachability
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let config_check = match state.config.validate() {
        Ok(()) => CheckResult::up(None),
        Err(problems) => CheckResult::down(problems.join("; ")),
    };

    let start = Instant::now();
    let kb_check = match state.knowledge_base.list_documents(1, 1, None).await {
        Ok(_) => CheckResult::up(Some(start.elapsed().as_millis() as u64)),
        Err(e) => CheckResult::down(e.to_string()),
    };

    let all_healthy = config_check.is_up() && kb_check.is_up();
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks {
                config: config_check,
                knowledge_base: kb_check,
            },
        }),
    )
}

/// Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> Result<String> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or_else(|| AppError::NotFound {
            resource_type: "endpoint".to_string(),
            id: "metrics".to_string(),
        })
}
