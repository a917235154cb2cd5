//! Question answering through the Dify workflow

use axum::{extract::State, Json};
use condoportal_common::{
    auth::AuthContext,
    dify::answer_from_outputs,
    errors::{AppError, Result, Upstream},
    metrics,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;
use validator::Validate;

use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct AskRequest {
    #[validate(length(min = 1, max = 2000, message = "question must be 1-2000 characters"))]
    pub question: String,

    /// Restrict the answer to one building's documents
    #[validate(length(max = 120, message = "building must be at most 120 characters"))]
    pub building: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub workflow_run_id: String,
    pub elapsed_time: f64,
    pub total_tokens: u64,
}

/// Workflow inputs: `question`, plus `building` when given
fn workflow_inputs(request: &AskRequest) -> Map<String, Value> {
    let mut inputs = Map::new();
    inputs.insert("question".to_string(), Value::String(request.question.trim().to_string()));
    if let Some(building) = request.building.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        inputs.insert("building".to_string(), Value::String(building.to_string()));
    }
    inputs
}

/// Run the workflow in blocking mode and return its answer
pub async fn ask(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>> {
    request.validate()?;
    let start = Instant::now();

    let run = match state.workflow.run(workflow_inputs(&request), &auth.uid).await {
        Ok(run) => run,
        Err(e) => {
            metrics::record_question(start.elapsed().as_secs_f64(), None);
            return Err(e);
        }
    };
    metrics::record_question(start.elapsed().as_secs_f64(), Some(run.total_tokens));

    let answer = answer_from_outputs(&run.outputs, &state.config.dify.answer_output_key)
        .ok_or_else(|| AppError::upstream(Upstream::Dify, None, "workflow returned no answer"))?;

    Ok(Json(AskResponse {
        answer,
        workflow_run_id: run.workflow_run_id,
        elapsed_time: run.elapsed_time,
        total_tokens: run.total_tokens,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_inputs() {
        let request = AskRequest {
            question: " Quando scade l'assicurazione? ".to_string(),
            building: Some("  ".to_string()),
        };
        let inputs = workflow_inputs(&request);
        assert_eq!(inputs["question"], "Quando scade l'assicurazione?");
        assert!(!inputs.contains_key("building"));

        let request = AskRequest {
            question: "Chi è l'amministratore?".to_string(),
            building: Some("Via Roma 1".to_string()),
        };
        assert_eq!(workflow_inputs(&request)["building"], "Via Roma 1");
    }
}
