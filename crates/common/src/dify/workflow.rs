use super::{Workflow, WorkflowRun};
use crate::config::DifyConfig;
use crate::errors::{AppError, Result, Upstream};
use crate::upstream::{check_response, with_retry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Dify workflow app client (blocking mode)
#[derive(Clone)]
pub struct WorkflowClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry_budget: Duration,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    inputs: &'a Map<String, Value>,
    response_mode: &'static str,
    user: &'a str,
}

#[derive(Deserialize)]
struct RunResponse {
    workflow_run_id: String,
    data: RunData,
}

#[derive(Deserialize)]
struct RunData {
    status: String,
    #[serde(default)]
    outputs: Option<Map<String, Value>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    elapsed_time: Option<f64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl WorkflowClient {
    pub fn new(http: reqwest::Client, config: &DifyConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.workflow_api_key.clone(),
            retry_budget: Duration::from_secs(config.retry_budget_secs),
        }
    }

    async fn run_once(&self, inputs: &Map<String, Value>, user: &str) -> Result<RunResponse> {
        let response = self
            .http
            .post(format!("{}/workflows/run", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&RunRequest {
                inputs,
                response_mode: "blocking",
                user,
            })
            .send()
            .await?;
        let parsed = check_response(Upstream::Dify, response).await?.json().await?;
        Ok(parsed)
    }
}

#[async_trait]
impl Workflow for WorkflowClient {
    #[instrument(skip(self, inputs))]
    async fn run(&self, inputs: Map<String, Value>, user: &str) -> Result<WorkflowRun> {
        let response =
            with_retry(Upstream::Dify, self.retry_budget, || self.run_once(&inputs, user)).await?;
        into_run(response)
    }
}

fn into_run(response: RunResponse) -> Result<WorkflowRun> {
    let data = response.data;
    if data.status != "succeeded" {
        let message = data
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| format!("workflow finished with status {}", data.status));
        warn!(run_id = %response.workflow_run_id, status = %data.status, "Workflow run failed");
        return Err(AppError::upstream(Upstream::Dify, None, message));
    }

    info!(
        run_id = %response.workflow_run_id,
        elapsed = data.elapsed_time.unwrap_or_default(),
        tokens = data.total_tokens.unwrap_or_default(),
        "Workflow run succeeded"
    );

    Ok(WorkflowRun {
        workflow_run_id: response.workflow_run_id,
        outputs: data.outputs.unwrap_or_default(),
        elapsed_time: data.elapsed_time.unwrap_or_default(),
        total_tokens: data.total_tokens.unwrap_or_default(),
    })
}

/// Pick the answer out of workflow outputs
///
/// Uses `key` when it holds a string, otherwise the first string output.
pub fn answer_from_outputs(outputs: &Map<String, Value>, key: &str) -> Option<String> {
    if let Some(Value::String(answer)) = outputs.get(key) {
        return Some(answer.clone());
    }
    outputs.values().find_map(|v| v.as_str().map(String::from))
}
