//! Dify knowledge base and workflow clients
//!
//! The gateway and the ingestion pipeline only see the [`KnowledgeBase`]
//! and [`Workflow`] traits, so tests can swap in in-process doubles.

mod knowledge;
mod workflow;

pub use knowledge::KnowledgeBaseClient;
pub use workflow::{answer_from_outputs, WorkflowClient};

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document as Dify lists it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbDocument {
    pub id: String,
    pub name: String,
    /// Unix seconds
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub indexing_status: Option<String>,
    #[serde(default)]
    pub word_count: Option<u64>,
}

impl KbDocument {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// One page of the dataset's document list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KbDocumentPage {
    #[serde(default)]
    pub data: Vec<KbDocument>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

/// Text submitted to the knowledge base as one document
#[derive(Debug, Clone)]
pub struct TextDocument {
    pub name: String,
    pub text: String,
    /// Segmentation separator; Dify splits the text exactly here
    pub separator: String,
    pub max_tokens: u32,
}

/// Retrieval request
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub query: String,
    pub top_k: u32,
    pub score_threshold: Option<f64>,
}

/// A scored segment returned by retrieval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalRecord {
    pub segment_id: String,
    pub content: String,
    pub position: u32,
    pub document_id: String,
    pub document_name: String,
    pub score: f64,
}

/// Knowledge base operations used by the portal
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Create a document from text and return it
    async fn create_document_by_text(&self, document: TextDocument) -> Result<KbDocument>;

    async fn list_documents(
        &self,
        page: u32,
        limit: u32,
        keyword: Option<&str>,
    ) -> Result<KbDocumentPage>;

    async fn get_document(&self, id: &str) -> Result<Option<KbDocument>>;

    /// Delete a document; `false` when it did not exist
    async fn delete_document(&self, id: &str) -> Result<bool>;

    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalRecord>>;
}

/// Result of a finished workflow run
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub workflow_run_id: String,
    pub outputs: Map<String, Value>,
    pub elapsed_time: f64,
    pub total_tokens: u64,
}

/// Runs the question-answering workflow
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Run in blocking mode; non-succeeded runs are errors
    async fn run(&self, inputs: Map<String, Value>, user: &str) -> Result<WorkflowRun>;
}
