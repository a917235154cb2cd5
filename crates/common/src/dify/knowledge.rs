use super::{KbDocument, KbDocumentPage, KnowledgeBase, RetrievalQuery, RetrievalRecord, TextDocument};
use crate::config::DifyConfig;
use crate::errors::{Result, Upstream};
use crate::upstream::{check_response, segment_url, was_not_processed, with_retry, with_retry_if};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Dify dataset API client bound to one dataset
#[derive(Clone)]
pub struct KnowledgeBaseClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    dataset_id: String,
    retry_budget: Duration,
}

#[derive(Serialize)]
struct CreateByTextRequest<'a> {
    name: &'a str,
    text: &'a str,
    indexing_technique: &'static str,
    process_rule: serde_json::Value,
}

#[derive(Deserialize)]
struct CreateByTextResponse {
    document: KbDocument,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Deserialize)]
struct RawRecord {
    segment: RawSegment,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Deserialize)]
struct RawSegment {
    id: String,
    #[serde(default)]
    position: u32,
    document_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    document: Option<RawSegmentDocument>,
}

#[derive(Deserialize)]
struct RawSegmentDocument {
    #[serde(default)]
    name: String,
}

impl From<RawRecord> for RetrievalRecord {
    fn from(record: RawRecord) -> Self {
        let segment = record.segment;
        RetrievalRecord {
            segment_id: segment.id,
            content: segment.content,
            position: segment.position,
            document_id: segment.document_id,
            document_name: segment.document.map(|d| d.name).unwrap_or_default(),
            score: record.score.unwrap_or_default(),
        }
    }
}

impl KnowledgeBaseClient {
    pub fn new(http: reqwest::Client, config: &DifyConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.dataset_api_key.clone(),
            dataset_id: config.dataset_id.clone(),
            retry_budget: Duration::from_secs(config.retry_budget_secs),
        }
    }

    fn dataset_url(&self, path: &[&str]) -> Result<Url> {
        let prefix = ["datasets", self.dataset_id.as_str()];
        segment_url(&self.base_url, prefix.iter().chain(path))
    }

    /// Custom process rule that splits exactly at our separator
    fn process_rule(separator: &str, max_tokens: u32) -> serde_json::Value {
        json!({
            "mode": "custom",
            "rules": {
                "pre_processing_rules": [
                    { "id": "remove_extra_spaces", "enabled": false },
                    { "id": "remove_urls_emails", "enabled": false }
                ],
                "segmentation": {
                    "separator": separator,
                    "max_tokens": max_tokens
                }
            }
        })
    }

    async fn create_once(&self, document: &TextDocument) -> Result<KbDocument> {
        let body = CreateByTextRequest {
            name: &document.name,
            text: &document.text,
            indexing_technique: "high_quality",
            process_rule: Self::process_rule(&document.separator, document.max_tokens),
        };
        let response = self
            .http
            .post(self.dataset_url(&["document", "create-by-text"])?)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let created: CreateByTextResponse = check_response(Upstream::Dify, response)
            .await?
            .json()
            .await?;
        Ok(created.document)
    }

    async fn list_once(&self, query: &[(&str, String)]) -> Result<KbDocumentPage> {
        let response = self
            .http
            .get(self.dataset_url(&["documents"])?)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;
        let page = check_response(Upstream::Dify, response).await?.json().await?;
        Ok(page)
    }

    async fn get_once(&self, id: &str) -> Result<Option<KbDocument>> {
        let response = self
            .http
            .get(self.dataset_url(&["documents", id])?)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document = check_response(Upstream::Dify, response).await?.json().await?;
        Ok(Some(document))
    }

    async fn delete_once(&self, id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(self.dataset_url(&["documents", id])?)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_response(Upstream::Dify, response).await?;
        Ok(true)
    }

    async fn retrieve_once(&self, body: &serde_json::Value) -> Result<Vec<RetrievalRecord>> {
        let response = self
            .http
            .post(self.dataset_url(&["retrieve"])?)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let parsed: RetrieveResponse = check_response(Upstream::Dify, response)
            .await?
            .json()
            .await?;
        Ok(parsed.records.into_iter().map(RetrievalRecord::from).collect())
    }
}

#[async_trait]
impl KnowledgeBase for KnowledgeBaseClient {
    #[instrument(skip(self, document), fields(name = %document.name, bytes = document.text.len()))]
    async fn create_document_by_text(&self, document: TextDocument) -> Result<KbDocument> {
        // A create that timed out may have been stored; resending would duplicate it
        let created = with_retry_if(Upstream::Dify, self.retry_budget, was_not_processed, || {
            self.create_once(&document)
        })
        .await?;
        info!(document_id = %created.id, "Knowledge base document created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn list_documents(
        &self,
        page: u32,
        limit: u32,
        keyword: Option<&str>,
    ) -> Result<KbDocumentPage> {
        let mut query = vec![("page", page.max(1).to_string()), ("limit", limit.to_string())];
        if let Some(keyword) = keyword.filter(|k| !k.trim().is_empty()) {
            query.push(("keyword", keyword.trim().to_string()));
        }
        with_retry(Upstream::Dify, self.retry_budget, || self.list_once(&query)).await
    }

    #[instrument(skip(self))]
    async fn get_document(&self, id: &str) -> Result<Option<KbDocument>> {
        with_retry(Upstream::Dify, self.retry_budget, || self.get_once(id)).await
    }

    #[instrument(skip(self))]
    async fn delete_document(&self, id: &str) -> Result<bool> {
        let deleted = with_retry(Upstream::Dify, self.retry_budget, || self.delete_once(id)).await?;
        debug!(document_id = %id, deleted, "Knowledge base delete");
        Ok(deleted)
    }

    #[instrument(skip(self, query), fields(top_k = query.top_k))]
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalRecord>> {
        let body = retrieve_body(query);
        with_retry(Upstream::Dify, self.retry_budget, || self.retrieve_once(&body)).await
    }
}

fn retrieve_body(query: &RetrievalQuery) -> serde_json::Value {
    json!({
        "query": query.query,
        "retrieval_model": {
            "search_method": "semantic_search",
            "reranking_enable": false,
            "top_k": query.top_k,
            "score_threshold_enabled": query.score_threshold.is_some(),
            "score_threshold": query.score_threshold.unwrap_or_default()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KnowledgeBaseClient {
        KnowledgeBaseClient::new(
            reqwest::Client::new(),
            &DifyConfig {
                base_url: "https://api.dify.ai/v1/".into(),
                dataset_id: "ds-1".into(),
                ..DifyConfig::default()
            },
        )
    }

    #[test]
    fn test_document_url_encodes_id() {
        let client = client();
        assert_eq!(
            client.dataset_url(&["documents", "doc-9"]).unwrap().as_str(),
            "https://api.dify.ai/v1/datasets/ds-1/documents/doc-9"
        );
        assert_eq!(
            client.dataset_url(&["documents", "../../ds-2/documents/doc-1"]).unwrap().path(),
            "/v1/datasets/ds-1/documents/..%2F..%2Fds-2%2Fdocuments%2Fdoc-1"
        );
        assert!(client.dataset_url(&["documents", ".."]).is_err());
    }

    #[test]
    fn test_process_rule_uses_separator() {
        let rule = KnowledgeBaseClient::process_rule("\n\n<<<chunk>>>\n\n", 1000);
        assert_eq!(rule["mode"], "custom");
        assert_eq!(rule["rules"]["segmentation"]["separator"], "\n\n<<<chunk>>>\n\n");
        assert_eq!(rule["rules"]["segmentation"]["max_tokens"], 1000);
    }

    #[test]
    fn test_retrieve_body_threshold() {
        let body = retrieve_body(&RetrievalQuery {
            query: "assemblea".into(),
            top_k: 3,
            score_threshold: None,
        });
        assert_eq!(body["retrieval_model"]["score_threshold_enabled"], false);
        assert_eq!(body["retrieval_model"]["top_k"], 3);

        let body = retrieve_body(&RetrievalQuery {
            query: "assemblea".into(),
            top_k: 3,
            score_threshold: Some(0.4),
        });
        assert_eq!(body["retrieval_model"]["score_threshold_enabled"], true);
    }

    #[test]
    fn test_retrieve_response_shape() {
        let parsed: RetrieveResponse = serde_json::from_str(
            r#"{
                "query": {"content": "spese ascensore"},
                "records": [{
                    "segment": {
                        "id": "seg-1", "position": 2, "document_id": "doc-9",
                        "content": "Le spese dell'ascensore...", "word_count": 4,
                        "document": {"id": "doc-9", "data_source_type": "upload_file", "name": "Regolamento"}
                    },
                    "score": 0.82
                }]
            }"#,
        )
        .unwrap();
        let records: Vec<RetrievalRecord> = parsed.records.into_iter().map(Into::into).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].document_name, "Regolamento");
        assert_eq!(records[0].position, 2);
        assert!((records[0].score - 0.82).abs() < f64::EPSILON);
    }

    #[test]
    fn test_document_list_shape() {
        let page: KbDocumentPage = serde_json::from_str(
            r#"{"data": [{"id": "d1", "name": "Verbale 2024", "created_at": 1714000000,
                          "indexing_status": "completed", "word_count": 812}],
                "has_more": false, "limit": 20, "total": 1, "page": 1}"#,
        )
        .unwrap();
        assert_eq!(page.data[0].name, "Verbale 2024");
        assert!(page.data[0].created_at_utc().is_some());
    }
}
