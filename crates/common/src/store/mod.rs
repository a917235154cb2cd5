//! Document record storage
//!
//! The gateway talks to a [`DocumentStore`]; which implementation backs it
//! is chosen by `storage.backend`.

mod firestore;
mod knowledge_base;
mod memory;

pub use firestore::FirestoreDocumentStore;
pub use knowledge_base::KnowledgeBaseDocumentStore;
pub use memory::MemoryDocumentStore;

use crate::auth::AuthContext;
use crate::errors::{AppError, Result};
use crate::models::{Document, DocumentPatch, DocumentType, NewDocument};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use validator::Validate;

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 100;

/// Filters and paging for listing documents
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ListQuery {
    pub building: Option<String>,

    #[serde(rename = "type")]
    pub doc_type: Option<DocumentType>,

    pub tag: Option<String>,

    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub limit: Option<u32>,

    /// Opaque token from a previous page
    pub page_token: Option<String>,
}

impl ListQuery {
    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    /// Whether a document passes the building/type/tag filters
    pub fn matches(&self, document: &Document) -> bool {
        if let Some(building) = self.building.as_deref().map(str::trim) {
            if !building.is_empty() && !document.building.eq_ignore_ascii_case(building) {
                return false;
            }
        }
        if let Some(doc_type) = self.doc_type {
            if document.doc_type != doc_type {
                return false;
            }
        }
        if let Some(tag) = self.tag.as_deref().map(|t| t.trim().to_lowercase()) {
            if !tag.is_empty() && !document.tags.iter().any(|t| *t == tag) {
                return false;
            }
        }
        true
    }
}

/// One page of documents
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListPage {
    pub documents: Vec<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Persistence for document records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short name used in logs and readiness output
    fn backend(&self) -> &'static str;

    /// Whether records carry file metadata. Uploads to a store that drops it
    /// keep no original file, since nothing could find it again to delete it.
    fn keeps_files(&self) -> bool {
        true
    }

    /// Whether `delete` also removes the knowledge base document
    fn deletes_knowledge_base_document(&self) -> bool {
        false
    }

    async fn create(&self, caller: &AuthContext, document: NewDocument) -> Result<Document>;

    async fn get(&self, caller: &AuthContext, id: &str) -> Result<Option<Document>>;

    async fn list(&self, caller: &AuthContext, query: &ListQuery) -> Result<ListPage>;

    /// Apply a patch; `DocumentNotFound` when the id is unknown
    async fn update(&self, caller: &AuthContext, id: &str, patch: DocumentPatch) -> Result<Document>;

    /// Delete a record; `false` when it did not exist
    async fn delete(&self, caller: &AuthContext, id: &str) -> Result<bool>;

    /// Fail unless every id refers to an existing document
    async fn ensure_exist(&self, caller: &AuthContext, ids: &[String]) -> Result<()> {
        for id in ids {
            if self.get(caller, id).await?.is_none() {
                return Err(AppError::invalid_field(
                    "related_documents",
                    format!("referenced document {} does not exist", id),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Uploader;
    use chrono::Utc;

    fn document(building: &str, doc_type: DocumentType, tags: &[&str]) -> Document {
        NewDocument {
            title: "Verbale".into(),
            building: building.into(),
            doc_type,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            uploaded_by: Uploader::default(),
            file: None,
            knowledge_base_id: None,
            ingestion: None,
            related_documents: vec![],
        }
        .into_document("d1".into(), Utc::now())
    }

    #[test]
    fn test_limit_defaults_and_clamps() {
        assert_eq!(ListQuery::default().limit(), DEFAULT_LIST_LIMIT);
        let query = ListQuery {
            limit: Some(500),
            ..ListQuery::default()
        };
        assert_eq!(query.limit(), MAX_LIST_LIMIT);
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_filters() {
        let doc = document("Via Roma 12", DocumentType::Minutes, &["assemblea"]);

        let by_building = ListQuery {
            building: Some("via roma 12".into()),
            ..ListQuery::default()
        };
        assert!(by_building.matches(&doc));

        let by_type = ListQuery {
            doc_type: Some(DocumentType::Invoice),
            ..ListQuery::default()
        };
        assert!(!by_type.matches(&doc));

        let by_tag = ListQuery {
            tag: Some(" Assemblea ".into()),
            ..ListQuery::default()
        };
        assert!(by_tag.matches(&doc));
    }
}
