use super::{DocumentStore, ListPage, ListQuery};
use crate::auth::AuthContext;
use crate::dify::{KbDocument, KnowledgeBase};
use crate::errors::{AppError, Result};
use crate::models::{Document, DocumentPatch, DocumentType, NewDocument, Uploader};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Records derived from the knowledge base's own document list
///
/// Only the id, the name (as title) and the creation time survive; every
/// other field comes back with its default.
pub struct KnowledgeBaseDocumentStore {
    knowledge_base: Arc<dyn KnowledgeBase>,
}

impl KnowledgeBaseDocumentStore {
    pub fn new(knowledge_base: Arc<dyn KnowledgeBase>) -> Self {
        Self { knowledge_base }
    }
}

fn to_document(kb: KbDocument) -> Document {
    let created_at = kb.created_at_utc().unwrap_or_else(Utc::now);
    Document {
        knowledge_base_id: Some(kb.id.clone()),
        id: kb.id,
        title: kb.name,
        building: String::new(),
        doc_type: DocumentType::Other,
        tags: Vec::new(),
        uploaded_by: Uploader::default(),
        file: None,
        ingestion: None,
        related_documents: Vec::new(),
        created_at,
        updated_at: created_at,
    }
}

#[async_trait]
impl DocumentStore for KnowledgeBaseDocumentStore {
    fn backend(&self) -> &'static str {
        "knowledge_base"
    }

    fn keeps_files(&self) -> bool {
        false
    }

    fn deletes_knowledge_base_document(&self) -> bool {
        true
    }

    async fn create(&self, _caller: &AuthContext, document: NewDocument) -> Result<Document> {
        let document = document.normalized()?;
        let kb_id = document.knowledge_base_id.clone().ok_or_else(|| {
            AppError::invalid_field(
                "file",
                "the knowledge_base storage backend needs an ingested file",
            )
        })?;
        Ok(document.into_document(kb_id, Utc::now()))
    }

    async fn get(&self, _caller: &AuthContext, id: &str) -> Result<Option<Document>> {
        Ok(self.knowledge_base.get_document(id).await?.map(to_document))
    }

    async fn list(&self, _caller: &AuthContext, query: &ListQuery) -> Result<ListPage> {
        let page = match query.page_token.as_deref() {
            Some(token) => token
                .parse::<u32>()
                .ok()
                .filter(|&page| page >= 1)
                .ok_or_else(|| AppError::invalid_field("page_token", "malformed page token"))?,
            None => 1,
        };

        let listing = self
            .knowledge_base
            .list_documents(page, query.limit(), None)
            .await?;

        Ok(ListPage {
            documents: listing
                .data
                .into_iter()
                .map(to_document)
                .filter(|d| query.matches(d))
                .collect(),
            next_page_token: listing
                .has_more
                .then(|| page.checked_add(1))
                .flatten()
                .map(|next| next.to_string()),
        })
    }

    async fn update(&self, _caller: &AuthContext, id: &str, _patch: DocumentPatch) -> Result<Document> {
        Err(AppError::Validation {
            message: format!(
                "document {} cannot be edited: the knowledge_base storage backend keeps no metadata",
                id
            ),
            field: None,
        })
    }

    async fn delete(&self, _caller: &AuthContext, id: &str) -> Result<bool> {
        self.knowledge_base.delete_document(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dify::{KbDocumentPage, RetrievalQuery, RetrievalRecord, TextDocument};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeKnowledgeBase {
        documents: Mutex<Vec<KbDocument>>,
        /// Report another page after every listing
        endless: bool,
    }

    #[async_trait]
    impl KnowledgeBase for FakeKnowledgeBase {
        async fn create_document_by_text(&self, document: TextDocument) -> Result<KbDocument> {
            let created = KbDocument {
                id: format!("kb-{}", self.documents.lock().await.len() + 1),
                name: document.name,
                created_at: Some(1_714_000_000),
                indexing_status: Some("waiting".into()),
                word_count: None,
            };
            self.documents.lock().await.push(created.clone());
            Ok(created)
        }

        async fn list_documents(&self, page: u32, limit: u32, _keyword: Option<&str>) -> Result<KbDocumentPage> {
            let documents = self.documents.lock().await;
            let start = (page as usize - 1) * limit as usize;
            let data: Vec<KbDocument> = documents.iter().skip(start).take(limit as usize).cloned().collect();
            Ok(KbDocumentPage {
                has_more: self.endless || start + data.len() < documents.len(),
                total: documents.len() as u64,
                page,
                limit,
                data,
            })
        }

        async fn get_document(&self, id: &str) -> Result<Option<KbDocument>> {
            Ok(self.documents.lock().await.iter().find(|d| d.id == id).cloned())
        }

        async fn delete_document(&self, id: &str) -> Result<bool> {
            let mut documents = self.documents.lock().await;
            let before = documents.len();
            documents.retain(|d| d.id != id);
            Ok(documents.len() != before)
        }

        async fn retrieve(&self, _query: &RetrievalQuery) -> Result<Vec<RetrievalRecord>> {
            Ok(vec![])
        }
    }

    fn caller() -> AuthContext {
        AuthContext {
            uid: "u1".into(),
            email: None,
            token: "t".into(),
        }
    }

    async fn seeded(count: usize) -> (Arc<FakeKnowledgeBase>, KnowledgeBaseDocumentStore) {
        let kb = Arc::new(FakeKnowledgeBase::default());
        for i in 0..count {
            kb.create_document_by_text(TextDocument {
                name: format!("Documento {}", i),
                text: "testo".into(),
                separator: "\n\n".into(),
                max_tokens: 1000,
            })
            .await
            .unwrap();
        }
        let store = KnowledgeBaseDocumentStore::new(kb.clone());
        (kb, store)
    }

    #[tokio::test]
    async fn test_get_maps_reduced_record() {
        let (_, store) = seeded(1).await;
        let doc = store.get(&caller(), "kb-1").await.unwrap().unwrap();
        assert_eq!(doc.title, "Documento 0");
        assert_eq!(doc.knowledge_base_id.as_deref(), Some("kb-1"));
        assert_eq!(doc.doc_type, DocumentType::Other);
        assert_eq!(doc.created_at.timestamp(), 1_714_000_000);
    }

    #[tokio::test]
    async fn test_list_pages_by_number() {
        let (_, store) = seeded(3).await;
        let query = ListQuery {
            limit: Some(2),
            ..ListQuery::default()
        };
        let first = store.list(&caller(), &query).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_page_token_bounds() {
        let store = KnowledgeBaseDocumentStore::new(Arc::new(FakeKnowledgeBase {
            endless: true,
            ..FakeKnowledgeBase::default()
        }));
        let query = |token: &str| ListQuery {
            page_token: Some(token.to_string()),
            ..ListQuery::default()
        };

        let err = store.list(&caller(), &query("0")).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        assert!(store.list(&caller(), &query("-1")).await.is_err());

        let last = store.list(&caller(), &query("4294967295")).await.unwrap();
        assert!(last.next_page_token.is_none());

        let middle = store.list(&caller(), &query("7")).await.unwrap();
        assert_eq!(middle.next_page_token.as_deref(), Some("8"));
    }

    #[tokio::test]
    async fn test_drops_file_metadata() {
        let (_, store) = seeded(0).await;
        assert!(!store.keeps_files());
        assert!(store.deletes_knowledge_base_document());
    }

    #[tokio::test]
    async fn test_create_requires_ingested_file() {
        let (_, store) = seeded(0).await;
        let err = store
            .create(
                &caller(),
                NewDocument {
                    title: "Senza file".into(),
                    building: "Via Roma 12".into(),
                    doc_type: DocumentType::Other,
                    tags: vec![],
                    uploaded_by: Uploader::default(),
                    file: None,
                    knowledge_base_id: None,
                    ingestion: None,
                    related_documents: vec![],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_is_rejected_and_delete_forwards() {
        let (kb, store) = seeded(1).await;
        assert!(store.update(&caller(), "kb-1", DocumentPatch::default()).await.is_err());
        assert!(store.delete(&caller(), "kb-1").await.unwrap());
        assert!(kb.get_document("kb-1").await.unwrap().is_none());
    }
}
