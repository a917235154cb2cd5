use super::{DocumentStore, ListPage, ListQuery};
use crate::auth::AuthContext;
use crate::errors::{AppError, Result};
use crate::models::{normalize_related, Document, DocumentPatch, NewDocument};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process store; page tokens are offsets into the sorted list
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, caller: &AuthContext, document: NewDocument) -> Result<Document> {
        let document = document.normalized()?;
        self.ensure_exist(caller, &document.related_documents).await?;

        let document = document.into_document(Uuid::new_v4().to_string(), Utc::now());
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document.clone());
        Ok(document)
    }

    async fn get(&self, _caller: &AuthContext, id: &str) -> Result<Option<Document>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn list(&self, _caller: &AuthContext, query: &ListQuery) -> Result<ListPage> {
        let offset = match query.page_token.as_deref() {
            Some(token) => token.parse::<usize>().map_err(|_| {
                AppError::invalid_field("page_token", "malformed page token")
            })?,
            None => 0,
        };
        let limit = query.limit() as usize;

        let documents = self.documents.read().await;
        let mut matching: Vec<&Document> = documents.values().filter(|d| query.matches(d)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let page: Vec<Document> = matching.iter().skip(offset).take(limit).map(|d| (*d).clone()).collect();
        let next = offset + page.len();
        Ok(ListPage {
            documents: page,
            next_page_token: (next < matching.len()).then(|| next.to_string()),
        })
    }

    async fn update(&self, caller: &AuthContext, id: &str, patch: DocumentPatch) -> Result<Document> {
        if let Some(related) = &patch.related_documents {
            let related = normalize_related(id, related.clone())?;
            self.ensure_exist(caller, &related).await?;
        }

        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })?;
        document.apply(patch)?;
        Ok(document.clone())
    }

    async fn delete(&self, _caller: &AuthContext, id: &str) -> Result<bool> {
        Ok(self.documents.write().await.remove(id).is_some())
    }
}
