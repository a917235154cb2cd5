use super::{DocumentStore, ListPage, ListQuery};
use crate::auth::AuthContext;
use crate::errors::{AppError, Result};
use crate::firebase::firestore::{fields_from_json, fields_to_json, Fields, FirestoreDocument};
use crate::firebase::{FirestoreClient, FirestoreValue};
use crate::models::{normalize_related, Document, DocumentPatch, NewDocument};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};

/// Fields rewritten by an update
const MUTABLE_FIELDS: &[&str] = &[
    "title",
    "building",
    "type",
    "tags",
    "related_documents",
    "updated_at",
];

/// Full document records in one Firestore collection
pub struct FirestoreDocumentStore {
    client: FirestoreClient,
    collection: String,
}

impl FirestoreDocumentStore {
    pub fn new(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }
}

/// Encode a document as Firestore fields; timestamps become native timestamps
pub fn document_to_fields(document: &Document) -> Result<Fields> {
    let mut json = serde_json::to_value(document)?;
    if let Value::Object(map) = &mut json {
        map.remove("id");
    }
    let mut fields = fields_from_json(json)?;
    fields.insert(
        "created_at".to_string(),
        FirestoreValue::Timestamp(document.created_at),
    );
    fields.insert(
        "updated_at".to_string(),
        FirestoreValue::Timestamp(document.updated_at),
    );
    Ok(fields)
}

/// Decode a Firestore document into a record
pub fn document_from_firestore(raw: FirestoreDocument) -> Result<Document> {
    let id = raw.id().to_string();
    let mut map = fields_to_json(raw.fields);
    map.insert("id".to_string(), Value::String(id.clone()));
    for (field, fallback) in [("created_at", raw.create_time), ("updated_at", raw.update_time)] {
        if !map.contains_key(field) {
            if let Some(ts) = fallback {
                map.insert(field.to_string(), Value::String(ts.to_rfc3339()));
            }
        }
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| AppError::Internal {
        message: format!("Malformed document record {}: {}", id, e),
    })
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    fn backend(&self) -> &'static str {
        "firestore"
    }

    #[instrument(skip(self, caller, document), fields(title = %document.title))]
    async fn create(&self, caller: &AuthContext, document: NewDocument) -> Result<Document> {
        let document = document.normalized()?;
        self.ensure_exist(caller, &document.related_documents).await?;

        // Firestore assigns the id; encode with a placeholder and read it back
        let draft = document.into_document(String::new(), Utc::now());
        let fields = document_to_fields(&draft)?;
        let raw = self
            .client
            .create_document(&caller.token, &self.collection, &fields)
            .await?;

        let created = Document {
            id: raw.id().to_string(),
            ..draft
        };
        debug!(id = %created.id, "Document record created");
        Ok(created)
    }

    async fn get(&self, caller: &AuthContext, id: &str) -> Result<Option<Document>> {
        self.client
            .get_document(&caller.token, &self.collection, id)
            .await?
            .map(document_from_firestore)
            .transpose()
    }

    #[instrument(skip(self, caller))]
    async fn list(&self, caller: &AuthContext, query: &ListQuery) -> Result<ListPage> {
        let response = self
            .client
            .list_documents(
                &caller.token,
                &self.collection,
                query.limit(),
                query.page_token.as_deref(),
            )
            .await?;

        let mut documents = Vec::with_capacity(response.documents.len());
        for raw in response.documents {
            let document = document_from_firestore(raw)?;
            if query.matches(&document) {
                documents.push(document);
            }
        }

        Ok(ListPage {
            documents,
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    #[instrument(skip(self, caller, patch))]
    async fn update(&self, caller: &AuthContext, id: &str, patch: DocumentPatch) -> Result<Document> {
        if let Some(related) = &patch.related_documents {
            let related = normalize_related(id, related.clone())?;
            self.ensure_exist(caller, &related).await?;
        }

        let mut document = self
            .get(caller, id)
            .await?
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })?;
        document.apply(patch)?;

        let mut fields = document_to_fields(&document)?;
        fields.retain(|name, _| MUTABLE_FIELDS.contains(&name.as_str()));

        self.client
            .patch_document(&caller.token, &self.collection, id, &fields, MUTABLE_FIELDS)
            .await?
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })?;
        Ok(document)
    }

    async fn delete(&self, caller: &AuthContext, id: &str) -> Result<bool> {
        self.client
            .delete_document(&caller.token, &self.collection, id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentType, ExtractionMethod, FileMetadata, IngestionSummary, Uploader};
    use serde_json::json;

    fn sample() -> Document {
        NewDocument {
            title: "Polizza globale fabbricati".into(),
            building: "Via Garibaldi 3".into(),
            doc_type: DocumentType::Insurance,
            tags: vec!["polizza".into()],
            uploaded_by: Uploader {
                uid: "u1".into(),
                email: Some("admin@example.com".into()),
            },
            file: Some(FileMetadata {
                file_name: "polizza.pdf".into(),
                content_type: "application/pdf".into(),
                size_bytes: 48_213,
                sha256: "ab".repeat(32),
                storage_path: "documents/x/polizza.pdf".into(),
                download_url: None,
            }),
            knowledge_base_id: Some("kb-1".into()),
            ingestion: Some(IngestionSummary {
                method: ExtractionMethod::Text,
                page_count: 4,
                chunk_count: 9,
                characters: 8_100,
            }),
            related_documents: vec!["other".into()],
        }
        .into_document("doc-1".into(), Utc::now())
    }

    #[test]
    fn test_fields_shape() {
        let fields = document_to_fields(&sample()).unwrap();
        assert!(!fields.contains_key("id"));
        assert!(matches!(fields["created_at"], FirestoreValue::Timestamp(_)));
        assert_eq!(fields["type"], FirestoreValue::String("insurance".into()));

        let json = serde_json::to_value(&fields["file"]).unwrap();
        assert_eq!(json["mapValue"]["fields"]["size_bytes"], json!({"integerValue": "48213"}));
    }

    #[test]
    fn test_firestore_roundtrip() {
        let original = sample();
        let raw = FirestoreDocument {
            name: "projects/p/databases/(default)/documents/documents/doc-1".into(),
            fields: document_to_fields(&original).unwrap(),
            create_time: None,
            update_time: None,
        };

        let decoded = document_from_firestore(raw).unwrap();
        assert_eq!(decoded.id, "doc-1");
        assert_eq!(decoded.file, original.file);
        assert_eq!(decoded.ingestion, original.ingestion);
        assert_eq!(decoded.created_at.timestamp(), original.created_at.timestamp());
    }

    #[test]
    fn test_record_without_timestamps_uses_metadata() {
        let raw: FirestoreDocument = serde_json::from_value(json!({
            "name": "projects/p/databases/(default)/documents/documents/legacy",
            "fields": {
                "title": {"stringValue": "Vecchio verbale"},
                "building": {"stringValue": "Via Roma 12"},
                "type": {"stringValue": "verbale"},
                "uploaded_by": {"mapValue": {"fields": {"uid": {"stringValue": "u9"}}}}
            },
            "createTime": "2024-03-01T10:00:00Z",
            "updateTime": "2024-03-02T10:00:00Z"
        }))
        .unwrap();

        let decoded = document_from_firestore(raw).unwrap();
        assert_eq!(decoded.id, "legacy");
        assert_eq!(decoded.doc_type, DocumentType::Other);
        assert!(decoded.tags.is_empty());
        assert_eq!(decoded.created_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }
}
