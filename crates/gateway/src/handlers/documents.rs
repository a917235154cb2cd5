//! Document upload and management handlers

use axum::{
    extract::{multipart::Field, Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use condoportal_common::{
    auth::AuthContext,
    errors::{AppError, Result},
    firebase::content_sha256,
    metrics,
    models::{split_list, Document, DocumentPatch, DocumentType, FileMetadata, NewDocument, Uploader},
    store::{ListPage, ListQuery},
};
use condoportal_ingestion::{is_supported, SourceFile};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;

/// The uploaded file
#[derive(Debug)]
struct UploadedPart {
    file_name: String,
    content_type: String,
    bytes: Vec<u8>,
}

/// Parsed multipart upload form
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<UploadedPart>,
    title: Option<String>,
    building: Option<String>,
    doc_type: Option<String>,
    tags: Vec<String>,
    related: Vec<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart, max_bytes: usize) -> Result<Self> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart.next_field().await.map_err(multipart_error(max_bytes))? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => form.file = Some(read_file(field, max_bytes).await?),
                "title" => form.title = Some(read_text(field, max_bytes).await?),
                "building" => form.building = Some(read_text(field, max_bytes).await?),
                "type" => form.doc_type = Some(read_text(field, max_bytes).await?),
                "tags" => form.tags = split_list(&read_text(field, max_bytes).await?),
                "related" | "related_documents" => {
                    form.related = split_list(&read_text(field, max_bytes).await?)
                }
                other => warn!(field = %other, "Ignoring unknown upload field"),
            }
        }

        Ok(form)
    }
}

fn multipart_error(max_bytes: usize) -> impl Fn(axum::extract::multipart::MultipartError) -> AppError {
    move |e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge {
                size: max_bytes + 1,
                limit: max_bytes,
            }
        } else {
            AppError::InvalidFormat {
                message: e.body_text(),
            }
        }
    }
}

async fn read_file(mut field: Field<'_>, max_bytes: usize) -> Result<UploadedPart> {
    let file_name = field.file_name().unwrap_or("upload").to_string();
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error(max_bytes))? {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(AppError::PayloadTooLarge {
                size: bytes.len() + chunk.len(),
                limit: max_bytes,
            });
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(UploadedPart {
        file_name,
        content_type,
        bytes,
    })
}

async fn read_text(field: Field<'_>, max_bytes: usize) -> Result<String> {
    field.text().await.map_err(multipart_error(max_bytes))
}

/// Object name safe for a storage path
fn storage_file_name(file_name: &str) -> String {
    let cleaned: String = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::MissingField {
            field: field.to_string(),
        })
}

/// Upload a file, ingest it into the knowledge base and create its record
pub async fn upload_document(
    State(state): State<AppState>,
    auth: AuthContext,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Document>)> {
    let result = store_upload(&state, &auth, multipart).await;
    metrics::record_upload(match &result {
        Ok(_) => "stored",
        Err(AppError::PayloadTooLarge { .. }) => "too_large",
        Err(AppError::UnsupportedMediaType { .. }) => "unsupported",
        Err(e) if e.is_client_error() => "rejected",
        Err(_) => "failed",
    });
    result.map(|document| (StatusCode::CREATED, Json(document)))
}

async fn store_upload(state: &AppState, auth: &AuthContext, multipart: Multipart) -> Result<Document> {
    let max_bytes = state.config.ingestion.max_upload_bytes;
    let form = UploadForm::read(multipart, max_bytes).await?;

    let file = form.file.ok_or_else(|| AppError::MissingField {
        field: "file".to_string(),
    })?;
    let title = required(form.title, "title")?;
    let building = required(form.building, "building")?;
    let doc_type = form
        .doc_type
        .as_deref()
        .map(DocumentType::parse)
        .unwrap_or(DocumentType::Other);

    if file.bytes.is_empty() {
        return Err(AppError::invalid_field("file", "file is empty"));
    }
    if !is_supported(&file.content_type, &file.file_name) {
        return Err(AppError::UnsupportedMediaType {
            content_type: file.content_type,
        });
    }
    // Reject dangling references before any upstream call
    state.store.ensure_exist(auth, &form.related).await?;

    let sha256 = content_sha256(&file.bytes);
    let stored = if state.store.keeps_files() {
        let storage_path = format!("documents/{}/{}", Uuid::new_v4(), storage_file_name(&file.file_name));
        let uploaded = state
            .files
            .upload(&auth.token, &storage_path, file.bytes.clone(), &file.content_type)
            .await?;
        Some((storage_path, uploaded))
    } else {
        None
    };
    let storage_path = stored.as_ref().map(|(path, _)| path.clone());

    let source = SourceFile {
        bytes: &file.bytes,
        content_type: &file.content_type,
        file_name: &file.file_name,
        title: &title,
    };
    let outcome = match state.pipeline.ingest(source).await {
        Ok(outcome) => outcome,
        Err(e) => {
            remove_file(state, auth, storage_path.as_deref()).await;
            return Err(e.into());
        }
    };

    let size_bytes = file.bytes.len() as u64;
    let new_document = NewDocument {
        title,
        building,
        doc_type,
        tags: form.tags,
        uploaded_by: Uploader {
            uid: auth.uid.clone(),
            email: auth.email.clone(),
        },
        file: stored.map(|(_, uploaded)| FileMetadata {
            file_name: file.file_name,
            content_type: file.content_type,
            size_bytes,
            sha256,
            storage_path: uploaded.object.name,
            download_url: uploaded.download_url,
        }),
        knowledge_base_id: Some(outcome.knowledge_base_id.clone()),
        ingestion: Some(outcome.summary()),
        related_documents: form.related,
    };

    let document = match state.store.create(auth, new_document).await {
        Ok(document) => document,
        Err(e) => {
            remove_knowledge_base_document(state, &outcome.knowledge_base_id).await;
            remove_file(state, auth, storage_path.as_deref()).await;
            return Err(e);
        }
    };

    info!(
        document_id = %document.id,
        uid = %auth.uid,
        knowledge_base_id = %outcome.knowledge_base_id,
        method = outcome.method.as_str(),
        "Document uploaded"
    );
    Ok(document)
}

async fn remove_file(state: &AppState, auth: &AuthContext, path: Option<&str>) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = state.files.delete(&auth.token, path).await {
        warn!(path = %path, error = %e, "Failed to delete stored file");
    }
}

async fn remove_knowledge_base_document(state: &AppState, id: &str) {
    if let Err(e) = state.knowledge_base.delete_document(id).await {
        warn!(knowledge_base_id = %id, error = %e, "Failed to delete knowledge base document");
    }
}

/// List documents with optional filters
pub async fn list_documents(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListPage>> {
    query.validate()?;
    let page = state.store.list(&auth, &query).await?;
    Ok(Json(page))
}

/// Get a document by ID
pub async fn get_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Document>> {
    state
        .store
        .get(&auth, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::DocumentNotFound { id: id.clone() })
}

/// Update a document's metadata
pub async fn update_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(patch): Json<DocumentPatch>,
) -> Result<Json<Document>> {
    if patch.is_empty() {
        return Err(AppError::Validation {
            message: "no fields to update".to_string(),
            field: None,
        });
    }
    patch.validate()?;

    let document = state.store.update(&auth, &id, patch).await?;
    info!(document_id = %id, uid = %auth.uid, "Document updated");
    Ok(Json(document))
}

/// Delete a document record, then its knowledge base entry and stored file
pub async fn delete_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let document = state
        .store
        .get(&auth, &id)
        .await?
        .ok_or_else(|| AppError::DocumentNotFound { id: id.clone() })?;

    if !state.store.delete(&auth, &id).await? {
        return Err(AppError::DocumentNotFound { id });
    }

    if !state.store.deletes_knowledge_base_document() {
        if let Some(kb_id) = document.knowledge_base_id.as_deref() {
            remove_knowledge_base_document(&state, kb_id).await;
        }
    }
    let storage_path = document.file.as_ref().map(|file| file.storage_path.as_str());
    remove_file(&state, &auth, storage_path).await;

    info!(document_id = %id, uid = %auth.uid, "Document deleted");
    Ok(StatusCode::NO_CONTENT)
}
