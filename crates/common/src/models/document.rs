//! Document entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

use crate::errors::{AppError, Result};

/// Kind of building document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Regulation,
    Minutes,
    Contract,
    Invoice,
    Notice,
    Insurance,
    Maintenance,
    #[default]
    Other,
}

impl DocumentType {
    pub const ALL: [DocumentType; 8] = [
        DocumentType::Regulation,
        DocumentType::Minutes,
        DocumentType::Contract,
        DocumentType::Invoice,
        DocumentType::Notice,
        DocumentType::Insurance,
        DocumentType::Maintenance,
        DocumentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Regulation => "regulation",
            DocumentType::Minutes => "minutes",
            DocumentType::Contract => "contract",
            DocumentType::Invoice => "invoice",
            DocumentType::Notice => "notice",
            DocumentType::Insurance => "insurance",
            DocumentType::Maintenance => "maintenance",
            DocumentType::Other => "other",
        }
    }

    /// Parse leniently; unknown names fall back to `Other`
    pub fn parse(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .unwrap_or(DocumentType::Other)
    }
}

impl<'de> Deserialize<'de> for DocumentType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(DocumentType::parse(&raw))
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who uploaded a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uploader {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// The original file kept in Firebase Storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// How the text of a document was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Text layer of the PDF (or a plain-text upload)
    Text,
    /// Gemini OCR over page images or the whole PDF
    Ocr,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Text => "text",
            ExtractionMethod::Ocr => "ocr",
        }
    }
}

/// What the ingestion pipeline produced for a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub method: ExtractionMethod,
    pub page_count: u32,
    pub chunk_count: u32,
    pub characters: u64,
}

/// A building document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub building: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub tags: Vec<String>,
    pub uploaded_by: Uploader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<IngestionSummary>,
    #[serde(default)]
    pub related_documents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Apply a patch in place, normalizing tags and related references
    pub fn apply(&mut self, patch: DocumentPatch) -> Result<()> {
        patch.validate()?;

        if let Some(title) = patch.title {
            self.title = title.trim().to_string();
        }
        if let Some(building) = patch.building {
            self.building = building.trim().to_string();
        }
        if let Some(doc_type) = patch.doc_type {
            self.doc_type = doc_type;
        }
        if let Some(tags) = patch.tags {
            self.tags = normalize_tags(tags);
        }
        if let Some(related) = patch.related_documents {
            self.related_documents = normalize_related(&self.id, related)?;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Fields supplied when creating a document
#[derive(Debug, Clone, Validate)]
pub struct NewDocument {
    #[validate(length(min = 1, max = 300, message = "title must be 1-300 characters"))]
    pub title: String,

    #[validate(length(min = 1, max = 120, message = "building must be 1-120 characters"))]
    pub building: String,

    pub doc_type: DocumentType,
    pub tags: Vec<String>,
    pub uploaded_by: Uploader,
    pub file: Option<FileMetadata>,
    pub knowledge_base_id: Option<String>,
    pub ingestion: Option<IngestionSummary>,
    pub related_documents: Vec<String>,
}

impl NewDocument {
    /// Validate and normalize before handing to a store
    pub fn normalized(mut self) -> Result<Self> {
        self.title = self.title.trim().to_string();
        self.building = self.building.trim().to_string();
        self.validate()?;
        self.tags = normalize_tags(self.tags);
        // No id exists yet, so only duplicates and blanks can be removed here
        self.related_documents = normalize_related("", self.related_documents)?;
        Ok(self)
    }

    /// Materialize into a document with the store-assigned id
    pub fn into_document(self, id: String, now: DateTime<Utc>) -> Document {
        Document {
            id,
            title: self.title,
            building: self.building,
            doc_type: self.doc_type,
            tags: self.tags,
            uploaded_by: self.uploaded_by,
            file: self.file,
            knowledge_base_id: self.knowledge_base_id,
            ingestion: self.ingestion,
            related_documents: self.related_documents,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a document
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct DocumentPatch {
    #[validate(length(min = 1, max = 300, message = "title must be 1-300 characters"))]
    pub title: Option<String>,

    #[validate(length(min = 1, max = 120, message = "building must be 1-120 characters"))]
    pub building: Option<String>,

    #[serde(rename = "type")]
    pub doc_type: Option<DocumentType>,

    pub tags: Option<Vec<String>>,

    pub related_documents: Option<Vec<String>>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.building.is_none()
            && self.doc_type.is_none()
            && self.tags.is_none()
            && self.related_documents.is_none()
    }
}

/// Trim, lowercase, drop blanks and duplicates, keep first-seen order
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Trim and de-duplicate references; a document may not reference itself
pub fn normalize_related(own_id: &str, related: Vec<String>) -> Result<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(related.len());
    for id in related {
        let id = id.trim().to_string();
        if id.is_empty() {
            continue;
        }
        if !own_id.is_empty() && id == own_id {
            return Err(AppError::invalid_field(
                "related_documents",
                "a document cannot reference itself",
            ));
        }
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    Ok(out)
}

/// Split a comma-separated form value into trimmed, non-empty parts
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
