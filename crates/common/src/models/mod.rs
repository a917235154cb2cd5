//! Domain models
//!
//! The portal persists a single entity, the building [`Document`].

mod document;

pub use document::{
    normalize_related, normalize_tags, split_list, Document, DocumentPatch, DocumentType,
    ExtractionMethod, FileMetadata, IngestionSummary, NewDocument, Uploader,
};
