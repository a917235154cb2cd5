//! CondoPortal ingestion pipeline
//!
//! PDF text extraction with an OCR fallback, Markdown conversion and
//! chunking for the knowledge base.

pub mod chunker;
pub mod errors;
pub mod extractability;
pub mod markdown;
pub mod ocr;
pub mod pdf;
pub mod processor;

pub use errors::IngestionError;
pub use ocr::{GeminiOcr, OcrEngine};
pub use processor::{
    is_supported, IngestionOutcome, IngestionPipeline, PipelineSettings, PreparedDocument,
    SourceFile,
};
