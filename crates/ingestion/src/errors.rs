//! Ingestion pipeline error types

use condoportal_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("PDF parse error for {file_name}: {message}")]
    PdfParse { file_name: String, message: String },

    #[error("{file_name} has no pages")]
    EmptyDocument { file_name: String },

    #[error("No text could be extracted from {file_name}")]
    NoTextExtracted { file_name: String },

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A managed service (Gemini, Dify) failed
    #[error(transparent)]
    Upstream(#[from] AppError),
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::PdfParse { .. } | IngestionError::EmptyDocument { .. } => {
                AppError::Ingestion {
                    message: e.to_string(),
                }
            }
            IngestionError::NoTextExtracted { file_name } => AppError::NoTextExtracted { file_name },
            IngestionError::UnsupportedContentType(content_type) => {
                AppError::UnsupportedMediaType { content_type }
            }
            IngestionError::Chunking(message) => AppError::Ingestion { message },
            IngestionError::Io(e) => AppError::Internal {
                message: e.to_string(),
            },
            IngestionError::Upstream(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_status() {
        let err: AppError = IngestionError::UnsupportedContentType("image/png".into()).into();
        assert_eq!(err.status_code().as_u16(), 415);

        let err: AppError = IngestionError::NoTextExtracted {
            file_name: "scan.pdf".into(),
        }
        .into();
        assert_eq!(err.status_code().as_u16(), 422);

        let err: AppError = IngestionError::PdfParse {
            file_name: "broken.pdf".into(),
            message: "invalid xref".into(),
        }
        .into();
        assert_eq!(err.status_code().as_u16(), 422);
    }
}
