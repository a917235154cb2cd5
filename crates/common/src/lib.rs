//! CondoPortal Common Library
//!
//! Shared code for the CondoPortal gateway and ingestion pipeline:
//! - Configuration management and environment validation
//! - Error types and handling
//! - Firebase ID-token verification and auth context
//! - Firebase (Firestore, Storage, Identity Toolkit) REST clients
//! - Dify knowledge base and workflow clients
//! - Document model and storage backends
//! - Metrics helpers

pub mod auth;
pub mod config;
pub mod dify;
pub mod errors;
pub mod firebase;
pub mod metrics;
pub mod models;
pub mod store;
pub mod upstream;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use models::{Document, DocumentType};
pub use store::DocumentStore;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Gemini model used for OCR
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Default Firestore collection holding document records
pub const DEFAULT_COLLECTION: &str = "documents";
