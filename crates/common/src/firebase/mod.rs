//! Firebase REST clients

pub mod firestore;
pub mod identity;
pub mod storage;

pub use firestore::{FirestoreClient, FirestoreDocument, FirestoreValue};
pub use identity::{IdentityClient, SessionTokens};
pub use storage::{content_sha256, FileStorage, StorageClient, StoredObject, UploadedFile};
