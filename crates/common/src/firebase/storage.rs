//! Firebase Storage client (REST v0)
//!
//! Objects are addressed as `/v0/b/{bucket}/o/{url-encoded path}`. Uploads
//! carry the caller's ID token so storage rules apply to the signed-in user.

use crate::errors::{AppError, Result, Upstream};
use crate::upstream::{check_caller_response, with_retry};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_BASE_URL: &str = "https://firebasestorage.googleapis.com";

/// Metadata Firebase Storage returns for an object
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub name: String,
    pub bucket: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Object size; the API sends it as a decimal string
    #[serde(default)]
    pub size: Option<String>,
    /// Comma-separated download tokens
    #[serde(default)]
    pub download_tokens: Option<String>,
}

/// An uploaded object plus the URL clients can fetch it from
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub object: StoredObject,
    pub download_url: Option<String>,
}

#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
    retry_budget: Duration,
}

impl StorageClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Option<&str>,
        bucket: impl Into<String>,
        retry_budget: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            bucket: bucket.into(),
            retry_budget,
        }
    }

    fn bucket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| AppError::Configuration {
            message: format!("Invalid storage base URL: {}", e),
        })?;
        url.path_segments_mut()
            .map_err(|_| AppError::Configuration {
                message: "Storage base URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["v0", "b", self.bucket.as_str(), "o"]);
        Ok(url)
    }

    /// URL of one object; `/` in the path is percent-encoded
    pub fn object_url(&self, path: &str) -> Result<Url> {
        let mut url = self.bucket_url()?;
        url.path_segments_mut()
            .map_err(|_| AppError::Configuration {
                message: "Storage base URL cannot be a base".to_string(),
            })?
            .push(path);
        Ok(url)
    }

    /// Public download URL for an object with a download token
    pub fn download_url(&self, path: &str, token: &str) -> Result<String> {
        let mut url = self.object_url(path)?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("token", token);
        Ok(url.to_string())
    }

    async fn delete_once(&self, url: Url, id_token: &str) -> Result<bool> {
        let response = self
            .http
            .delete(url)
            .header("Authorization", format!("Firebase {}", id_token))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_caller_response(Upstream::Firebase, response).await?;
        Ok(true)
    }
}

/// Object storage for original uploads
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Upload bytes under `path` with the caller's ID token
    async fn upload(
        &self,
        id_token: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadedFile>;

    /// Delete an object; `false` when it did not exist
    async fn delete(&self, id_token: &str, path: &str) -> Result<bool>;
}

#[async_trait]
impl FileStorage for StorageClient {
    /// Upload bytes under `path`
    #[instrument(skip(self, id_token, bytes), fields(bytes = bytes.len()))]
    async fn upload(
        &self,
        id_token: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadedFile> {
        let mut url = self.bucket_url()?;
        url.query_pairs_mut().append_pair("name", path);

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Firebase {}", id_token))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;

        let object: StoredObject = check_caller_response(Upstream::Firebase, response)
            .await?
            .json()
            .await?;

        let download_url = object
            .download_tokens
            .as_deref()
            .and_then(|tokens| tokens.split(',').next())
            .filter(|t| !t.is_empty())
            .map(|t| self.download_url(&object.name, t))
            .transpose()?;

        debug!(path = %object.name, "Stored file");
        Ok(UploadedFile {
            object,
            download_url,
        })
    }

    /// Delete an object; `false` when it did not exist
    #[instrument(skip(self, id_token))]
    async fn delete(&self, id_token: &str, path: &str) -> Result<bool> {
        let url = self.object_url(path)?;
        with_retry(Upstream::Firebase, self.retry_budget, || {
            self.delete_once(url.clone(), id_token)
        })
        .await
    }
}

/// Hex-encoded SHA-256 of file contents
pub fn content_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> StorageClient {
        StorageClient::new(
            reqwest::Client::new(),
            None,
            "condo-test.appspot.com",
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_object_path_is_encoded() {
        let url = client().object_url("documents/abc/regolamento 2024.pdf").unwrap();
        assert_eq!(
            url.as_str(),
            "https://firebasestorage.googleapis.com/v0/b/condo-test.appspot.com/o/documents%2Fabc%2Fregolamento%202024.pdf"
        );
    }

    #[test]
    fn test_download_url() {
        let url = client().download_url("documents/a.pdf", "tok-1").unwrap();
        assert!(url.ends_with("/o/documents%2Fa.pdf?alt=media&token=tok-1"));
    }

    #[test]
    fn test_stored_object_shape() {
        let object: StoredObject = serde_json::from_str(
            r#"{"name": "documents/a.pdf", "bucket": "b", "contentType": "application/pdf",
                "size": "1024", "downloadTokens": "t1,t2"}"#,
        )
        .unwrap();
        assert_eq!(object.size.as_deref(), Some("1024"));
        assert_eq!(object.download_tokens.as_deref(), Some("t1,t2"));
    }

    #[test]
    fn test_content_sha256() {
        assert_eq!(
            content_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
