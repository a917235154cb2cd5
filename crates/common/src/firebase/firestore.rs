//! Firestore REST client
//!
//! Firestore's REST surface wraps every value in a type tag
//! (`{"stringValue": "..."}`, `{"integerValue": "42"}`, ...). This module
//! holds the typed value codec and a thin client over
//! `projects/{project}/databases/(default)/documents`.
//!
//! Requests carry the caller's Firebase ID token so security rules are
//! evaluated for the signed-in user.

use crate::errors::{AppError, Result, Upstream};
use crate::upstream::{check_caller_response, segment_url, with_retry};
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// A typed Firestore value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FirestoreValue {
    #[serde(rename = "nullValue")]
    Null(()),
    #[serde(rename = "booleanValue")]
    Boolean(bool),
    #[serde(rename = "integerValue", with = "int_string")]
    Integer(i64),
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "timestampValue")]
    Timestamp(DateTime<Utc>),
    #[serde(rename = "stringValue")]
    String(String),
    #[serde(rename = "bytesValue")]
    Bytes(String),
    #[serde(rename = "referenceValue")]
    Reference(String),
    #[serde(rename = "arrayValue")]
    Array(ArrayValue),
    #[serde(rename = "mapValue")]
    Map(MapValue),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<FirestoreValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FirestoreValue>,
}

/// Firestore sends 64-bit integers as decimal strings
mod int_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(D::Error::custom),
            Raw::Number(n) => Ok(n),
        }
    }
}

impl FirestoreValue {
    /// Convert plain JSON into a Firestore value
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => FirestoreValue::Null(()),
            Value::Bool(b) => FirestoreValue::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FirestoreValue::Integer(i),
                None => FirestoreValue::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => FirestoreValue::String(s),
            Value::Array(items) => FirestoreValue::Array(ArrayValue {
                values: items.into_iter().map(FirestoreValue::from_json).collect(),
            }),
            Value::Object(map) => FirestoreValue::Map(MapValue {
                fields: map
                    .into_iter()
                    .map(|(k, v)| (k, FirestoreValue::from_json(v)))
                    .collect(),
            }),
        }
    }

    /// Convert back into plain JSON; timestamps become RFC 3339 strings
    pub fn into_json(self) -> Value {
        match self {
            FirestoreValue::Null(()) => Value::Null,
            FirestoreValue::Boolean(b) => Value::Bool(b),
            FirestoreValue::Integer(i) => Value::Number(i.into()),
            FirestoreValue::Double(d) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
            FirestoreValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            FirestoreValue::String(s) | FirestoreValue::Bytes(s) | FirestoreValue::Reference(s) => {
                Value::String(s)
            }
            FirestoreValue::Array(array) => {
                Value::Array(array.values.into_iter().map(FirestoreValue::into_json).collect())
            }
            FirestoreValue::Map(map) => Value::Object(fields_to_json(map.fields)),
        }
    }
}

/// Top-level fields of a Firestore document
pub type Fields = BTreeMap<String, FirestoreValue>;

/// Convert a JSON object into document fields
pub fn fields_from_json(value: Value) -> Result<Fields> {
    match FirestoreValue::from_json(value) {
        FirestoreValue::Map(map) => Ok(map.fields),
        other => Err(AppError::Internal {
            message: format!("Firestore documents must be objects, got {:?}", other),
        }),
    }
}

/// Convert document fields into a JSON object
pub fn fields_to_json(fields: Fields) -> Map<String, Value> {
    fields.into_iter().map(|(k, v)| (k, v.into_json())).collect()
}

/// A document as returned by the REST API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirestoreDocument {
    /// Full resource name, ending in `/{collection}/{id}`
    pub name: String,
    #[serde(default)]
    pub fields: Fields,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl FirestoreDocument {
    /// The document id (last path segment of the resource name)
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or_default()
    }
}

#[derive(Serialize)]
struct WriteBody<'a> {
    fields: &'a Fields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDocumentsResponse {
    #[serde(default)]
    pub documents: Vec<FirestoreDocument>,
    pub next_page_token: Option<String>,
}

/// Firestore REST client scoped to one database
#[derive(Clone)]
pub struct FirestoreClient {
    http: reqwest::Client,
    documents_url: String,
    retry_budget: Duration,
}

impl FirestoreClient {
    /// `documents_url` is `.../projects/{p}/databases/(default)/documents`
    pub fn new(http: reqwest::Client, documents_url: String, retry_budget: Duration) -> Self {
        Self {
            http,
            documents_url: documents_url.trim_end_matches('/').to_string(),
            retry_budget,
        }
    }

    fn collection_url(&self, collection: &str) -> Result<Url> {
        segment_url(&self.documents_url, [collection])
    }

    fn document_url(&self, collection: &str, id: &str) -> Result<Url> {
        segment_url(&self.documents_url, [collection, id])
    }

    /// Create a document with a Firestore-generated id
    #[instrument(skip(self, token, fields))]
    pub async fn create_document(
        &self,
        token: &str,
        collection: &str,
        fields: &Fields,
    ) -> Result<FirestoreDocument> {
        let response = self
            .http
            .post(self.collection_url(collection)?)
            .bearer_auth(token)
            .json(&WriteBody { fields })
            .send()
            .await?;

        let document: FirestoreDocument = check_caller_response(Upstream::Firebase, response)
            .await?
            .json()
            .await?;

        debug!(id = document.id(), "Firestore document created");
        Ok(document)
    }

    /// Fetch a document; `None` when it does not exist
    #[instrument(skip(self, token))]
    pub async fn get_document(
        &self,
        token: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<FirestoreDocument>> {
        let url = self.document_url(collection, id)?;
        with_retry(Upstream::Firebase, self.retry_budget, || self.get_once(url.as_str(), token)).await
    }

    async fn get_once(&self, url: &str, token: &str) -> Result<Option<FirestoreDocument>> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document = check_caller_response(Upstream::Firebase, response).await?.json().await?;
        Ok(Some(document))
    }

    /// List one page of a collection, newest first
    #[instrument(skip(self, token, page_token))]
    pub async fn list_documents(
        &self,
        token: &str,
        collection: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ListDocumentsResponse> {
        let url = self.collection_url(collection)?;
        let mut query = vec![
            ("pageSize", page_size.to_string()),
            ("orderBy", "created_at desc".to_string()),
        ];
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token.to_string()));
        }

        with_retry(Upstream::Firebase, self.retry_budget, || {
            self.list_once(url.as_str(), token, &query)
        })
        .await
    }

    async fn list_once(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<ListDocumentsResponse> {
        let response = self.http.get(url).bearer_auth(token).query(query).send().await?;
        let page = check_caller_response(Upstream::Firebase, response).await?.json().await?;
        Ok(page)
    }

    /// Overwrite the masked fields of an existing document
    ///
    /// Returns `None` when the document does not exist.
    #[instrument(skip(self, token, fields))]
    pub async fn patch_document(
        &self,
        token: &str,
        collection: &str,
        id: &str,
        fields: &Fields,
        mask: &[&str],
    ) -> Result<Option<FirestoreDocument>> {
        let url = self.document_url(collection, id)?;
        let mut query: Vec<(&str, &str)> =
            mask.iter().map(|f| ("updateMask.fieldPaths", *f)).collect();
        query.push(("currentDocument.exists", "true"));

        with_retry(Upstream::Firebase, self.retry_budget, || {
            self.patch_once(url.as_str(), token, &query, fields)
        })
        .await
    }

    async fn patch_once(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
        fields: &Fields,
    ) -> Result<Option<FirestoreDocument>> {
        let response = self
            .http
            .patch(url)
            .bearer_auth(token)
            .query(query)
            .json(&WriteBody { fields })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document = check_caller_response(Upstream::Firebase, response).await?.json().await?;
        Ok(Some(document))
    }

    /// Delete a document; `false` when it did not exist
    #[instrument(skip(self, token))]
    pub async fn delete_document(&self, token: &str, collection: &str, id: &str) -> Result<bool> {
        let url = self.document_url(collection, id)?;
        with_retry(Upstream::Firebase, self.retry_budget, || self.delete_once(url.as_str(), token)).await
    }

    async fn delete_once(&self, url: &str, token: &str) -> Result<bool> {
        let response = self
            .http
            .delete(url)
            .bearer_auth(token)
            .query(&[("currentDocument.exists", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_caller_response(Upstream::Firebase, response).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_rest_document() {
        let raw = json!({
            "name": "projects/p/databases/(default)/documents/documents/abc123",
            "fields": {
                "title": {"stringValue": "Verbale assemblea"},
                "pages": {"integerValue": "12"},
                "ratio": {"doubleValue": 0.25},
                "archived": {"booleanValue": false},
                "deleted_at": {"nullValue": null},
                "created_at": {"timestampValue": "2024-03-01T10:00:00.123456Z"},
                "tags": {"arrayValue": {"values": [{"stringValue": "budget"}]}},
                "empty": {"arrayValue": {}},
                "file": {"mapValue": {"fields": {"size_bytes": {"integerValue": "2048"}}}}
            },
            "createTime": "2024-03-01T10:00:00.123456Z",
            "updateTime": "2024-03-01T10:00:00.123456Z"
        });

        let doc: FirestoreDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.id(), "abc123");
        assert_eq!(doc.fields["pages"], FirestoreValue::Integer(12));

        let plain = fields_to_json(doc.fields);
        assert_eq!(plain["title"], "Verbale assemblea");
        assert_eq!(plain["pages"], 12);
        assert_eq!(plain["ratio"], 0.25);
        assert_eq!(plain["deleted_at"], Value::Null);
        assert_eq!(plain["tags"], json!(["budget"]));
        assert_eq!(plain["empty"], json!([]));
        assert_eq!(plain["file"]["size_bytes"], 2048);
        assert!(plain["created_at"].as_str().unwrap().starts_with("2024-03-01T10:00:00"));
    }

    #[test]
    fn test_encode_integers_as_strings() {
        let fields = fields_from_json(json!({"size": 42, "tags": [], "name": "a"})).unwrap();
        let encoded = serde_json::to_value(&fields).unwrap();
        assert_eq!(encoded["size"], json!({"integerValue": "42"}));
        assert_eq!(encoded["tags"], json!({"arrayValue": {}}));
        assert_eq!(encoded["name"], json!({"stringValue": "a"}));
    }

    #[test]
    fn test_fields_from_non_object_is_rejected() {
        assert!(fields_from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn test_urls() {
        let client = FirestoreClient::new(
            reqwest::Client::new(),
            "https://firestore.googleapis.com/v1/projects/p/databases/(default)/documents/".into(),
            Duration::from_secs(1),
        );
        assert_eq!(
            client.document_url("documents", "x").unwrap().as_str(),
            "https://firestore.googleapis.com/v1/projects/p/databases/(default)/documents/documents/x"
        );
        assert_eq!(
            client.document_url("documents", "../../other/secret").unwrap().as_str(),
            "https://firestore.googleapis.com/v1/projects/p/databases/(default)/documents/documents/..%2F..%2Fother%2Fsecret"
        );
        assert!(client.document_url("documents", "..").is_err());
    }
}
