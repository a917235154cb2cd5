//! Authentication utilities
//!
//! Provides:
//! - Firebase ID-token verification against Google's signing keys
//! - Auth context extraction for handlers

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use jsonwebtoken::{
    decode, decode_header,
    errors::ErrorKind,
    jwk::JwkSet,
    Algorithm, DecodingKey, Validation,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Minimum gap between key refetches triggered by an unknown `kid`
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Identity carried by a valid ID token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    /// Expiry as a Unix timestamp
    pub expires_at: i64,
}

/// Verifies bearer tokens presented to the API
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken>;
}

/// Claims of a Firebase ID token
#[derive(Debug, Deserialize)]
struct FirebaseClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

impl KeyCache {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < ttl)
    }

    fn recently_fetched(&self) -> bool {
        self.fetched_at
            .is_some_and(|at| at.elapsed() < MIN_REFRESH_INTERVAL)
    }
}

/// Verifies Firebase ID tokens (RS256) for one project
pub struct FirebaseTokenVerifier {
    http: reqwest::Client,
    jwks_url: String,
    project_id: String,
    ttl: Duration,
    cache: RwLock<KeyCache>,
}

impl FirebaseTokenVerifier {
    pub fn new(
        http: reqwest::Client,
        jwks_url: impl Into<String>,
        project_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            http,
            jwks_url: jwks_url.into(),
            project_id: project_id.into(),
            ttl,
            cache: RwLock::new(KeyCache::default()),
        }
    }

    fn issuer(&self) -> String {
        format!("https://securetoken.google.com/{}", self.project_id)
    }

    /// Replace the cached signing keys
    pub async fn load_keys(&self, set: &JwkSet) -> Result<usize> {
        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable signing key"),
            }
        }

        let count = keys.len();
        let mut cache = self.cache.write().await;
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());
        Ok(count)
    }

    async fn fetch_keys(&self) -> Result<usize> {
        let response = self.http.get(&self.jwks_url).send().await?;
        let response =
            crate::upstream::check_response(crate::errors::Upstream::Firebase, response).await?;
        let set: JwkSet = response.json().await?;
        let count = self.load_keys(&set).await?;
        info!(keys = count, "Refreshed ID-token signing keys");
        Ok(count)
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey> {
        {
            let cache = self.cache.read().await;
            if cache.is_fresh(self.ttl) {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
                if cache.recently_fetched() {
                    return Err(unknown_key(kid));
                }
            }
        }

        debug!(kid = %kid, "Signing key cache miss");
        self.fetch_keys().await?;

        let cache = self.cache.read().await;
        cache.keys.get(kid).cloned().ok_or_else(|| unknown_key(kid))
    }

    fn decode_with(&self, token: &str, key: &DecodingKey) -> Result<VerifiedToken> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.project_id.as_str()]);
        validation.set_issuer(&[self.issuer()]);
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);

        let claims = decode::<FirebaseClaims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::ExpiredToken,
                _ => AppError::InvalidToken {
                    message: e.to_string(),
                },
            })?;

        if claims.sub.trim().is_empty() {
            return Err(AppError::InvalidToken {
                message: "Token has an empty subject".to_string(),
            });
        }

        Ok(VerifiedToken {
            uid: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified,
            expires_at: claims.exp,
        })
    }
}

fn unknown_key(kid: &str) -> AppError {
    AppError::InvalidToken {
        message: format!("Unknown signing key: {}", kid),
    }
}

#[async_trait]
impl TokenVerifier for FirebaseTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let header = decode_header(token).map_err(|e| AppError::InvalidToken {
            message: e.to_string(),
        })?;
        if header.alg != Algorithm::RS256 {
            return Err(AppError::InvalidToken {
                message: format!("Unexpected algorithm {:?}", header.alg),
            });
        }
        let kid = header.kid.ok_or_else(|| AppError::InvalidToken {
            message: "Token header has no kid".to_string(),
        })?;

        let key = self.key_for(&kid).await?;
        self.decode_with(token, &key)
    }
}

/// Extracted authentication context available to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Firebase user id
    pub uid: String,

    pub email: Option<String>,

    /// The caller's raw ID token, forwarded to Firestore and Storage
    pub token: String,
}

/// Extract the token from an `Authorization: Bearer` header value
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum extractor for AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<dyn TokenVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
            })?;

        let token = extract_bearer(auth_header).ok_or_else(|| AppError::Unauthorized {
            message: "Authorization header must be a Bearer token".to_string(),
        })?;

        let verifier = Arc::<dyn TokenVerifier>::from_ref(state);
        let verified = verifier.verify(token).await?;

        Ok(AuthContext {
            uid: verified.uid,
            email: verified.email,
            token: token.to_string(),
        })
    }
}
