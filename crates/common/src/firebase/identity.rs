//! Firebase Auth REST: password sign-in and token refresh

use crate::errors::{AppError, Result, Upstream};
use crate::upstream::{check_response, vendor_message};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const DEFAULT_SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// Rejections that mean "wrong credentials" rather than a broken upstream
const CREDENTIAL_ERRORS: &[&str] = &[
    "EMAIL_NOT_FOUND",
    "INVALID_PASSWORD",
    "INVALID_LOGIN_CREDENTIALS",
    "INVALID_EMAIL",
    "USER_DISABLED",
    "TOKEN_EXPIRED",
    "INVALID_REFRESH_TOKEN",
    "USER_NOT_FOUND",
];

/// Tokens issued to a signed-in user
#[derive(Debug, Clone, Serialize)]
pub struct SessionTokens {
    pub id_token: String,
    pub refresh_token: String,
    /// Lifetime of the ID token in seconds
    pub expires_in: u64,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    local_id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    user_id: String,
}

#[derive(Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    api_key: String,
    identity_url: String,
    secure_token_url: String,
}

impl IdentityClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        identity_url: Option<&str>,
        secure_token_url: Option<&str>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            identity_url: identity_url
                .unwrap_or(DEFAULT_IDENTITY_URL)
                .trim_end_matches('/')
                .to_string(),
            secure_token_url: secure_token_url
                .unwrap_or(DEFAULT_SECURE_TOKEN_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// Sign in with email and password
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionTokens> {
        let response = self
            .http
            .post(format!("{}/accounts:signInWithPassword", self.identity_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&SignInRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await?;

        let body: SignInResponse = credential_check(response).await?.json().await?;
        info!(uid = %body.local_id, "User signed in");

        Ok(SessionTokens {
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_in: parse_expiry(&body.expires_in),
            uid: body.local_id,
            email: body.email,
        })
    }

    /// Exchange a refresh token for a fresh ID token
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens> {
        let response = self
            .http
            .post(format!("{}/token", self.secure_token_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token,
            })
            .send()
            .await?;

        let body: RefreshResponse = credential_check(response).await?.json().await?;

        Ok(SessionTokens {
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_in: parse_expiry(&body.expires_in),
            uid: body.user_id,
            email: None,
        })
    }
}

/// Like [`check_response`], but credential rejections become 401s
async fn credential_check(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status() != StatusCode::BAD_REQUEST {
        return check_response(Upstream::Firebase, response).await;
    }

    let body = response.text().await.unwrap_or_default();
    let message = vendor_message(&body).unwrap_or_else(|| "Bad Request".to_string());
    if is_credential_error(&message) {
        return Err(AppError::Unauthorized {
            message: "Invalid credentials".to_string(),
        });
    }
    Err(AppError::upstream(Upstream::Firebase, Some(400), message))
}

/// Firebase messages look like `INVALID_PASSWORD` or `TOO_MANY_ATTEMPTS : details`
fn is_credential_error(message: &str) -> bool {
    let code = message.split(':').next().unwrap_or_default().trim();
    CREDENTIAL_ERRORS.contains(&code)
}

fn parse_expiry(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(3600)
}
