//! Sign-in and session handlers

use axum::{extract::State, Json};
use condoportal_common::{auth::AuthContext, errors::Result, firebase::SessionTokens};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,

    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "refresh_token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Email/password sign-in through Firebase Auth
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<SessionTokens>> {
    request.validate()?;
    let tokens = state
        .identity
        .sign_in(request.email.trim(), &request.password)
        .await?;
    Ok(Json(tokens))
}

/// Exchange a refresh token for a new ID token
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<SessionTokens>> {
    request.validate()?;
    let tokens = state.identity.refresh(&request.refresh_token).await?;
    Ok(Json(tokens))
}

/// The verified identity of the caller
pub async fn me(auth: AuthContext) -> Json<MeResponse> {
    Json(MeResponse {
        uid: auth.uid,
        email: auth.email,
    })
}
