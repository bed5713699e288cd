//! Identifier link/unlink endpoints, Bearer-authenticated.
//!
//! Unlinking is refused when it would strip the account's last identifier.

use crate::error::{ServerError, ServerResult};
use crate::repo::accounts;
use crate::state::AppState;
use crate::token::{self, Claims};
use arena_protocol::{Ack, AuthRequest};
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;

pub fn bearer_claims(state: &AppState, headers: &HeaderMap) -> ServerResult<Claims> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(token::extract_bearer)
        .ok_or_else(|| ServerError::Unauthenticated("missing bearer token".to_owned()))?;
    token::verify(&state.config.token_signing_key, raw, Utc::now().timestamp())
}

pub async fn get_account(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<arena_protocol::Account>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    let row = accounts::get_account(&state.pool, claims.uid).await?;
    Ok(Json(arena_protocol::Account {
        user_id: row.user_id,
        username: row.username,
        email: row.email,
        custom_id: row.custom_id,
        device_ids: row.device_ids,
        online: state.status.is_online(claims.uid),
    }))
}

pub async fn link_custom(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<Ack>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    let id = request
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ServerError::invalid_input("custom id is required"))?;
    accounts::link_custom(&state.pool, claims.uid, id).await?;
    Ok(Json(Ack {}))
}

pub async fn link_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<Ack>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    let id = request
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ServerError::invalid_input("device id is required"))?;
    accounts::link_device(&state.pool, claims.uid, id).await?;
    Ok(Json(Ack {}))
}

pub async fn link_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<Ack>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    let email = request
        .email
        .as_deref()
        .filter(|email| !email.is_empty())
        .ok_or_else(|| ServerError::invalid_input("email is required"))?;
    let password = request
        .password
        .as_deref()
        .filter(|password| password.len() >= 8)
        .ok_or_else(|| ServerError::invalid_input("password must be at least 8 bytes"))?;
    accounts::link_email(&state.pool, claims.uid, email, password).await?;
    Ok(Json(Ack {}))
}

pub async fn unlink_custom(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Ack>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    accounts::unlink_custom(&state.pool, claims.uid).await?;
    Ok(Json(Ack {}))
}

pub async fn unlink_email(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Ack>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    accounts::unlink_email(&state.pool, claims.uid).await?;
    Ok(Json(Ack {}))
}

pub async fn unlink_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<Ack>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    let id = request
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ServerError::invalid_input("device id is required"))?;
    accounts::unlink_device(&state.pool, claims.uid, id).await?;
    Ok(Json(Ack {}))
}
