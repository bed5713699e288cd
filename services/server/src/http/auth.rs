//! Authenticate endpoints.
//!
//! Guarded by server-key `Basic` credentials (the username component is the
//! key, the password is ignored).  Each provider validates its inputs,
//! finds or creates the account, and mints a session token.

use crate::error::{ServerError, ServerResult};
use crate::repo::accounts;
use crate::state::AppState;
use crate::token::{self, Claims};
use arena_protocol::{AuthRequest, AuthResponse};
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

const GENERATED_USERNAME_LEN: usize = 10;
const MAX_USERNAME_LEN: usize = 128;

pub fn require_server_key(state: &AppState, headers: &HeaderMap) -> ServerResult<()> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(token::parse_basic)
        .is_some_and(|(user, _)| user == state.config.server_key);
    if authorized {
        Ok(())
    } else {
        Err(ServerError::Unauthenticated(
            "server key required".to_owned(),
        ))
    }
}

/// 10-character alphanumeric id from a case-sensitive alphabet.
pub fn generate_username() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_USERNAME_LEN)
        .map(char::from)
        .collect()
}

fn resolve_username(requested: Option<&str>) -> ServerResult<String> {
    match requested {
        None | Some("") => Ok(generate_username()),
        Some(name) => {
            if name.len() > MAX_USERNAME_LEN {
                return Err(ServerError::invalid_input("username too long"));
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(ServerError::invalid_input(
                    "username has invalid characters",
                ));
            }
            Ok(name.to_owned())
        }
    }
}

fn validate_custom_id(id: Option<&str>) -> ServerResult<&str> {
    let id = id.unwrap_or_default();
    if id.len() < 6 || id.len() > 128 || !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ServerError::invalid_input(
            "custom id must be 6-128 alphanumeric characters",
        ));
    }
    Ok(id)
}

fn validate_device_id(id: Option<&str>) -> ServerResult<&str> {
    let id = id.unwrap_or_default();
    if id.len() < 10 || id.len() > 128 || !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ServerError::invalid_input(
            "device id must be 10-128 alphanumeric characters",
        ));
    }
    Ok(id)
}

fn validate_email(email: Option<&str>) -> ServerResult<&str> {
    let email = email.unwrap_or_default();
    if email.len() < 10 || email.len() > 255 {
        return Err(ServerError::invalid_input("email must be 10-255 bytes"));
    }
    if !email.contains('@') || email.contains(' ') {
        return Err(ServerError::invalid_input("invalid email address"));
    }
    Ok(email)
}

fn validate_password(password: Option<&str>) -> ServerResult<&str> {
    let password = password.unwrap_or_default();
    if password.len() < 8 {
        return Err(ServerError::invalid_input(
            "password must be at least 8 bytes",
        ));
    }
    Ok(password)
}

pub fn mint_session_token(
    state: &AppState,
    user_id: Uuid,
    username: &str,
    vars: Option<HashMap<String, String>>,
) -> ServerResult<String> {
    let claims = Claims {
        uid: user_id,
        usn: username.to_owned(),
        exp: Utc::now().timestamp() + state.config.token_expiry_secs,
        vrs: vars.unwrap_or_default(),
    };
    token::mint(&state.config.token_signing_key, &claims)
}

pub async fn authenticate_custom(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ServerError> {
    require_server_key(&state, &headers)?;
    let custom_id = validate_custom_id(request.id.as_deref())?;
    let username = resolve_username(request.username.as_deref())?;
    let create = request.create.unwrap_or(true);

    let (user_id, username, created) =
        accounts::authenticate_custom(&state.pool, custom_id, &username, create).await?;
    if created {
        info!(%user_id, "account created via custom id");
    }
    let token = mint_session_token(&state, user_id, &username, request.vars)?;
    Ok(Json(AuthResponse { token, created }))
}

pub async fn authenticate_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ServerError> {
    require_server_key(&state, &headers)?;
    let device_id = validate_device_id(request.id.as_deref())?;
    let username = resolve_username(request.username.as_deref())?;
    let create = request.create.unwrap_or(true);

    let (user_id, username, created) =
        accounts::authenticate_device(&state.pool, device_id, &username, create).await?;
    if created {
        info!(%user_id, "account created via device id");
    }
    let token = mint_session_token(&state, user_id, &username, request.vars)?;
    Ok(Json(AuthResponse { token, created }))
}

pub async fn authenticate_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ServerError> {
    require_server_key(&state, &headers)?;
    let email = validate_email(request.email.as_deref())?;
    let password = validate_password(request.password.as_deref())?;
    let username = resolve_username(request.username.as_deref())?;
    let create = request.create.unwrap_or(true);

    let (user_id, username, created) =
        accounts::authenticate_email(&state.pool, email, password, &username, create).await?;
    if created {
        info!(%user_id, "account created via email");
    }
    let token = mint_session_token(&state, user_id, &username, request.vars)?;
    Ok(Json(AuthResponse { token, created }))
}
