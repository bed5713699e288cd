//! RPC endpoint shell.
//!
//! Accepts Bearer tokens, server-key Basic credentials, or the opaque
//! `http_key` query parameter (compared verbatim to configuration).  No
//! runtime hooks are registered in this build, so every authorized call
//! answers not-found.

use crate::error::ServerError;
use crate::http::account::bearer_claims;
use crate::http::auth::require_server_key;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RpcQuery {
    pub http_key: Option<String>,
}

pub async fn call(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RpcQuery>,
    headers: HeaderMap,
) -> Result<(), ServerError> {
    let http_key_ok = query
        .http_key
        .as_deref()
        .is_some_and(|key| key == state.config.http_key);
    if !http_key_ok
        && bearer_claims(&state, &headers).is_err()
        && require_server_key(&state, &headers).is_err()
    {
        return Err(ServerError::Unauthenticated("rpc requires credentials".to_owned()));
    }
    Err(ServerError::NotFound(format!("RPC function not found: {id}")))
}
