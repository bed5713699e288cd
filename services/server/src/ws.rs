//! WebSocket endpoint.
//!
//! Authentication happens before the upgrade: a missing, invalid, or
//! expired token is rejected with the matching HTTP status and never
//! reaches a handler.  After upgrade the session is registered, tracked on
//! its own status stream (so followers observe the login), and its reader
//! and writer loops run until a terminal condition.

use crate::session::{Session, SessionConfig, SessionFormat};
use crate::state::AppState;
use crate::token::{self, Claims};
use crate::tracker::{PresenceMeta, PresenceReason, PresenceStream};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub format: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    addr: Result<ConnectInfo<SocketAddr>, axum::extract::rejection::ExtensionRejection>,
) -> Response {
    let addr = addr.ok();
    let token = query.token.clone().or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(token::extract_bearer)
            .map(ToOwned::to_owned)
    });
    let Some(token) = token else {
        return crate::error::ServerError::Unauthenticated("missing session token".to_owned())
            .into_response();
    };
    let claims = match token::verify(
        &state.config.token_signing_key,
        &token,
        Utc::now().timestamp(),
    ) {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };
    let format = match query.format.as_deref() {
        None => SessionFormat::Text,
        Some(raw) => match SessionFormat::parse(raw) {
            Some(format) => format,
            None => {
                return crate::error::ServerError::invalid_input("unknown format").into_response();
            }
        },
    };
    let (client_ip, client_port) = addr
        .map(|ConnectInfo(addr)| (addr.ip().to_string(), addr.port()))
        .unwrap_or_else(|| ("unknown".to_owned(), 0));

    ws.on_upgrade(move |socket| run_session(state, claims, format, client_ip, client_port, socket))
}

async fn run_session(
    state: AppState,
    claims: Claims,
    format: SessionFormat,
    client_ip: String,
    client_port: u16,
    socket: axum::extract::ws::WebSocket,
) {
    let (sink, stream) = socket.split();
    let (session, tasks) = Session::new(
        SessionConfig::from(&*state.config),
        claims.uid,
        claims.usn,
        claims.exp,
        claims.vrs,
        format,
        client_ip,
        client_port,
        sink,
        state.tracker.clone(),
        state.status.clone(),
        state.session_registry.clone(),
    );
    state.session_registry.add(session.clone());
    info!(
        session_id = %session.id(),
        user_id = %session.user(),
        client_ip = %session.client_ip(),
        client_port = session.client_port(),
        "session connected"
    );

    // Establish the status-stream presence: this is what makes the login
    // visible to followers and the user count as online.
    let meta = PresenceMeta {
        hidden: false,
        persistence: false,
        username: session.name(),
        status: String::new(),
        reason: PresenceReason::Join,
    };
    let (_, _) = state.tracker.track(
        session.id(),
        PresenceStream::status(session.user()),
        session.user(),
        meta,
    );

    let reader = session.spawn_write_loop(tasks);
    session.consume(stream, reader, state.pipeline.clone()).await;
    session.close("connection closed", Vec::new()).await;
}
