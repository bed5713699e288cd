pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod leaderboard;
pub mod pipeline;
pub mod repo;
pub mod router;
pub mod session;
pub mod session_registry;
pub mod state;
pub mod status;
pub mod token;
pub mod tracker;
pub mod ws;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/v1/auth/custom", post(http::auth::authenticate_custom))
        .route("/v1/auth/device", post(http::auth::authenticate_device))
        .route("/v1/auth/email", post(http::auth::authenticate_email))
        .route("/v1/account", get(http::account::get_account))
        .route("/v1/account/link/custom", post(http::account::link_custom))
        .route("/v1/account/link/device", post(http::account::link_device))
        .route("/v1/account/link/email", post(http::account::link_email))
        .route(
            "/v1/account/unlink/custom",
            post(http::account::unlink_custom),
        )
        .route(
            "/v1/account/unlink/device",
            post(http::account::unlink_device),
        )
        .route(
            "/v1/account/unlink/email",
            post(http::account::unlink_email),
        )
        .route(
            "/v1/leaderboard/{leaderboard_id}/records",
            get(http::leaderboard::list_records).post(http::leaderboard::write_record),
        )
        .route("/v1/rpc/{id}", post(http::rpc::call))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
