use server::state::AppState;
use server::{config::Config, db, leaderboard::warmup};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const RANK_CACHE_TRIM_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    info!("connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to Postgres");
    db::run_migrations(&pool)
        .await
        .expect("failed to run database migrations");
    info!("migrations applied");

    let bind_addr = config.bind_addr.clone();
    let warmup_workers = config.rank_warmup_workers;
    let warmup_page = config.rank_warmup_page_size;
    let state = AppState::new(config, pool);

    // Warm the rank cache in the background; live writes win on generation
    // conflict so serving traffic immediately is safe.
    {
        let cache = state.rank_cache.clone();
        let pool = state.pool.clone();
        let _ = tokio::spawn(async move {
            if let Err(err) = warmup::warm_up(&cache, &pool, warmup_workers, warmup_page).await {
                error!(error = %err, "rank cache warm-up aborted");
            }
        });
    }
    {
        let cache = state.rank_cache.clone();
        let _ = tokio::spawn(async move {
            let mut tick = tokio::time::interval(RANK_CACHE_TRIM_INTERVAL);
            loop {
                let _ = tick.tick().await;
                cache.trim_expired(chrono::Utc::now().timestamp());
            }
        });
    }

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    state.stop();
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
