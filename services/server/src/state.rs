//! Process-wide state: the registries and caches, created once at startup
//! and injected into every handler.  Construction wires the collaborators
//! leaf-first (session registry → status → tracker → router → pipeline) so
//! no component reaches back for another by name.

use crate::config::Config;
use crate::leaderboard::LeaderboardRankCache;
use crate::pipeline::Pipeline;
use crate::router::MessageRouter;
use crate::session_registry::SessionRegistry;
use crate::status::StatusRegistry;
use crate::tracker::Tracker;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub session_registry: Arc<SessionRegistry>,
    pub tracker: Arc<Tracker>,
    pub status: Arc<StatusRegistry>,
    pub router: Arc<MessageRouter>,
    pub rank_cache: Arc<LeaderboardRankCache>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Must run inside the runtime: the status registry spawns its
    /// processor task here.
    pub fn new(config: Config, pool: PgPool) -> Self {
        let config = Arc::new(config);
        let session_registry = Arc::new(SessionRegistry::new());
        let status = Arc::new(StatusRegistry::new(session_registry.clone()));
        let _ = status.start();
        let tracker = Arc::new(Tracker::new(status.clone(), session_registry.clone()));
        let router = Arc::new(MessageRouter::new(session_registry.clone(), tracker.clone()));
        let rank_cache = Arc::new(LeaderboardRankCache::new(
            config.rank_cache_blacklist.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            tracker.clone(),
            status.clone(),
            router.clone(),
        ));
        Self {
            config,
            pool,
            session_registry,
            tracker,
            status,
            router,
            rank_cache,
            pipeline,
        }
    }

    /// Graceful teardown: session registry first (cascades into every
    /// session's close, which untracks presences), then the status
    /// processor.  The tracker and rank cache hold no tasks.
    pub fn stop(&self) {
        self.session_registry.disconnect_all("server shutting down");
        self.status.stop();
    }
}
