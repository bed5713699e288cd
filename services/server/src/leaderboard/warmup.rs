//! Rank cache warm-up.
//!
//! On startup every non-expired leaderboard is paged through in owner
//! order and inserted under its current reset window.  Leaderboards are
//! processed by a bounded pool of concurrent workers.  Live writes landing
//! during warm-up are serialized through the per-window lock and win on
//! generation conflict, so the warm-up never clobbers them.

use super::{LeaderboardRankCache, RankOrder};
use crate::repo::leaderboards;
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures_util::StreamExt;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Current reset boundary for a leaderboard: the next occurrence of the
/// reset schedule, the configured end time when no schedule exists, or 0
/// for a leaderboard that never expires.
pub fn current_expiry(
    reset_schedule: Option<&str>,
    end_time: i64,
    now: DateTime<Utc>,
) -> i64 {
    if let Some(raw) = reset_schedule {
        if let Ok(schedule) = Schedule::from_str(raw) {
            if let Some(next) = schedule.after(&now).next() {
                return next.timestamp();
            }
        } else {
            warn!(schedule = raw, "unparseable reset schedule, falling back to end time");
        }
    }
    end_time
}

pub async fn warm_up(
    cache: &Arc<LeaderboardRankCache>,
    pool: &PgPool,
    workers: usize,
    page_size: i64,
) -> Result<usize, sqlx::Error> {
    let now = Utc::now();
    let boards = leaderboards::list_all(pool).await?;
    let total = boards.len();
    info!(leaderboards = total, workers, "rank cache warm-up starting");

    futures_util::stream::iter(boards)
        .for_each_concurrent(workers.max(1), |board| {
            let cache = cache.clone();
            let pool = pool.clone();
            async move {
                let expiry = current_expiry(board.reset_schedule.as_deref(), board.end_time, now);
                if expiry != 0 && expiry <= now.timestamp() {
                    return;
                }
                if !cache.caching_enabled(&board.id) {
                    return;
                }
                if let Err(err) = load_board(&cache, &pool, &board, expiry, page_size).await {
                    warn!(leaderboard = %board.id, error = %err, "rank cache warm-up failed");
                }
            }
        })
        .await;

    info!("rank cache warm-up finished");
    Ok(total)
}

async fn load_board(
    cache: &Arc<LeaderboardRankCache>,
    pool: &PgPool,
    board: &leaderboards::LeaderboardRow,
    expiry: i64,
    page_size: i64,
) -> Result<(), sqlx::Error> {
    let order = RankOrder::from_sort_order(board.sort_order);
    let mut after_owner = Uuid::nil();
    loop {
        let page =
            leaderboards::page_records_by_owner(pool, &board.id, expiry, after_owner, page_size)
                .await?;
        let page_len = page.len();
        for record in &page {
            let _ = cache.insert(
                &board.id,
                order,
                record.score,
                record.subscore,
                record.num_score,
                expiry,
                record.owner_id,
                true,
            );
            after_owner = record.owner_id;
        }
        if (page_len as i64) < page_size {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiry_prefers_the_schedule_over_end_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().expect("valid time");
        // Daily at midnight UTC (sec min hour day month weekday).
        let expiry = current_expiry(Some("0 0 0 * * *"), 99, now);
        let next_midnight = Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).single().expect("valid time");
        assert_eq!(expiry, next_midnight.timestamp());
    }

    #[test]
    fn expiry_falls_back_to_end_time_without_a_schedule() {
        let now = Utc::now();
        assert_eq!(current_expiry(None, 1234, now), 1234);
        assert_eq!(current_expiry(None, 0, now), 0);
        assert_eq!(current_expiry(Some("garbage"), 77, now), 77);
    }
}
