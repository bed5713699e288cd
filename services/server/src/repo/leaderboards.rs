//! Leaderboard persistence: definition lookup, record writes with the
//! per-owner generation counter, and the two record orderings (owner order
//! for warm-up paging, score order for listings).

use crate::db::execute_in_tx;
use crate::error::{ServerError, ServerResult};
use crate::leaderboard::cursor::RecordCursor;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Score write operators.
pub mod operator {
    pub const BEST: i16 = 0;
    pub const SET: i16 = 1;
    pub const INCREMENT: i16 = 2;
}

#[derive(Debug, Clone)]
pub struct LeaderboardRow {
    pub id: String,
    pub authoritative: bool,
    pub sort_order: i16,
    pub operator: i16,
    pub reset_schedule: Option<String>,
    pub end_time: i64,
}

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub owner_id: Uuid,
    pub username: Option<String>,
    pub score: i64,
    pub subscore: i64,
    pub num_score: i64,
}

fn leaderboard_from_row(row: &sqlx::postgres::PgRow) -> Result<LeaderboardRow, sqlx::Error> {
    Ok(LeaderboardRow {
        id: row.try_get("id")?,
        authoritative: row.try_get("authoritative")?,
        sort_order: row.try_get("sort_order")?,
        operator: row.try_get("operator")?,
        reset_schedule: row.try_get("reset_schedule")?,
        end_time: row.try_get("end_time")?,
    })
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<RecordRow, sqlx::Error> {
    Ok(RecordRow {
        owner_id: row.try_get("owner_id")?,
        username: row.try_get("username")?,
        score: row.try_get("score")?,
        subscore: row.try_get("subscore")?,
        num_score: row.try_get("num_score")?,
    })
}

pub async fn get(pool: &PgPool, leaderboard_id: &str) -> ServerResult<LeaderboardRow> {
    let row = sqlx::query(
        "SELECT id, authoritative, sort_order, operator, reset_schedule, end_time \
         FROM leaderboard WHERE id = $1",
    )
    .bind(leaderboard_id)
    .fetch_optional(pool)
    .await
    .map_err(ServerError::Db)?;
    row.as_ref()
        .map(leaderboard_from_row)
        .transpose()
        .map_err(ServerError::Db)?
        .ok_or_else(|| ServerError::NotFound("leaderboard not found".to_owned()))
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<LeaderboardRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, authoritative, sort_order, operator, reset_schedule, end_time \
         FROM leaderboard ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(leaderboard_from_row).collect()
}

/// Owner-ordered page, used by the rank cache warm-up.
pub async fn page_records_by_owner(
    pool: &PgPool,
    leaderboard_id: &str,
    expiry: i64,
    after_owner: Uuid,
    limit: i64,
) -> Result<Vec<RecordRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT owner_id, username, score, subscore, num_score FROM leaderboard_record \
         WHERE leaderboard_id = $1 AND expiry_unix = $2 AND owner_id > $3 \
         ORDER BY owner_id LIMIT $4",
    )
    .bind(leaderboard_id)
    .bind(expiry)
    .bind(after_owner)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

/// Score-ordered page for client listings, with keyset pagination over
/// `(score, subscore, owner_id)` matching the rank cache's sort predicate.
pub async fn list_records(
    pool: &PgPool,
    leaderboard_id: &str,
    expiry: i64,
    sort_order: i16,
    limit: i64,
    cursor: Option<&RecordCursor>,
) -> Result<Vec<RecordRow>, sqlx::Error> {
    let descending = sort_order != 0;
    let query = if descending {
        if cursor.is_some() {
            "SELECT owner_id, username, score, subscore, num_score FROM leaderboard_record \
             WHERE leaderboard_id = $1 AND expiry_unix = $2 \
             AND (score, subscore, owner_id) < ($4, $5, $6) \
             ORDER BY score DESC, subscore DESC, owner_id DESC LIMIT $3"
        } else {
            "SELECT owner_id, username, score, subscore, num_score FROM leaderboard_record \
             WHERE leaderboard_id = $1 AND expiry_unix = $2 \
             ORDER BY score DESC, subscore DESC, owner_id DESC LIMIT $3"
        }
    } else if cursor.is_some() {
        "SELECT owner_id, username, score, subscore, num_score FROM leaderboard_record \
         WHERE leaderboard_id = $1 AND expiry_unix = $2 \
         AND (score, subscore, owner_id) > ($4, $5, $6) \
         ORDER BY score ASC, subscore ASC, owner_id ASC LIMIT $3"
    } else {
        "SELECT owner_id, username, score, subscore, num_score FROM leaderboard_record \
         WHERE leaderboard_id = $1 AND expiry_unix = $2 \
         ORDER BY score ASC, subscore ASC, owner_id ASC LIMIT $3"
    };

    let mut q = sqlx::query(query)
        .bind(leaderboard_id)
        .bind(expiry)
        .bind(limit);
    if let Some(cursor) = cursor {
        q = q.bind(cursor.score).bind(cursor.subscore).bind(cursor.owner);
    }
    let rows = q.fetch_all(pool).await?;
    rows.iter().map(record_from_row).collect()
}

/// Apply one score write.  The operator decides how the new score combines
/// with an existing record; `num_score` is bumped unconditionally and is
/// the generation the rank cache keys stale-write rejection on.
#[allow(clippy::too_many_arguments)]
pub async fn write_record(
    pool: &PgPool,
    leaderboard_id: &str,
    expiry: i64,
    owner: Uuid,
    username: &str,
    score: i64,
    subscore: i64,
    op: i16,
    sort_order: i16,
) -> ServerResult<RecordRow> {
    let id = leaderboard_id.to_owned();
    let name = username.to_owned();
    let row = execute_in_tx(pool, move |conn| {
        let id = id.clone();
        let name = name.clone();
        Box::pin(async move {
            let existing = sqlx::query(
                "SELECT score, subscore, num_score FROM leaderboard_record \
                 WHERE leaderboard_id = $1 AND owner_id = $2 AND expiry_unix = $3 FOR UPDATE",
            )
            .bind(&id)
            .bind(owner)
            .bind(expiry)
            .fetch_optional(&mut *conn)
            .await?;

            let (new_score, new_subscore, num_score) = match existing {
                None => (score, subscore, 1i64),
                Some(row) => {
                    let old_score: i64 = row.try_get("score")?;
                    let old_subscore: i64 = row.try_get("subscore")?;
                    let old_num: i64 = row.try_get("num_score")?;
                    let descending = sort_order != 0;
                    let (s, ss) = match op {
                        operator::SET => (score, subscore),
                        operator::INCREMENT => (old_score + score, old_subscore + subscore),
                        // BEST keeps whichever side wins under the sort.
                        _ => {
                            let incoming_better = if descending {
                                (score, subscore) > (old_score, old_subscore)
                            } else {
                                (score, subscore) < (old_score, old_subscore)
                            };
                            if incoming_better {
                                (score, subscore)
                            } else {
                                (old_score, old_subscore)
                            }
                        }
                    };
                    (s, ss, old_num + 1)
                }
            };

            let _ = sqlx::query(
                "INSERT INTO leaderboard_record \
                 (leaderboard_id, owner_id, username, score, subscore, num_score, expiry_unix, update_time) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
                 ON CONFLICT (leaderboard_id, owner_id, expiry_unix) DO UPDATE SET \
                 score = EXCLUDED.score, subscore = EXCLUDED.subscore, \
                 num_score = EXCLUDED.num_score, username = EXCLUDED.username, \
                 update_time = now()",
            )
            .bind(&id)
            .bind(owner)
            .bind(&name)
            .bind(new_score)
            .bind(new_subscore)
            .bind(num_score)
            .bind(expiry)
            .execute(&mut *conn)
            .await?;

            Ok(RecordRow {
                owner_id: owner,
                username: Some(name),
                score: new_score,
                subscore: new_subscore,
                num_score,
            })
        })
    })
    .await?;
    Ok(row)
}
