//! Leaderboard record endpoints: write-through score submission and
//! cursor-paged listings with ranks stamped from the in-memory cache.

use crate::error::ServerError;
use crate::http::account::bearer_claims;
use crate::leaderboard::cursor::{self, RecordCursor};
use crate::leaderboard::{RankOrder, warmup};
use crate::repo::leaderboards;
use crate::state::AppState;
use arena_protocol::{RecordEntry, RecordList, RecordWrite};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

const DEFAULT_PAGE: i64 = 10;
const MAX_PAGE: i64 = 100;

pub async fn write_record(
    State(state): State<AppState>,
    Path(leaderboard_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RecordWrite>,
) -> Result<Json<RecordEntry>, ServerError> {
    let claims = bearer_claims(&state, &headers)?;
    let board = leaderboards::get(&state.pool, &leaderboard_id).await?;
    if board.authoritative {
        return Err(ServerError::PermissionDenied(
            "leaderboard only accepts authoritative score writes".to_owned(),
        ));
    }

    let now = Utc::now();
    let expiry = warmup::current_expiry(board.reset_schedule.as_deref(), board.end_time, now);
    if expiry != 0 && expiry <= now.timestamp() {
        return Err(ServerError::invalid_input("leaderboard has ended"));
    }

    let row = leaderboards::write_record(
        &state.pool,
        &board.id,
        expiry,
        claims.uid,
        &claims.usn,
        request.score,
        request.subscore,
        board.operator,
        board.sort_order,
    )
    .await?;

    let rank = state.rank_cache.insert(
        &board.id,
        RankOrder::from_sort_order(board.sort_order),
        row.score,
        row.subscore,
        row.num_score,
        expiry,
        claims.uid,
        true,
    );

    Ok(Json(RecordEntry {
        owner_id: row.owner_id,
        username: row.username,
        score: row.score,
        subscore: row.subscore,
        num_score: row.num_score,
        rank,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

pub async fn list_records(
    State(state): State<AppState>,
    Path(leaderboard_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<RecordList>, ServerError> {
    let _claims = bearer_claims(&state, &headers)?;
    let board = leaderboards::get(&state.pool, &leaderboard_id).await?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let cursor = query
        .cursor
        .as_deref()
        .map(cursor::decode)
        .transpose()?;
    let now = Utc::now();
    let expiry = match &cursor {
        // Cursors pin the window they were minted against.
        Some(cursor) => cursor.expiry,
        None => warmup::current_expiry(board.reset_schedule.as_deref(), board.end_time, now),
    };

    let rows = leaderboards::list_records(
        &state.pool,
        &board.id,
        expiry,
        board.sort_order,
        limit + 1,
        cursor.as_ref(),
    )
    .await
    .map_err(ServerError::Db)?;

    let has_more = (rows.len() as i64) > limit;
    let mut records: Vec<RecordEntry> = rows
        .into_iter()
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .map(|row| RecordEntry {
            owner_id: row.owner_id,
            username: row.username,
            score: row.score,
            subscore: row.subscore,
            num_score: row.num_score,
            rank: 0,
        })
        .collect();
    let _ = state.rank_cache.fill(&board.id, expiry, &mut records, true);

    let next_cursor = if has_more {
        records
            .last()
            .map(|last| {
                cursor::encode(&RecordCursor {
                    score: last.score,
                    subscore: last.subscore,
                    owner: last.owner_id,
                    expiry,
                    rank: last.rank,
                })
            })
            .transpose()?
    } else {
        None
    };

    Ok(Json(RecordList {
        records,
        cursor: next_cursor,
    }))
}
