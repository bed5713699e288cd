//! Account persistence: authenticate-or-create per provider, identifier
//! linking, and the last-identifier invariant on unlink.
//!
//! A user must always retain at least one identifier (custom id, device id,
//! or email); the unlink paths enforce that inside a transaction so a
//! concurrent unlink cannot strip the final one.

use crate::db::{self, execute_in_tx, execute_retryable};
use crate::error::{ServerError, ServerResult};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

async fn fetch_user_by(
    pool: &PgPool,
    query: &str,
    binding: &str,
) -> Result<Option<(Uuid, String)>, sqlx::Error> {
    let row = sqlx::query(query).bind(binding).fetch_optional(pool).await?;
    row.map(|row| Ok((row.try_get("id")?, row.try_get("username")?)))
        .transpose()
}

async fn insert_user(
    pool: &PgPool,
    username: &str,
    custom_id: Option<&str>,
    email: Option<&str>,
    password_hash: Option<&str>,
) -> Result<Uuid, sqlx::Error> {
    let user_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (id, username, custom_id, email, password, create_time, update_time) \
         VALUES ($1, $2, $3, $4, $5, now(), now())",
    )
    .bind(user_id)
    .bind(username)
    .bind(custom_id)
    .bind(email)
    .bind(password_hash)
    .execute(pool)
    .await?;
    Ok(user_id)
}

fn map_create_error(err: sqlx::Error) -> ServerError {
    if db::is_unique_violation(&err) {
        ServerError::AlreadyExists("username is already in use".to_owned())
    } else {
        ServerError::Db(err)
    }
}

/// Find or create an account keyed by custom id.
/// Returns `(user_id, username, created)`.
pub async fn authenticate_custom(
    pool: &PgPool,
    custom_id: &str,
    username: &str,
    create: bool,
) -> ServerResult<(Uuid, String, bool)> {
    let found = execute_retryable(|| {
        fetch_user_by(pool, "SELECT id, username FROM users WHERE custom_id = $1", custom_id)
    })
    .await?;
    if let Some((user_id, username)) = found {
        return Ok((user_id, username, false));
    }
    if !create {
        return Err(ServerError::NotFound("user account not found".to_owned()));
    }
    match insert_user(pool, username, Some(custom_id), None, None).await {
        Ok(user_id) => Ok((user_id, username.to_owned(), true)),
        Err(err) if db::is_unique_violation(&err) => {
            // Concurrent create with the same custom id wins the race; a
            // username collision surfaces to the caller instead.
            let found = fetch_user_by(
                pool,
                "SELECT id, username FROM users WHERE custom_id = $1",
                custom_id,
            )
            .await?;
            match found {
                Some((user_id, username)) => Ok((user_id, username, false)),
                None => Err(map_create_error(err)),
            }
        }
        Err(err) => Err(ServerError::Db(err)),
    }
}

/// Find or create an account keyed by device id (stored in `user_device`).
pub async fn authenticate_device(
    pool: &PgPool,
    device_id: &str,
    username: &str,
    create: bool,
) -> ServerResult<(Uuid, String, bool)> {
    let found = execute_retryable(|| async {
        let row = sqlx::query(
            "SELECT u.id, u.username FROM users u \
             JOIN user_device d ON d.user_id = u.id WHERE d.id = $1",
        )
        .bind(device_id)
        .fetch_optional(pool)
        .await?;
        row.map(|row| {
            Ok::<(Uuid, String), sqlx::Error>((row.try_get("id")?, row.try_get("username")?))
        })
        .transpose()
    })
    .await?;
    if let Some((user_id, username)) = found {
        return Ok((user_id, username, false));
    }
    if !create {
        return Err(ServerError::NotFound("user account not found".to_owned()));
    }

    let device = device_id.to_owned();
    let name = username.to_owned();
    let created = execute_in_tx(pool, move |conn| {
        let device = device.clone();
        let name = name.clone();
        Box::pin(async move {
            let user_id = Uuid::new_v4();
            let _ = sqlx::query(
                "INSERT INTO users (id, username, create_time, update_time) \
                 VALUES ($1, $2, now(), now())",
            )
            .bind(user_id)
            .bind(&name)
            .execute(&mut *conn)
            .await?;
            let _ = sqlx::query("INSERT INTO user_device (id, user_id) VALUES ($1, $2)")
                .bind(&device)
                .bind(user_id)
                .execute(&mut *conn)
                .await?;
            Ok(user_id)
        })
    })
    .await;
    match created {
        Ok(user_id) => Ok((user_id, username.to_owned(), true)),
        Err(crate::db::TxError::Db(err)) => Err(map_create_error(err)),
        Err(err) => Err(err.into()),
    }
}

/// Find or create an account keyed by email; verifies the password on an
/// existing account.
pub async fn authenticate_email(
    pool: &PgPool,
    email: &str,
    password: &str,
    username: &str,
    create: bool,
) -> ServerResult<(Uuid, String, bool)> {
    let row = execute_retryable(|| async {
        sqlx::query("SELECT id, username, password FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(pool)
            .await
    })
    .await?;
    if let Some(row) = row {
        let user_id: Uuid = row.try_get("id").map_err(ServerError::Db)?;
        let stored_name: String = row.try_get("username").map_err(ServerError::Db)?;
        let stored_hash: Option<String> = row.try_get("password").map_err(ServerError::Db)?;
        if stored_hash.as_deref() != Some(hash_password(password).as_str()) {
            return Err(ServerError::Unauthenticated("invalid credentials".to_owned()));
        }
        return Ok((user_id, stored_name, false));
    }
    if !create {
        return Err(ServerError::NotFound("user account not found".to_owned()));
    }
    match insert_user(pool, username, None, Some(email), Some(&hash_password(password))).await {
        Ok(user_id) => Ok((user_id, username.to_owned(), true)),
        Err(err) => Err(map_create_error(err)),
    }
}

/// Own-account view: identifier columns plus linked device ids.
pub struct AccountRow {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub custom_id: Option<String>,
    pub device_ids: Vec<String>,
}

pub async fn get_account(pool: &PgPool, user_id: Uuid) -> ServerResult<AccountRow> {
    let row = sqlx::query("SELECT username, email, custom_id FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(ServerError::Db)?
        .ok_or_else(|| ServerError::NotFound("user account not found".to_owned()))?;
    let username: String = row.try_get("username").map_err(ServerError::Db)?;
    let email: Option<String> = row.try_get("email").map_err(ServerError::Db)?;
    let custom_id: Option<String> = row.try_get("custom_id").map_err(ServerError::Db)?;

    let device_rows = sqlx::query("SELECT id FROM user_device WHERE user_id = $1 ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(ServerError::Db)?;
    let device_ids = device_rows
        .iter()
        .map(|row| row.try_get("id"))
        .collect::<Result<Vec<String>, sqlx::Error>>()
        .map_err(ServerError::Db)?;

    Ok(AccountRow {
        user_id,
        username,
        email,
        custom_id,
        device_ids,
    })
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

async fn link_column(
    pool: &PgPool,
    user_id: Uuid,
    column: &'static str,
    value: &str,
) -> ServerResult<()> {
    // Identifier columns carry unique indexes; a conflict means the
    // identifier already belongs to some account.
    let query = format!(
        "UPDATE users SET {column} = $2, update_time = now() WHERE id = $1"
    );
    match sqlx::query(&query).bind(user_id).bind(value).execute(pool).await {
        Ok(result) if result.rows_affected() == 0 => {
            Err(ServerError::NotFound("user account not found".to_owned()))
        }
        Ok(_) => Ok(()),
        Err(err) if db::is_unique_violation(&err) => Err(ServerError::AlreadyExists(
            "identifier is already linked to another account".to_owned(),
        )),
        Err(err) => Err(ServerError::Db(err)),
    }
}

pub async fn link_custom(pool: &PgPool, user_id: Uuid, custom_id: &str) -> ServerResult<()> {
    link_column(pool, user_id, "custom_id", custom_id).await
}

pub async fn link_email(
    pool: &PgPool,
    user_id: Uuid,
    email: &str,
    password: &str,
) -> ServerResult<()> {
    let hash = hash_password(password);
    match sqlx::query(
        "UPDATE users SET email = $2, password = $3, update_time = now() WHERE id = $1",
    )
    .bind(user_id)
    .bind(email)
    .bind(&hash)
    .execute(pool)
    .await
    {
        Ok(result) if result.rows_affected() == 0 => {
            Err(ServerError::NotFound("user account not found".to_owned()))
        }
        Ok(_) => Ok(()),
        Err(err) if db::is_unique_violation(&err) => Err(ServerError::AlreadyExists(
            "email is already linked to another account".to_owned(),
        )),
        Err(err) => Err(ServerError::Db(err)),
    }
}

pub async fn link_device(pool: &PgPool, user_id: Uuid, device_id: &str) -> ServerResult<()> {
    match sqlx::query("INSERT INTO user_device (id, user_id) VALUES ($1, $2)")
        .bind(device_id)
        .bind(user_id)
        .execute(pool)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if db::is_unique_violation(&err) => Err(ServerError::AlreadyExists(
            "device is already linked to another account".to_owned(),
        )),
        Err(err) => Err(ServerError::Db(err)),
    }
}

// ---------------------------------------------------------------------------
// Unlinking
// ---------------------------------------------------------------------------

enum UnlinkOutcome {
    Done,
    LastIdentifier,
    NotFound,
}

#[derive(Clone, Copy)]
enum Identifier {
    Custom,
    Email,
    Device,
}

async fn unlink(pool: &PgPool, user_id: Uuid, which: Identifier, device_id: Option<String>) -> ServerResult<()> {
    let outcome = execute_in_tx(pool, move |conn| {
        let device_id = device_id.clone();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT custom_id IS NOT NULL AS has_custom, email IS NOT NULL AS has_email, \
                 (SELECT COUNT(*) FROM user_device WHERE user_id = $1) AS device_count \
                 FROM users WHERE id = $1 FOR UPDATE",
            )
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
            let Some(row) = row else {
                return Ok(UnlinkOutcome::NotFound);
            };
            let has_custom: bool = row.try_get("has_custom")?;
            let has_email: bool = row.try_get("has_email")?;
            let device_count: i64 = row.try_get("device_count")?;

            let remaining = match which {
                Identifier::Custom => i64::from(has_email) + device_count,
                Identifier::Email => i64::from(has_custom) + device_count,
                Identifier::Device => {
                    i64::from(has_custom) + i64::from(has_email) + device_count - 1
                }
            };
            if remaining < 1 {
                return Ok(UnlinkOutcome::LastIdentifier);
            }

            match which {
                Identifier::Custom => {
                    let _ = sqlx::query(
                        "UPDATE users SET custom_id = NULL, update_time = now() WHERE id = $1",
                    )
                    .bind(user_id)
                    .execute(&mut *conn)
                    .await?;
                }
                Identifier::Email => {
                    let _ = sqlx::query(
                        "UPDATE users SET email = NULL, password = NULL, update_time = now() \
                         WHERE id = $1",
                    )
                    .bind(user_id)
                    .execute(&mut *conn)
                    .await?;
                }
                Identifier::Device => {
                    let _ = sqlx::query("DELETE FROM user_device WHERE user_id = $1 AND id = $2")
                        .bind(user_id)
                        .bind(device_id.as_deref().unwrap_or_default())
                        .execute(&mut *conn)
                        .await?;
                }
            }
            Ok(UnlinkOutcome::Done)
        })
    })
    .await?;

    match outcome {
        UnlinkOutcome::Done => Ok(()),
        UnlinkOutcome::NotFound => Err(ServerError::NotFound("user account not found".to_owned())),
        UnlinkOutcome::LastIdentifier => Err(ServerError::PermissionDenied(
            "cannot unlink the last account identifier".to_owned(),
        )),
    }
}

pub async fn unlink_custom(pool: &PgPool, user_id: Uuid) -> ServerResult<()> {
    unlink(pool, user_id, Identifier::Custom, None).await
}

pub async fn unlink_email(pool: &PgPool, user_id: Uuid) -> ServerResult<()> {
    unlink(pool, user_id, Identifier::Email, None).await
}

pub async fn unlink_device(pool: &PgPool, user_id: Uuid, device_id: &str) -> ServerResult<()> {
    unlink(pool, user_id, Identifier::Device, Some(device_id.to_owned())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_stable_and_hex() {
        let hash = hash_password("hunter2!");
        assert_eq!(hash, hash_password("hunter2!"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, hash_password("hunter3!"));
    }
}
