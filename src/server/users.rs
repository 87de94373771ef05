use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// Profile fields safe to inline into responses and realtime events.
/// Credential material never travels through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub email: String,
}

pub async fn get_public_user(db: &Database, user_id: &str) -> ApiResult<PublicUser> {
    let row = sqlx::query("SELECT id, email, username FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    match row {
        Some(r) => Ok(PublicUser {
            id: r.get("id"),
            username: r.get("username"),
            email: r.get("email"),
        }),
        None => Err(ApiError::NotFound("user not found".to_string())),
    }
}

pub async fn find_by_email(db: &Database, email: &str) -> ApiResult<Option<PublicUser>> {
    let row = sqlx::query("SELECT id, email, username FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.map(|r| PublicUser {
        id: r.get("id"),
        username: r.get("username"),
        email: r.get("email"),
    }))
}

/// `/whoami`: the caller's own public profile.
pub async fn current_user(db: &Database, user_id: &str) -> ApiResult<PublicUser> {
    get_public_user(db, user_id).await
}
