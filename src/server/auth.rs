use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{is_unique_violation, ApiError, ApiResult};
use crate::server::users::PublicUser;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::RngCore;
use serde::Serialize;
use sqlx::Row;

#[derive(Debug, Clone, Serialize)]
pub struct SessionGrant {
    pub user: PublicUser,
    pub session_token: String,
}

fn hash_password(password: &str, salt_length: u32) -> ApiResult<String> {
    let mut salt_bytes = vec![0u8; salt_length as usize];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| ApiError::Dependency(format!("salt encoding: {}", e)))?;
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Dependency(format!("password hashing: {}", e)))
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn generate_session_token() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}-{:x}", uuid, md5::compute(random))
}

/// The display handle is the roll number embedded in the campus address.
fn derive_username(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_uppercase()
}

pub async fn register(
    db: &Database,
    email: &str,
    password: &str,
    config: &ServerConfig,
) -> ApiResult<SessionGrant> {
    let email = email.trim().to_lowercase();
    if !email.ends_with(&format!("@{}", config.campus_email_domain)) {
        return Err(ApiError::Validation(format!(
            "please use your {} email address",
            config.campus_email_domain
        )));
    }
    if password.len() < 6 {
        return Err(ApiError::Validation(
            "password must be at least 6 characters long".to_string(),
        ));
    }

    let user_id = uuid::Uuid::new_v4().to_string();
    let username = derive_username(&email);
    let created_at = chrono::Utc::now().timestamp();
    let password_hash = hash_password(password, config.argon2_salt_length)?;

    let mut tx = db.pool.begin().await?;
    let res = sqlx::query("INSERT INTO users (id, email, username, created_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&email)
        .bind(&username)
        .bind(created_at)
        .execute(&mut *tx)
        .await;
    if let Err(e) = res {
        if is_unique_violation(&e) {
            return Err(ApiError::Conflict(
                "user already exists with this email".to_string(),
            ));
        }
        return Err(e.into());
    }
    sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;

    // Session issued right away, as with login.
    let session_token = generate_session_token();
    let expires = created_at + 60 * 60 * 24 * config.session_expiry_days as i64;
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&session_token)
        .bind(created_at)
        .bind(expires)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("[AUTH] Registered user {} (id={})", username, user_id);
    Ok(SessionGrant {
        user: PublicUser { id: user_id, username, email },
        session_token,
    })
}

pub async fn login(
    db: &Database,
    email: &str,
    password: &str,
    config: &ServerConfig,
) -> ApiResult<SessionGrant> {
    let email = email.trim().to_lowercase();
    let row = sqlx::query(
        "SELECT users.id, users.username, password_hash FROM users JOIN auth ON users.id = auth.user_id WHERE email = ?",
    )
    .bind(&email)
    .fetch_optional(&db.pool)
    .await?;

    let Some(row) = row else {
        return Err(ApiError::NotAuthorized("invalid email or password".to_string()));
    };
    let user_id: String = row.get("id");
    let username: String = row.get("username");
    let password_hash: String = row.get("password_hash");
    if !verify_password(&password_hash, password) {
        log::info!("[AUTH] Login failed for {}: wrong password", email);
        return Err(ApiError::NotAuthorized("invalid email or password".to_string()));
    }

    // Single-session semantics: a new login invalidates earlier tokens.
    let mut tx = db.pool.begin().await?;
    sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
    let session_token = generate_session_token();
    let now = chrono::Utc::now().timestamp();
    let expires = now + 60 * 60 * 24 * config.session_expiry_days as i64;
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&session_token)
        .bind(now)
        .bind(expires)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("[AUTH] Login success for {} (id={})", email, user_id);
    Ok(SessionGrant {
        user: PublicUser { id: user_id, username, email },
        session_token,
    })
}

pub async fn logout(db: &Database, session_token: &str) -> ApiResult<()> {
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ?")
        .bind(session_token)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Err(ApiError::NotFound("session not found".to_string()));
    };
    let user_id: String = row.get("user_id");
    let res = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(&user_id)
        .execute(&db.pool)
        .await?;
    log::info!(
        "[AUTH] Logout for user {} ({} session rows removed)",
        user_id,
        res.rows_affected()
    );
    Ok(())
}

/// Resolves a session token to its user, `None` if unknown or expired.
pub async fn validate_session(db: &Database, session_token: &str) -> Option<String> {
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(session_token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await
        .ok()?;
    row.map(|r| r.get("user_id"))
}

/// Removes expired sessions. Idempotent, safe to run periodically.
pub async fn cleanup_expired_sessions(db: &Database) {
    let now = chrono::Utc::now().timestamp();
    match sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await
    {
        Ok(res) => {
            if res.rows_affected() > 0 {
                log::info!("[AUTH] Cleaned up {} expired sessions", res.rows_affected());
            }
        }
        Err(e) => log::warn!("[AUTH] Failed to cleanup sessions: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::test_db;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: String::new(),
            redis_url: String::new(),
            enable_tls: false,
            log_level: "info".to_string(),
            session_expiry_days: 7,
            argon2_salt_length: 16,
            campus_email_domain: "lnmiit.ac.in".to_string(),
        }
    }

    #[tokio::test]
    async fn register_then_login_yields_valid_session() {
        let db = test_db().await;
        let config = test_config();
        let grant = register(&db, "21ucs123@lnmiit.ac.in", "secret1", &config)
            .await
            .unwrap();
        assert_eq!(grant.user.username, "21UCS123");

        let login_grant = login(&db, "21ucs123@lnmiit.ac.in", "secret1", &config)
            .await
            .unwrap();
        let uid = validate_session(&db, &login_grant.session_token)
            .await
            .unwrap();
        assert_eq!(uid, grant.user.id);
        // The registration token was invalidated by the login.
        assert!(validate_session(&db, &grant.session_token).await.is_none());
    }

    #[tokio::test]
    async fn register_rejects_foreign_domain_and_duplicates() {
        let db = test_db().await;
        let config = test_config();
        let err = register(&db, "someone@gmail.com", "secret1", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        register(&db, "21ucs123@lnmiit.ac.in", "secret1", &config)
            .await
            .unwrap();
        let err = register(&db, "21ucs123@lnmiit.ac.in", "other-pass", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn wrong_password_is_not_authorized() {
        let db = test_db().await;
        let config = test_config();
        register(&db, "21ucs123@lnmiit.ac.in", "secret1", &config)
            .await
            .unwrap();
        let err = login(&db, "21ucs123@lnmiit.ac.in", "wrong", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_authorized");
    }
}
