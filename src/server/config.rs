use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub enable_tls: bool,
    pub log_level: String,
    pub session_expiry_days: u32,
    pub argon2_salt_length: u32,
    pub campus_email_domain: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/campool.db".to_string()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            enable_tls: env::var("ENABLE_TLS").map(|v| v == "true" || v == "1").unwrap_or(false),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            session_expiry_days: env::var("SESSION_EXPIRY_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(7),
            argon2_salt_length: env::var("ARGON2_SALT_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(16),
            campus_email_domain: env::var("CAMPUS_EMAIL_DOMAIN").unwrap_or_else(|_| "lnmiit.ac.in".to_string()),
        }
    }
}
