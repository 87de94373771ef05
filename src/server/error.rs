use thiserror::Error;

/// Error taxonomy shared by every core operation. Each variant maps to a
/// stable wire kind; dependency failures carry their detail for the log only
/// and display a generic message to callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotAuthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("service temporarily unavailable")]
    Dependency(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::NotFound(_) => "not_found",
            ApiError::NotAuthorized(_) => "not_authorized",
            ApiError::Conflict(_) => "conflict",
            ApiError::Dependency(_) => "unavailable",
        }
    }

    /// Protocol form: `ERR <kind>: <message>`.
    pub fn to_wire(&self) -> String {
        format!("ERR {}: {}", self.kind(), self)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        log::error!("[DB] query failed: {}", e);
        ApiError::Dependency(e.to_string())
    }
}

/// Whether a store error is a UNIQUE constraint violation. The store is the
/// sole arbiter of uniqueness invariants, so insert paths ask this instead of
/// checking-then-inserting.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
