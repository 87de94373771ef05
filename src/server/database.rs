use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        log::info!("[DB] Connecting to database: {}", database_url);

        // SQLite creates the file but not its parent directory.
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest
        } else {
            database_url
        };
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                log::info!("[DB] Created directory: {:?}", parent);
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        log::info!("[DB] Database connection successful");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users (credentials live in the separate auth table)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                username TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Auth
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS auth (
                user_id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT NOT NULL,
                session_token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Trips
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS trips (
                id TEXT PRIMARY KEY,
                creator_id TEXT NOT NULL,
                departure_location TEXT NOT NULL,
                destination TEXT NOT NULL,
                departure_time INTEGER NOT NULL,
                available_seats INTEGER NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Participants: one row per (trip, user), whatever its status.
        // The constraint, not application logic, arbitrates duplicates.
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                UNIQUE (trip_id, user_id)
            );
        "#).execute(&self.pool).await?;

        // Direct (peer-addressed) messages
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS direct_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                body TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                read_at INTEGER
            );
        "#).execute(&self.pool).await?;

        // Group (trip-room) messages
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS group_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                sent_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Notifications
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                trip_id TEXT NOT NULL,
                participant_id INTEGER,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                action_required INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_participants_trip ON participants (trip_id, status);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_direct_messages_receiver ON direct_messages (receiver_id, read_at);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_direct_messages_trip ON direct_messages (trip_id, sent_at);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_group_messages_trip ON group_messages (trip_id, sent_at);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications (recipient_id, is_read);")
            .execute(&self.pool).await?;

        Ok(())
    }
}
