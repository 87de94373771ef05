pub mod auth;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod messages;
pub mod notifications;
pub mod participants;
pub mod realtime;
pub mod trips;
pub mod users;

#[cfg(test)]
pub(crate) mod testing {
    use super::database::Database;
    use super::users::PublicUser;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh in-memory database with the full schema applied. A single
    /// connection keeps every query on the same in-memory instance.
    pub(crate) async fn test_db() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let db = Database { pool };
        db.migrate().await.expect("migrations");
        db
    }

    pub(crate) async fn seed_user(db: &Database, handle: &str) -> PublicUser {
        let id = uuid::Uuid::new_v4().to_string();
        let email = format!("{}@lnmiit.ac.in", handle.to_lowercase());
        let username = handle.to_uppercase();
        sqlx::query("INSERT INTO users (id, email, username, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(&email)
            .bind(&username)
            .bind(chrono::Utc::now().timestamp())
            .execute(&db.pool)
            .await
            .expect("seed user");
        PublicUser { id, username, email }
    }

    pub(crate) async fn seed_trip(db: &Database, creator_id: &str) -> String {
        let input = super::trips::NewTrip {
            departure_location: "Campus Gate".to_string(),
            destination: "Railway Station".to_string(),
            departure_time: chrono::Utc::now().timestamp() + 3600,
            available_seats: 2,
            description: None,
        };
        let trip = super::trips::create_trip(db, creator_id, input)
            .await
            .expect("seed trip");
        trip.id
    }
}
