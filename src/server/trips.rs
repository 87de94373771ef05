use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use crate::server::notifications;
use crate::server::participants::{self, ParticipantView};
use crate::server::users::{self, PublicUser};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_CANCELLED: &str = "cancelled";

/// Raw trip record as stored. Internal currency between the trip, participation
/// and messaging modules; views returned to callers inline the creator profile.
#[derive(Debug, Clone)]
pub struct TripRow {
    pub id: String,
    pub creator_id: String,
    pub departure_location: String,
    pub destination: String,
    pub departure_time: i64,
    pub available_seats: i64,
    pub description: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TripView {
    pub id: String,
    pub creator: PublicUser,
    pub departure_location: String,
    pub destination: String,
    pub departure_time: i64,
    pub available_seats: i64,
    pub description: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// The caller's own participation, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participation: Option<ParticipationSummary>,
    /// Full participant list, only on trips the caller created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantView>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipationSummary {
    pub id: i64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTrip {
    pub departure_location: String,
    pub destination: String,
    pub departure_time: i64,
    pub available_seats: i64,
    pub description: Option<String>,
}

/// Creator-only field patch; absent fields stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TripPatch {
    pub departure_location: Option<String>,
    pub destination: Option<String>,
    pub departure_time: Option<i64>,
    pub available_seats: Option<i64>,
    pub description: Option<String>,
    pub status: Option<String>,
}

fn trip_from_row(r: &SqliteRow) -> TripRow {
    TripRow {
        id: r.get("id"),
        creator_id: r.get("creator_id"),
        departure_location: r.get("departure_location"),
        destination: r.get("destination"),
        departure_time: r.get("departure_time"),
        available_seats: r.get("available_seats"),
        description: r.get("description"),
        status: r.get("status"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

pub(crate) async fn fetch_trip(db: &Database, trip_id: &str) -> ApiResult<TripRow> {
    let row = sqlx::query("SELECT * FROM trips WHERE id = ?")
        .bind(trip_id)
        .fetch_optional(&db.pool)
        .await?;
    match row {
        Some(r) => Ok(trip_from_row(&r)),
        None => Err(ApiError::NotFound("trip not found".to_string())),
    }
}

async fn view_of(db: &Database, trip: TripRow) -> ApiResult<TripView> {
    let creator = users::get_public_user(db, &trip.creator_id).await?;
    Ok(TripView {
        id: trip.id,
        creator,
        departure_location: trip.departure_location,
        destination: trip.destination,
        departure_time: trip.departure_time,
        available_seats: trip.available_seats,
        description: trip.description,
        status: trip.status,
        created_at: trip.created_at,
        updated_at: trip.updated_at,
        participation: None,
        participants: None,
    })
}

fn validate_location(value: &str, field: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn validate_seats(seats: i64) -> ApiResult<i64> {
    if !(1..=8).contains(&seats) {
        return Err(ApiError::Validation(
            "available seats must be between 1 and 8".to_string(),
        ));
    }
    Ok(seats)
}

fn validate_departure(departure_time: i64) -> ApiResult<i64> {
    if departure_time <= chrono::Utc::now().timestamp() {
        return Err(ApiError::Validation(
            "departure time must be in the future".to_string(),
        ));
    }
    Ok(departure_time)
}

fn validate_description(value: &str) -> ApiResult<Option<String>> {
    let trimmed = value.trim();
    if trimmed.chars().count() > 500 {
        return Err(ApiError::Validation(
            "description must be less than 500 characters".to_string(),
        ));
    }
    Ok(if trimmed.is_empty() { None } else { Some(trimmed.to_string()) })
}

fn validate_status(value: &str) -> ApiResult<String> {
    match value {
        STATUS_ACTIVE | STATUS_COMPLETED | STATUS_CANCELLED => Ok(value.to_string()),
        _ => Err(ApiError::Validation(format!("unknown trip status '{}'", value))),
    }
}

pub async fn create_trip(db: &Database, creator_id: &str, input: NewTrip) -> ApiResult<TripView> {
    let departure_location = validate_location(&input.departure_location, "departure location")?;
    let destination = validate_location(&input.destination, "destination")?;
    let departure_time = validate_departure(input.departure_time)?;
    let available_seats = validate_seats(input.available_seats)?;
    let description = match &input.description {
        Some(d) => validate_description(d)?,
        None => None,
    };

    let trip_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO trips (id, creator_id, departure_location, destination, departure_time, available_seats, description, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)",
    )
    .bind(&trip_id)
    .bind(creator_id)
    .bind(&departure_location)
    .bind(&destination)
    .bind(departure_time)
    .bind(available_seats)
    .bind(&description)
    .bind(now)
    .bind(now)
    .execute(&db.pool)
    .await?;

    log::info!("[TRIPS] Trip {} created by {}", trip_id, creator_id);
    let trip = fetch_trip(db, &trip_id).await?;
    view_of(db, trip).await
}

/// All active trips ordered by departure, each annotated with the caller's
/// own participation; trips the caller created carry the full roster.
pub async fn list_trips(db: &Database, caller_id: &str) -> ApiResult<Vec<TripView>> {
    let rows = sqlx::query("SELECT * FROM trips WHERE status = 'active' ORDER BY departure_time ASC, id ASC")
        .fetch_all(&db.pool)
        .await?;
    let mut views = Vec::with_capacity(rows.len());
    for r in &rows {
        let trip = trip_from_row(r);
        let trip_id = trip.id.clone();
        let is_own = trip.creator_id == caller_id;
        let mut view = view_of(db, trip).await?;
        view.participation = participation_summary(db, &trip_id, caller_id).await?;
        if is_own {
            view.participants = Some(participants::participant_views_for_trip(db, &trip_id).await?);
        }
        views.push(view);
    }
    Ok(views)
}

async fn participation_summary(
    db: &Database,
    trip_id: &str,
    user_id: &str,
) -> ApiResult<Option<ParticipationSummary>> {
    let row = sqlx::query("SELECT id, status FROM participants WHERE trip_id = ? AND user_id = ?")
        .bind(trip_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.map(|r| ParticipationSummary {
        id: r.get("id"),
        status: r.get("status"),
    }))
}

pub async fn get_trip(db: &Database, trip_id: &str) -> ApiResult<TripView> {
    let trip = fetch_trip(db, trip_id).await?;
    view_of(db, trip).await
}

pub async fn update_trip(
    db: &Database,
    trip_id: &str,
    caller_id: &str,
    patch: TripPatch,
) -> ApiResult<TripView> {
    let current = fetch_trip(db, trip_id).await?;
    if current.creator_id != caller_id {
        return Err(ApiError::NotAuthorized(
            "not authorized to update this trip".to_string(),
        ));
    }

    let departure_location = match &patch.departure_location {
        Some(v) => validate_location(v, "departure location")?,
        None => current.departure_location.clone(),
    };
    let destination = match &patch.destination {
        Some(v) => validate_location(v, "destination")?,
        None => current.destination.clone(),
    };
    let departure_time = match patch.departure_time {
        Some(v) => validate_departure(v)?,
        None => current.departure_time,
    };
    let available_seats = match patch.available_seats {
        Some(v) => validate_seats(v)?,
        None => current.available_seats,
    };
    let description = match &patch.description {
        Some(v) => validate_description(v)?,
        None => current.description.clone(),
    };
    let status = match &patch.status {
        Some(v) => validate_status(v)?,
        None => current.status.clone(),
    };

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE trips SET departure_location = ?, destination = ?, departure_time = ?, available_seats = ?, description = ?, status = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&departure_location)
    .bind(&destination)
    .bind(departure_time)
    .bind(available_seats)
    .bind(&description)
    .bind(&status)
    .bind(now)
    .bind(trip_id)
    .execute(&db.pool)
    .await?;

    let updated = fetch_trip(db, trip_id).await?;

    // Post-commit fan-out to approved participants; dispatch failure must
    // not fail the update.
    let cancelled_now = updated.status == STATUS_CANCELLED && current.status != STATUS_CANCELLED;
    let dispatch = if cancelled_now {
        notifications::notify_trip_cancelled(db, &updated, caller_id).await
    } else {
        notifications::notify_trip_update(db, &updated, caller_id).await
    };
    if let Err(e) = dispatch {
        log::warn!("[TRIPS] Notification dispatch failed for trip {}: {}", trip_id, e);
    }

    view_of(db, updated).await
}

/// Creator-only. Trip and participant rows go in one transaction so no
/// reader observes a deleted trip with live participations.
pub async fn delete_trip(db: &Database, trip_id: &str, caller_id: &str) -> ApiResult<()> {
    let trip = fetch_trip(db, trip_id).await?;
    if trip.creator_id != caller_id {
        return Err(ApiError::NotAuthorized(
            "not authorized to delete this trip".to_string(),
        ));
    }
    let mut tx = db.pool.begin().await?;
    sqlx::query("DELETE FROM trips WHERE id = ?")
        .bind(trip_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM participants WHERE trip_id = ?")
        .bind(trip_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    log::info!("[TRIPS] Trip {} deleted by {}", trip_id, caller_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::participants::{decide, request_join};
    use crate::server::testing::{seed_trip, seed_user, test_db};

    fn future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn create_rejects_past_departure_and_bad_seats() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;

        let past = NewTrip {
            departure_location: "Campus".to_string(),
            destination: "Station".to_string(),
            departure_time: chrono::Utc::now().timestamp() - 60,
            available_seats: 2,
            description: None,
        };
        assert_eq!(create_trip(&db, &alice.id, past).await.unwrap_err().kind(), "validation");

        let crowded = NewTrip {
            departure_location: "Campus".to_string(),
            destination: "Station".to_string(),
            departure_time: future(),
            available_seats: 9,
            description: None,
        };
        assert_eq!(create_trip(&db, &alice.id, crowded).await.unwrap_err().kind(), "validation");
    }

    #[tokio::test]
    async fn description_limit_counts_characters_not_bytes() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;

        // 400 characters, 800 bytes: within the 500-character cap.
        let trip = create_trip(
            &db,
            &alice.id,
            NewTrip {
                departure_location: "Campus".to_string(),
                destination: "Station".to_string(),
                departure_time: future(),
                available_seats: 2,
                description: Some("ü".repeat(400)),
            },
        )
        .await
        .unwrap();
        assert_eq!(trip.description.unwrap().chars().count(), 400);

        let err = create_trip(
            &db,
            &alice.id,
            NewTrip {
                departure_location: "Campus".to_string(),
                destination: "Station".to_string(),
                departure_time: future(),
                available_seats: 2,
                description: Some("ü".repeat(501)),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn update_by_non_creator_leaves_trip_unchanged() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let trip_id = seed_trip(&db, &alice.id).await;

        let patch = TripPatch {
            destination: Some("Airport".to_string()),
            ..TripPatch::default()
        };
        let err = update_trip(&db, &trip_id, &bob.id, patch).await.unwrap_err();
        assert_eq!(err.kind(), "not_authorized");

        let trip = fetch_trip(&db, &trip_id).await.unwrap();
        assert_eq!(trip.destination, "Railway Station");
    }

    #[tokio::test]
    async fn cancelling_fans_out_to_approved_participants_only() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let carol = seed_user(&db, "21ucs003").await;
        let trip_id = seed_trip(&db, &alice.id).await;

        let p_bob = request_join(&db, &trip_id, &bob.id).await.unwrap();
        request_join(&db, &trip_id, &carol.id).await.unwrap();
        decide(&db, &trip_id, p_bob.id, "approved", &alice.id).await.unwrap();

        let patch = TripPatch {
            status: Some(STATUS_CANCELLED.to_string()),
            ..TripPatch::default()
        };
        update_trip(&db, &trip_id, &alice.id, patch).await.unwrap();

        let bob_notes = notifications::list_for_user(&db, &bob.id).await.unwrap();
        assert!(bob_notes.iter().any(|n| n.kind == "trip_cancelled"));
        // Carol is still pending, so the multicast skips her.
        let carol_notes = notifications::list_for_user(&db, &carol.id).await.unwrap();
        assert!(!carol_notes.iter().any(|n| n.kind == "trip_cancelled"));
        // The actor never notifies themselves.
        let alice_notes = notifications::list_for_user(&db, &alice.id).await.unwrap();
        assert!(!alice_notes.iter().any(|n| n.kind == "trip_cancelled"));
    }

    #[tokio::test]
    async fn delete_cascades_participants_atomically() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        request_join(&db, &trip_id, &bob.id).await.unwrap();

        assert_eq!(
            delete_trip(&db, &trip_id, &bob.id).await.unwrap_err().kind(),
            "not_authorized"
        );
        delete_trip(&db, &trip_id, &alice.id).await.unwrap();

        assert_eq!(fetch_trip(&db, &trip_id).await.unwrap_err().kind(), "not_found");
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM participants WHERE trip_id = ?")
            .bind(&trip_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn list_annotates_callers_participation() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        request_join(&db, &trip_id, &bob.id).await.unwrap();

        let for_bob = list_trips(&db, &bob.id).await.unwrap();
        assert_eq!(for_bob.len(), 1);
        let p = for_bob[0].participation.as_ref().unwrap();
        assert_eq!(p.status, "pending");
        assert!(for_bob[0].participants.is_none());

        let for_alice = list_trips(&db, &alice.id).await.unwrap();
        let roster = for_alice[0].participants.as_ref().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user.id, bob.id);
    }
}
