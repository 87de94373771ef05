use crate::server::database::Database;
use crate::server::error::{is_unique_violation, ApiError, ApiResult};
use crate::server::notifications;
use crate::server::trips::{self, TripRow};
use crate::server::users::{self, PublicUser};
use serde::Serialize;
use sqlx::Row;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_REJECTED: &str = "rejected";

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    pub id: i64,
    pub trip_id: String,
    pub user: PublicUser,
    pub status: String,
    pub created_at: i64,
}

async fn view_of(db: &Database, participation_id: i64) -> ApiResult<ParticipantView> {
    let row = sqlx::query("SELECT id, trip_id, user_id, status, created_at FROM participants WHERE id = ?")
        .bind(participation_id)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Err(ApiError::NotFound("participation not found".to_string()));
    };
    let user_id: String = row.get("user_id");
    let user = users::get_public_user(db, &user_id).await?;
    Ok(ParticipantView {
        id: row.get("id"),
        trip_id: row.get("trip_id"),
        user,
        status: row.get("status"),
        created_at: row.get("created_at"),
    })
}

/// Files a pending join request. One row per (trip, user) for the lifetime
/// of the trip; a rejected rider cannot re-apply.
pub async fn request_join(db: &Database, trip_id: &str, user_id: &str) -> ApiResult<ParticipantView> {
    let trip = trips::fetch_trip(db, trip_id).await?;
    if trip.creator_id == user_id {
        return Err(ApiError::Conflict("cannot join your own trip".to_string()));
    }

    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query(
        "INSERT INTO participants (trip_id, user_id, status, created_at) VALUES (?, ?, 'pending', ?)",
    )
    .bind(trip_id)
    .bind(user_id)
    .bind(now)
    .execute(&db.pool)
    .await;
    let res = match res {
        Ok(res) => res,
        Err(e) if is_unique_violation(&e) => {
            return Err(ApiError::Conflict(
                "already requested to join this trip".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };
    let participation_id = res.last_insert_rowid();
    log::info!(
        "[PARTICIPANTS] {} requested to join trip {} (participation {})",
        user_id,
        trip_id,
        participation_id
    );

    if let Err(e) = notifications::notify_join_request(db, &trip, user_id, participation_id).await {
        log::warn!(
            "[PARTICIPANTS] Join request notification failed for trip {}: {}",
            trip_id,
            e
        );
    }
    view_of(db, participation_id).await
}

/// Creator's verdict on a pending request. The transition is one-shot: the
/// status update is conditioned on the row still being pending, so a second
/// decision (or a race between two) surfaces as a conflict.
pub async fn decide(
    db: &Database,
    trip_id: &str,
    participation_id: i64,
    decision: &str,
    decider_id: &str,
) -> ApiResult<ParticipantView> {
    if decision != STATUS_APPROVED && decision != STATUS_REJECTED {
        return Err(ApiError::Validation(format!(
            "decision must be 'approved' or 'rejected', got '{}'",
            decision
        )));
    }
    let trip = trips::fetch_trip(db, trip_id).await?;
    if trip.creator_id != decider_id {
        return Err(ApiError::NotAuthorized(
            "only the trip creator can decide join requests".to_string(),
        ));
    }
    let row = sqlx::query("SELECT trip_id, user_id FROM participants WHERE id = ?")
        .bind(participation_id)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Err(ApiError::NotFound("participation not found".to_string()));
    };
    let row_trip_id: String = row.get("trip_id");
    if row_trip_id != trip_id {
        return Err(ApiError::Conflict(
            "participation does not belong to this trip".to_string(),
        ));
    }
    let requester_id: String = row.get("user_id");

    let res = sqlx::query("UPDATE participants SET status = ? WHERE id = ? AND status = 'pending'")
        .bind(decision)
        .bind(participation_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::Conflict(
            "join request has already been decided".to_string(),
        ));
    }
    log::info!(
        "[PARTICIPANTS] Participation {} on trip {} {} by {}",
        participation_id,
        trip_id,
        decision,
        decider_id
    );

    if let Err(e) =
        notifications::notify_join_decision(db, &trip, &requester_id, participation_id, decision).await
    {
        log::warn!(
            "[PARTICIPANTS] Decision notification failed for participation {}: {}",
            participation_id,
            e
        );
    }
    view_of(db, participation_id).await
}

/// Trip authorization: the creator and approved participants.
pub async fn is_trip_authorized(db: &Database, trip: &TripRow, user_id: &str) -> ApiResult<bool> {
    if trip.creator_id == user_id {
        return Ok(true);
    }
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM participants WHERE trip_id = ? AND user_id = ? AND status = 'approved'",
    )
    .bind(&trip.id)
    .bind(user_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(count > 0)
}

/// All participations on a trip, whatever their status, oldest first.
pub(crate) async fn participant_views_for_trip(
    db: &Database,
    trip_id: &str,
) -> ApiResult<Vec<ParticipantView>> {
    let rows = sqlx::query(
        "SELECT id, trip_id, user_id, status, created_at FROM participants WHERE trip_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(trip_id)
    .fetch_all(&db.pool)
    .await?;
    let mut views = Vec::with_capacity(rows.len());
    for row in &rows {
        let user_id: String = row.get("user_id");
        let user = users::get_public_user(db, &user_id).await?;
        views.push(ParticipantView {
            id: row.get("id"),
            trip_id: row.get("trip_id"),
            user,
            status: row.get("status"),
            created_at: row.get("created_at"),
        });
    }
    Ok(views)
}

/// Creator-only roster of join requests.
pub async fn list_participants(
    db: &Database,
    trip_id: &str,
    caller_id: &str,
) -> ApiResult<Vec<ParticipantView>> {
    let trip = trips::fetch_trip(db, trip_id).await?;
    if trip.creator_id != caller_id {
        return Err(ApiError::NotAuthorized(
            "only the trip creator can list join requests".to_string(),
        ));
    }
    participant_views_for_trip(db, trip_id).await
}
