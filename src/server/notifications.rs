//! In-app notification fan-out. Dispatchers run after the triggering write
//! has committed and are best-effort: a failed insert is logged by the
//! caller and never rolls the trigger back.

use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use crate::server::trips::TripRow;
use crate::server::users;
use serde::Serialize;
use sqlx::Row;

pub const KIND_JOIN_REQUEST: &str = "join_request";
pub const KIND_JOIN_APPROVED: &str = "join_approved";
pub const KIND_JOIN_REJECTED: &str = "join_rejected";
pub const KIND_TRIP_UPDATE: &str = "trip_update";
pub const KIND_TRIP_CANCELLED: &str = "trip_cancelled";

#[derive(Debug, Clone, Serialize)]
pub struct NotificationView {
    pub id: i64,
    pub recipient_id: String,
    pub sender_id: String,
    pub kind: String,
    pub trip_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<i64>,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub action_required: bool,
    pub created_at: i64,
}

struct NewNotification<'a> {
    recipient_id: &'a str,
    sender_id: &'a str,
    kind: &'a str,
    trip_id: &'a str,
    participant_id: Option<i64>,
    title: String,
    body: String,
    action_required: bool,
}

async fn insert(db: &Database, n: NewNotification<'_>) -> ApiResult<()> {
    sqlx::query(
        "INSERT INTO notifications (recipient_id, sender_id, kind, trip_id, participant_id, title, body, is_read, action_required, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(n.recipient_id)
    .bind(n.sender_id)
    .bind(n.kind)
    .bind(n.trip_id)
    .bind(n.participant_id)
    .bind(&n.title)
    .bind(&n.body)
    .bind(n.action_required)
    .bind(chrono::Utc::now().timestamp())
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Tells the creator a rider wants in. Carries the participation id so the
/// client can decide straight from the notification.
pub async fn notify_join_request(
    db: &Database,
    trip: &TripRow,
    requester_id: &str,
    participant_id: i64,
) -> ApiResult<()> {
    let requester = users::get_public_user(db, requester_id).await?;
    insert(
        db,
        NewNotification {
            recipient_id: &trip.creator_id,
            sender_id: requester_id,
            kind: KIND_JOIN_REQUEST,
            trip_id: &trip.id,
            participant_id: Some(participant_id),
            title: "New Join Request".to_string(),
            body: format!(
                "{} wants to join your trip from {} to {}",
                requester.username, trip.departure_location, trip.destination
            ),
            action_required: true,
        },
    )
    .await
}

/// Tells the requester how the creator ruled.
pub async fn notify_join_decision(
    db: &Database,
    trip: &TripRow,
    requester_id: &str,
    participant_id: i64,
    decision: &str,
) -> ApiResult<()> {
    let (kind, title, verdict) = if decision == "approved" {
        (KIND_JOIN_APPROVED, "Join Request Approved!", "approved!")
    } else {
        (KIND_JOIN_REJECTED, "Join Request Declined", "declined.")
    };
    insert(
        db,
        NewNotification {
            recipient_id: requester_id,
            sender_id: &trip.creator_id,
            kind,
            trip_id: &trip.id,
            participant_id: Some(participant_id),
            title: title.to_string(),
            body: format!(
                "Your request to join the trip from {} to {} has been {}",
                trip.departure_location, trip.destination, verdict
            ),
            action_required: false,
        },
    )
    .await
}

async fn approved_participant_ids(db: &Database, trip_id: &str) -> ApiResult<Vec<String>> {
    let rows = sqlx::query(
        "SELECT user_id FROM participants WHERE trip_id = ? AND status = 'approved' ORDER BY id ASC",
    )
    .bind(trip_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(|r| r.get("user_id")).collect())
}

async fn multicast(
    db: &Database,
    trip: &TripRow,
    actor_id: &str,
    kind: &'static str,
    title: &str,
    body: String,
) -> ApiResult<()> {
    for recipient_id in approved_participant_ids(db, &trip.id).await? {
        if recipient_id == actor_id {
            continue;
        }
        insert(
            db,
            NewNotification {
                recipient_id: &recipient_id,
                sender_id: actor_id,
                kind,
                trip_id: &trip.id,
                participant_id: None,
                title: title.to_string(),
                body: body.clone(),
                action_required: false,
            },
        )
        .await?;
    }
    Ok(())
}

pub async fn notify_trip_update(db: &Database, trip: &TripRow, actor_id: &str) -> ApiResult<()> {
    let body = format!(
        "The trip from {} to {} has been updated",
        trip.departure_location, trip.destination
    );
    multicast(db, trip, actor_id, KIND_TRIP_UPDATE, "Trip Updated", body).await
}

pub async fn notify_trip_cancelled(db: &Database, trip: &TripRow, actor_id: &str) -> ApiResult<()> {
    let body = format!(
        "The trip from {} to {} has been cancelled",
        trip.departure_location, trip.destination
    );
    multicast(db, trip, actor_id, KIND_TRIP_CANCELLED, "Trip Cancelled", body).await
}

fn view_from_row(r: &sqlx::sqlite::SqliteRow) -> NotificationView {
    NotificationView {
        id: r.get("id"),
        recipient_id: r.get("recipient_id"),
        sender_id: r.get("sender_id"),
        kind: r.get("kind"),
        trip_id: r.get("trip_id"),
        participant_id: r.get("participant_id"),
        title: r.get("title"),
        body: r.get("body"),
        is_read: r.get::<i64, _>("is_read") != 0,
        action_required: r.get::<i64, _>("action_required") != 0,
        created_at: r.get("created_at"),
    }
}

/// The caller's notifications, newest first.
pub async fn list_for_user(db: &Database, user_id: &str) -> ApiResult<Vec<NotificationView>> {
    let rows = sqlx::query(
        "SELECT * FROM notifications WHERE recipient_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(view_from_row).collect())
}

/// Recipient-only, idempotent.
pub async fn mark_read(db: &Database, notification_id: i64, caller_id: &str) -> ApiResult<()> {
    let row = sqlx::query("SELECT recipient_id FROM notifications WHERE id = ?")
        .bind(notification_id)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Err(ApiError::NotFound("notification not found".to_string()));
    };
    let recipient_id: String = row.get("recipient_id");
    if recipient_id != caller_id {
        return Err(ApiError::NotAuthorized(
            "cannot mark someone else's notification".to_string(),
        ));
    }
    sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ?")
        .bind(notification_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

pub async fn unread_count(db: &Database, user_id: &str) -> ApiResult<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE recipient_id = ? AND is_read = 0")
            .bind(user_id)
            .fetch_one(&db.pool)
            .await?;
    Ok(count)
}
