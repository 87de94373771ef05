//! Trip-scoped messaging, in two modes sharing one authorization gate:
//! peer-addressed direct messages with read receipts, and a group room
//! per trip with realtime fan-out over the pub/sub hub.

use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use crate::server::participants;
use crate::server::realtime::EventSink;
use crate::server::trips::{self, TripRow};
use crate::server::users::{self, PublicUser};
use serde::Serialize;
use sqlx::Row;

const GROUP_HISTORY_LIMIT: i64 = 100;
const MAX_BODY_LENGTH: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct DirectMessageView {
    pub id: i64,
    pub trip_id: String,
    pub sender: PublicUser,
    pub receiver: PublicUser,
    pub body: String,
    pub sent_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMessageView {
    pub id: i64,
    pub trip_id: String,
    pub sender: PublicUser,
    pub body: String,
    pub sent_at: i64,
}

/// Roster entry for the group room: the creator first, then riders.
#[derive(Debug, Clone, Serialize)]
pub struct GroupParticipant {
    #[serde(flatten)]
    pub user: PublicUser,
    pub is_creator: bool,
}

/// Both messaging modes pass through here: the caller must be the trip
/// creator or an approved participant, never pending or rejected.
async fn ensure_trip_authorized(db: &Database, trip_id: &str, user_id: &str) -> ApiResult<TripRow> {
    let trip = trips::fetch_trip(db, trip_id).await?;
    if !participants::is_trip_authorized(db, &trip, user_id).await? {
        return Err(ApiError::NotAuthorized(
            "not authorized for this trip's messages".to_string(),
        ));
    }
    Ok(trip)
}

fn normalize_body(body: &str) -> ApiResult<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation("message cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_BODY_LENGTH {
        return Err(ApiError::Validation(format!(
            "message must be at most {} characters",
            MAX_BODY_LENGTH
        )));
    }
    Ok(trimmed.to_string())
}

pub async fn send_direct(
    db: &Database,
    trip_id: &str,
    sender_id: &str,
    receiver_id: &str,
    body: &str,
) -> ApiResult<DirectMessageView> {
    let trip = ensure_trip_authorized(db, trip_id, sender_id).await?;
    if !participants::is_trip_authorized(db, &trip, receiver_id).await? {
        return Err(ApiError::Validation(
            "receiver is not authorized for this trip".to_string(),
        ));
    }
    if sender_id == receiver_id {
        return Err(ApiError::Conflict("cannot message yourself".to_string()));
    }
    let body = normalize_body(body)?;

    let sent_at = chrono::Utc::now().timestamp();
    let res = sqlx::query(
        "INSERT INTO direct_messages (trip_id, sender_id, receiver_id, body, sent_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(trip_id)
    .bind(sender_id)
    .bind(receiver_id)
    .bind(&body)
    .bind(sent_at)
    .execute(&db.pool)
    .await?;

    let sender = users::get_public_user(db, sender_id).await?;
    let receiver = users::get_public_user(db, receiver_id).await?;
    Ok(DirectMessageView {
        id: res.last_insert_rowid(),
        trip_id: trip_id.to_string(),
        sender,
        receiver,
        body,
        sent_at,
        read_at: None,
    })
}

/// Receiver-only read receipt. Idempotent: the first call stamps the time,
/// later calls leave it untouched.
pub async fn mark_read(db: &Database, message_id: i64, caller_id: &str) -> ApiResult<()> {
    let row = sqlx::query("SELECT receiver_id FROM direct_messages WHERE id = ?")
        .bind(message_id)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Err(ApiError::NotFound("message not found".to_string()));
    };
    let receiver_id: String = row.get("receiver_id");
    if receiver_id != caller_id {
        return Err(ApiError::NotAuthorized(
            "only the receiver can mark a message read".to_string(),
        ));
    }
    sqlx::query("UPDATE direct_messages SET read_at = ? WHERE id = ? AND read_at IS NULL")
        .bind(chrono::Utc::now().timestamp())
        .bind(message_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

async fn direct_view(db: &Database, r: &sqlx::sqlite::SqliteRow) -> ApiResult<DirectMessageView> {
    let sender_id: String = r.get("sender_id");
    let receiver_id: String = r.get("receiver_id");
    Ok(DirectMessageView {
        id: r.get("id"),
        trip_id: r.get("trip_id"),
        sender: users::get_public_user(db, &sender_id).await?,
        receiver: users::get_public_user(db, &receiver_id).await?,
        body: r.get("body"),
        sent_at: r.get("sent_at"),
        read_at: r.get("read_at"),
    })
}

/// With a counterpart: the two-way thread between caller and counterpart.
/// Without: every direct message the caller sent or received on the trip.
/// Oldest first either way, ids breaking same-second ties.
pub async fn list_direct(
    db: &Database,
    trip_id: &str,
    caller_id: &str,
    counterpart: Option<&str>,
) -> ApiResult<Vec<DirectMessageView>> {
    ensure_trip_authorized(db, trip_id, caller_id).await?;
    let rows = match counterpart {
        Some(other) => {
            sqlx::query(
                "SELECT * FROM direct_messages WHERE trip_id = ? \
                 AND ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)) \
                 ORDER BY sent_at ASC, id ASC",
            )
            .bind(trip_id)
            .bind(caller_id)
            .bind(other)
            .bind(other)
            .bind(caller_id)
            .fetch_all(&db.pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT * FROM direct_messages WHERE trip_id = ? AND (sender_id = ? OR receiver_id = ?) \
                 ORDER BY sent_at ASC, id ASC",
            )
            .bind(trip_id)
            .bind(caller_id)
            .bind(caller_id)
            .fetch_all(&db.pool)
            .await?
        }
    };
    let mut views = Vec::with_capacity(rows.len());
    for r in &rows {
        views.push(direct_view(db, r).await?);
    }
    Ok(views)
}

pub async fn unread_count(db: &Database, user_id: &str) -> ApiResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM direct_messages WHERE receiver_id = ? AND read_at IS NULL",
    )
    .bind(user_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(count)
}

/// Wire form of a group message event as pushed to room subscribers.
pub(crate) fn group_event_payload(view: &GroupMessageView) -> String {
    serde_json::json!({
        "message_type": "new_message",
        "trip_id": view.trip_id,
        "message": view,
    })
    .to_string()
}

/// Persists to the trip room, then publishes to connected subscribers.
/// The publish is best-effort (a failure is logged, the message is durable
/// once the insert commits) but happens inline, so publishes on a trip's
/// channel follow persist order.
pub async fn send_group(
    db: &Database,
    sink: Option<&dyn EventSink>,
    trip_id: &str,
    sender_id: &str,
    body: &str,
) -> ApiResult<GroupMessageView> {
    ensure_trip_authorized(db, trip_id, sender_id).await?;
    let body = normalize_body(body)?;

    let sent_at = chrono::Utc::now().timestamp();
    let res = sqlx::query(
        "INSERT INTO group_messages (trip_id, sender_id, body, sent_at) VALUES (?, ?, ?, ?)",
    )
    .bind(trip_id)
    .bind(sender_id)
    .bind(&body)
    .bind(sent_at)
    .execute(&db.pool)
    .await?;

    let sender = users::get_public_user(db, sender_id).await?;
    let view = GroupMessageView {
        id: res.last_insert_rowid(),
        trip_id: trip_id.to_string(),
        sender,
        body,
        sent_at,
    };

    if let Some(sink) = sink {
        if let Err(e) = sink.publish(trip_id, &group_event_payload(&view)).await {
            log::warn!("[MESSAGES] Realtime publish failed for trip {}: {}", trip_id, e);
        }
    }
    Ok(view)
}

/// The room's recent history: at most the last 100 messages, oldest first.
pub async fn list_group(
    db: &Database,
    trip_id: &str,
    caller_id: &str,
) -> ApiResult<Vec<GroupMessageView>> {
    ensure_trip_authorized(db, trip_id, caller_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM group_messages WHERE trip_id = ? ORDER BY sent_at DESC, id DESC LIMIT ?",
    )
    .bind(trip_id)
    .bind(GROUP_HISTORY_LIMIT)
    .fetch_all(&db.pool)
    .await?;

    let mut views = Vec::with_capacity(rows.len());
    for r in rows.iter().rev() {
        let sender_id: String = r.get("sender_id");
        views.push(GroupMessageView {
            id: r.get("id"),
            trip_id: r.get("trip_id"),
            sender: users::get_public_user(db, &sender_id).await?,
            body: r.get("body"),
            sent_at: r.get("sent_at"),
        });
    }
    Ok(views)
}

/// Who is in the room: the creator flagged first, then approved riders.
pub async fn list_group_participants(
    db: &Database,
    trip_id: &str,
    caller_id: &str,
) -> ApiResult<Vec<GroupParticipant>> {
    let trip = ensure_trip_authorized(db, trip_id, caller_id).await?;
    let mut roster = vec![GroupParticipant {
        user: users::get_public_user(db, &trip.creator_id).await?,
        is_creator: true,
    }];
    let rows = sqlx::query(
        "SELECT user_id FROM participants WHERE trip_id = ? AND status = 'approved' ORDER BY id ASC",
    )
    .bind(trip_id)
    .fetch_all(&db.pool)
    .await?;
    for r in &rows {
        let user_id: String = r.get("user_id");
        if user_id == trip.creator_id {
            continue;
        }
        roster.push(GroupParticipant {
            user: users::get_public_user(db, &user_id).await?,
            is_creator: false,
        });
    }
    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::participants::{decide, request_join};
    use crate::server::testing::{seed_trip, seed_user, test_db};

    async fn approve(db: &Database, trip_id: &str, creator_id: &str, rider_id: &str) {
        let p = request_join(db, trip_id, rider_id).await.unwrap();
        decide(db, trip_id, p.id, "approved", creator_id).await.unwrap();
    }

    /// Captures published events instead of pushing them to Redis.
    struct RecordingSink {
        events: tokio::sync::Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { events: tokio::sync::Mutex::new(Vec::new()) }
        }
    }

    impl EventSink for RecordingSink {
        fn publish<'a>(
            &'a self,
            trip_id: &'a str,
            payload: &'a str,
        ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.events
                    .lock()
                    .await
                    .push((trip_id.to_string(), payload.to_string()));
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn outsiders_and_pending_riders_cannot_message() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let eve = seed_user(&db, "21ucs666").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        request_join(&db, &trip_id, &bob.id).await.unwrap();

        for caller in [&bob.id, &eve.id] {
            let err = send_group(&db, None, &trip_id, caller, "hi").await.unwrap_err();
            assert_eq!(err.kind(), "not_authorized");
            let err = list_group(&db, &trip_id, caller).await.unwrap_err();
            assert_eq!(err.kind(), "not_authorized");
            let err = list_direct(&db, &trip_id, caller, None).await.unwrap_err();
            assert_eq!(err.kind(), "not_authorized");
        }
    }

    #[tokio::test]
    async fn direct_requires_an_authorized_receiver() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        request_join(&db, &trip_id, &bob.id).await.unwrap();

        // Bob is still pending, so he cannot be addressed either.
        let err = send_direct(&db, &trip_id, &alice.id, &bob.id, "hello").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn self_messages_are_rejected_without_a_row() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let trip_id = seed_trip(&db, &alice.id).await;

        let err = send_direct(&db, &trip_id, &alice.id, &alice.id, "me").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM direct_messages")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn thread_listing_filters_by_counterpart() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let carol = seed_user(&db, "21ucs003").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        approve(&db, &trip_id, &alice.id, &bob.id).await;
        approve(&db, &trip_id, &alice.id, &carol.id).await;

        send_direct(&db, &trip_id, &alice.id, &bob.id, "to bob").await.unwrap();
        send_direct(&db, &trip_id, &bob.id, &alice.id, "to alice").await.unwrap();
        send_direct(&db, &trip_id, &alice.id, &carol.id, "to carol").await.unwrap();

        let thread = list_direct(&db, &trip_id, &alice.id, Some(&bob.id)).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].body, "to bob");
        assert_eq!(thread[1].body, "to alice");

        let all = list_direct(&db, &trip_id, &alice.id, None).await.unwrap();
        assert_eq!(all.len(), 3);
        // Carol only sees her own thread.
        let carols = list_direct(&db, &trip_id, &carol.id, None).await.unwrap();
        assert_eq!(carols.len(), 1);
    }

    #[tokio::test]
    async fn read_receipt_is_receiver_only_and_never_rewinds() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        approve(&db, &trip_id, &alice.id, &bob.id).await;

        let msg = send_direct(&db, &trip_id, &alice.id, &bob.id, "hello").await.unwrap();
        assert_eq!(unread_count(&db, &bob.id).await.unwrap(), 1);

        let err = mark_read(&db, msg.id, &alice.id).await.unwrap_err();
        assert_eq!(err.kind(), "not_authorized");

        mark_read(&db, msg.id, &bob.id).await.unwrap();
        let first: Option<i64> = sqlx::query_scalar("SELECT read_at FROM direct_messages WHERE id = ?")
            .bind(msg.id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        mark_read(&db, msg.id, &bob.id).await.unwrap();
        let second: Option<i64> = sqlx::query_scalar("SELECT read_at FROM direct_messages WHERE id = ?")
            .bind(msg.id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(unread_count(&db, &bob.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_history_is_capped_at_the_last_hundred() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let trip_id = seed_trip(&db, &alice.id).await;

        // Insert directly so all rows share one timestamp and only the id
        // breaks the tie.
        let sent_at = chrono::Utc::now().timestamp();
        for i in 0..105 {
            sqlx::query(
                "INSERT INTO group_messages (trip_id, sender_id, body, sent_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&trip_id)
            .bind(&alice.id)
            .bind(format!("msg {}", i))
            .bind(sent_at)
            .execute(&db.pool)
            .await
            .unwrap();
        }

        let history = list_group(&db, &trip_id, &alice.id).await.unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].body, "msg 5");
        assert_eq!(history[99].body, "msg 104");
        // Ascending by id throughout.
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn group_event_carries_body_and_sender_profile() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let trip_id = seed_trip(&db, &alice.id).await;

        let view = send_group(&db, None, &trip_id, &alice.id, "leaving at 5").await.unwrap();
        let event: serde_json::Value = serde_json::from_str(&group_event_payload(&view)).unwrap();

        assert_eq!(event["message_type"], "new_message");
        assert_eq!(event["trip_id"], trip_id.as_str());
        let msg = &event["message"];
        assert_eq!(msg["id"], view.id);
        assert_eq!(msg["trip_id"], trip_id.as_str());
        assert_eq!(msg["body"], "leaving at 5");
        assert_eq!(msg["sent_at"], view.sent_at);
        assert_eq!(msg["sender"]["id"], alice.id.as_str());
        assert_eq!(msg["sender"]["username"], "21UCS001");
        assert_eq!(msg["sender"]["email"], alice.email.as_str());
    }

    #[tokio::test]
    async fn group_publishes_follow_persist_order() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        let sink = RecordingSink::new();

        let first = send_group(&db, Some(&sink), &trip_id, &alice.id, "first").await.unwrap();
        let second = send_group(&db, Some(&sink), &trip_id, &alice.id, "second").await.unwrap();
        assert!(first.id < second.id);

        // Each send publishes before returning, so the channel sees events
        // in the order the rows were inserted.
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(channel, _)| channel == &trip_id));
        let ids: Vec<i64> = events
            .iter()
            .map(|(_, payload)| {
                let event: serde_json::Value = serde_json::from_str(payload).unwrap();
                event["message"]["id"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn body_limit_counts_characters_not_bytes() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let trip_id = seed_trip(&db, &alice.id).await;

        // 600 characters, 1200 bytes: within the 1000-character cap.
        let accents = "é".repeat(600);
        send_group(&db, None, &trip_id, &alice.id, &accents).await.unwrap();

        let too_long = "é".repeat(1001);
        let err = send_group(&db, None, &trip_id, &alice.id, &too_long).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn room_roster_leads_with_the_creator() {
        let db = test_db().await;
        let alice = seed_user(&db, "21ucs001").await;
        let bob = seed_user(&db, "21ucs002").await;
        let trip_id = seed_trip(&db, &alice.id).await;
        approve(&db, &trip_id, &alice.id, &bob.id).await;

        let roster = list_group_participants(&db, &trip_id, &bob.id).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert!(roster[0].is_creator);
        assert_eq!(roster[0].user.id, alice.id);
        assert!(!roster[1].is_creator);
    }
}
