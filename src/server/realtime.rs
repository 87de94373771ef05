//! Realtime delivery for trip group chat. Clients connect over websocket,
//! authenticate with their session token, then subscribe to trip rooms.
//! Messages travel through Redis pub/sub (channel `trip:{trip_id}`), so
//! every server instance sees the same stream; even locally published
//! messages loop through Redis, giving all subscribers one ordering.

use crate::server::database::Database;
use futures_util::{SinkExt, StreamExt};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

pub type ClientId = String;

/// Outbound seam for group chat events. The hub publishes to Redis;
/// message code depends on this trait so delivery can be observed in tests.
pub trait EventSink: Send + Sync {
    fn publish<'a>(
        &'a self,
        trip_id: &'a str,
        payload: &'a str,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>>;
}

impl EventSink for RealtimeHub {
    fn publish<'a>(
        &'a self,
        trip_id: &'a str,
        payload: &'a str,
    ) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.publish_group_message(trip_id, payload))
    }
}

#[derive(Debug, Deserialize)]
struct AuthFrame {
    pub message_type: String, // "auth"
    pub session_token: String,
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    pub message_type: String, // "auth_response"
    pub success: bool,
    pub user_id: Option<String>,
    pub error: Option<String>,
}

/// Post-auth client frames: room membership only, sending goes through
/// the command protocol.
#[derive(Debug, Deserialize)]
struct RoomFrame {
    pub message_type: String, // "join_trip" | "leave_trip"
    pub trip_id: String,
}

struct ClientHandle {
    user_id: String,
    sender: tokio::sync::mpsc::UnboundedSender<Message>,
}

pub struct RealtimeHub {
    connections: Arc<Mutex<HashMap<ClientId, ClientHandle>>>,
    trip_rooms: Arc<Mutex<HashMap<String, HashSet<ClientId>>>>,
    redis: Arc<Mutex<ConnectionManager>>,
    redis_url: String,
}

impl RealtimeHub {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            trip_rooms: Arc::new(Mutex::new(HashMap::new())),
            redis: Arc::new(Mutex::new(redis)),
            redis_url: redis_url.to_string(),
        })
    }

    pub async fn publish_group_message(&self, trip_id: &str, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.redis.lock().await;
        redis::cmd("PUBLISH")
            .arg(format!("trip:{}", trip_id))
            .arg(payload)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    fn auth_failure(error: &str) -> AuthResponse {
        AuthResponse {
            message_type: "auth_response".to_string(),
            success: false,
            user_id: None,
            error: Some(error.to_string()),
        }
    }

    async fn resolve_session(&self, session_token: &str, db: &Database) -> Option<String> {
        crate::server::auth::validate_session(db, session_token).await
    }

    /// First frame must be an auth message within 30 seconds; everything
    /// after that is room membership until the client disconnects.
    pub async fn handle_connection(
        self: &Arc<Self>,
        ws_stream: WebSocketStream<tokio::net::TcpStream>,
        db: Arc<Database>,
    ) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let first = tokio::time::timeout(tokio::time::Duration::from_secs(30), ws_receiver.next()).await;
        let auth = match first {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthFrame>(&text) {
                Ok(auth) if auth.message_type == "auth" => auth,
                Ok(_) => {
                    let resp = Self::auth_failure("expected an 'auth' message");
                    let _ = ws_sender.send(Message::Text(serde_json::to_string(&resp)?)).await;
                    return Err(anyhow::anyhow!("invalid auth message type"));
                }
                Err(e) => {
                    let resp = Self::auth_failure(&format!("invalid JSON: {}", e));
                    let _ = ws_sender.send(Message::Text(serde_json::to_string(&resp)?)).await;
                    return Err(anyhow::anyhow!("invalid JSON in auth message"));
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                log::info!("[WS:AUTH] Client closed connection during auth");
                return Ok(());
            }
            Ok(Some(Ok(_))) => {
                let resp = Self::auth_failure("expected a text frame for authentication");
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&resp)?)).await;
                return Err(anyhow::anyhow!("unexpected frame type during auth"));
            }
            Ok(Some(Err(e))) => {
                return Err(anyhow::anyhow!("websocket error during auth: {}", e));
            }
            Err(_) => {
                let resp = Self::auth_failure("authentication timeout");
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&resp)?)).await;
                return Err(anyhow::anyhow!("authentication timeout"));
            }
        };

        let Some(user_id) = self.resolve_session(&auth.session_token, &db).await else {
            let resp = Self::auth_failure("invalid or expired session token");
            let _ = ws_sender.send(Message::Text(serde_json::to_string(&resp)?)).await;
            return Err(anyhow::anyhow!("authentication failed"));
        };

        let resp = AuthResponse {
            message_type: "auth_response".to_string(),
            success: true,
            user_id: Some(user_id.clone()),
            error: None,
        };
        ws_sender.send(Message::Text(serde_json::to_string(&resp)?)).await?;
        log::info!("[WS:AUTH] Authenticated websocket for user {}", user_id);

        let client_id: ClientId = Uuid::new_v4().to_string();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        {
            let mut connections = self.connections.lock().await;
            connections.insert(
                client_id.clone(),
                ClientHandle { user_id: user_id.clone(), sender: tx },
            );
        }

        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        let connections = self.connections.clone();
        let trip_rooms = self.trip_rooms.clone();
        let client = client_id.clone();
        let receive_task = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(frame) = serde_json::from_str::<RoomFrame>(&text) else {
                            log::warn!("[WS:RECV] Unparseable frame from {}: {}", client, text);
                            continue;
                        };
                        match frame.message_type.as_str() {
                            "join_trip" => {
                                let mut rooms = trip_rooms.lock().await;
                                rooms.entry(frame.trip_id.clone()).or_default().insert(client.clone());
                                log::info!("[WS:ROOM] Client {} joined trip room {}", client, frame.trip_id);
                            }
                            "leave_trip" => {
                                let mut rooms = trip_rooms.lock().await;
                                if let Some(members) = rooms.get_mut(&frame.trip_id) {
                                    members.remove(&client);
                                    if members.is_empty() {
                                        rooms.remove(&frame.trip_id);
                                    }
                                }
                                log::info!("[WS:ROOM] Client {} left trip room {}", client, frame.trip_id);
                            }
                            other => {
                                log::warn!("[WS:RECV] Unknown message_type '{}' from {}", other, client);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }

            // Disconnect cleanup: drop the handle and leave every room.
            let removed = {
                let mut connections = connections.lock().await;
                connections.remove(&client)
            };
            {
                let mut rooms = trip_rooms.lock().await;
                rooms.retain(|_, members| {
                    members.remove(&client);
                    !members.is_empty()
                });
            }
            if let Some(handle) = removed {
                log::info!("[WS:ROOM] Client {} (user {}) disconnected", client, handle.user_id);
            }
        });

        tokio::select! {
            _ = send_task => {},
            _ = receive_task => {},
        }
        Ok(())
    }

    /// Background subscriber: relays every `trip:*` publish to the local
    /// members of that trip's room. Reconnects with a delay on failure.
    pub fn start_subscriber(self: &Arc<Self>) {
        let connections = self.connections.clone();
        let trip_rooms = self.trip_rooms.clone();
        let redis_url = self.redis_url.clone();

        tokio::spawn(async move {
            loop {
                let pubsub = match redis::Client::open(redis_url.as_str()) {
                    Ok(client) => match client.get_async_connection().await {
                        Ok(conn) => Some(conn.into_pubsub()),
                        Err(e) => {
                            log::warn!("[WS:REDIS] Failed to connect for pub/sub: {}", e);
                            None
                        }
                    },
                    Err(e) => {
                        log::warn!("[WS:REDIS] Failed to create Redis client: {}", e);
                        None
                    }
                };

                if let Some(mut pubsub) = pubsub {
                    if let Err(e) = pubsub.psubscribe("trip:*").await {
                        log::warn!("[WS:REDIS] psubscribe failed: {}", e);
                    } else {
                        log::info!("[WS:REDIS] Subscribed to trip:* channels");
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let channel = msg.get_channel_name().to_string();
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            let Some(trip_id) = channel.strip_prefix("trip:") else {
                                continue;
                            };

                            let rooms = trip_rooms.lock().await;
                            let Some(members) = rooms.get(trip_id) else {
                                continue;
                            };
                            let connections = connections.lock().await;
                            let mut delivered = 0usize;
                            for client_id in members {
                                if let Some(handle) = connections.get(client_id) {
                                    if handle.sender.send(Message::Text(payload.clone())).is_ok() {
                                        delivered += 1;
                                    }
                                }
                            }
                            log::debug!(
                                "[WS:REDIS] Delivered trip {} message to {}/{} room members",
                                trip_id,
                                delivered,
                                members.len()
                            );
                        }
                        log::warn!("[WS:REDIS] Pub/sub stream ended");
                    }
                }

                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }
}
