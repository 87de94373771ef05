use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use crate::server::realtime::{EventSink, RealtimeHub};
use crate::server::trips::{NewTrip, TripPatch};
use crate::server::{auth, messages, notifications, participants, trips, users};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;

// Optional TLS
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
    pub realtime: Option<Arc<RealtimeHub>>,
}

fn ok<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => ApiError::Dependency(format!("response encoding: {}", e)).to_wire(),
    }
}

fn wire<T: Serialize>(result: ApiResult<T>) -> String {
    match result {
        Ok(value) => ok(&value),
        Err(e) => e.to_wire(),
    }
}

fn session_err() -> String {
    ApiError::NotAuthorized("invalid or expired session".to_string()).to_wire()
}

/// Departure times arrive either as epoch seconds or RFC 3339.
fn parse_departure(raw: &str) -> ApiResult<i64> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return Ok(epoch);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|_| {
            ApiError::Validation(format!(
                "invalid departure time '{}', expected epoch seconds or RFC 3339",
                raw
            ))
        })
}

fn parse_i64(raw: &str, field: &str) -> ApiResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::Validation(format!("invalid {} '{}'", field, raw)))
}

/// `from|to|departure|seats[|description]`
fn parse_new_trip(raw: &str) -> ApiResult<NewTrip> {
    let fields: Vec<&str> = raw.split('|').collect();
    if fields.len() < 4 {
        return Err(ApiError::Validation(
            "expected from|to|departure|seats[|description]".to_string(),
        ));
    }
    Ok(NewTrip {
        departure_location: fields[0].to_string(),
        destination: fields[1].to_string(),
        departure_time: parse_departure(fields[2].trim())?,
        available_seats: parse_i64(fields[3].trim(), "seat count")?,
        description: fields.get(4).map(|d| d.to_string()),
    })
}

/// `key=value` pairs separated by `|`; keys mirror the create fields.
fn parse_trip_patch(raw: &str) -> ApiResult<TripPatch> {
    let mut patch = TripPatch::default();
    for pair in raw.split('|') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ApiError::Validation(format!(
                "invalid update field '{}', expected key=value",
                pair
            )));
        };
        match key.trim() {
            "from" => patch.departure_location = Some(value.to_string()),
            "to" => patch.destination = Some(value.to_string()),
            "departure" => patch.departure_time = Some(parse_departure(value.trim())?),
            "seats" => patch.available_seats = Some(parse_i64(value.trim(), "seat count")?),
            "description" => patch.description = Some(value.to_string()),
            "status" => patch.status = Some(value.trim().to_string()),
            other => {
                return Err(ApiError::Validation(format!("unknown update field '{}'", other)));
            }
        }
    }
    Ok(patch)
}

fn help() -> String {
    "OK: commands: /register <email> <password> | /login <email> <password> | /logout <token> | \
     /validate_session <token> | /whoami <token> | \
     /create_trip <token> from|to|departure|seats[|description] | /list_trips <token> | \
     /get_trip <token> <trip_id> | /update_trip <token> <trip_id> key=value[|key=value...] | \
     /delete_trip <token> <trip_id> | /join_trip <token> <trip_id> | \
     /decide <token> <trip_id> <participation_id> approved|rejected | /trip_participants <token> <trip_id> | \
     /send_message <token> <trip_id> <receiver_id> <text> | /messages <token> <trip_id> [counterpart_id] | \
     /mark_read <token> <message_id> | /unread_count <token> | \
     /send_group_message <token> <trip_id> <text> | /group_messages <token> <trip_id> | \
     /group_participants <token> <trip_id> | /notifications <token> | \
     /mark_notification_read <token> <notification_id> | /unread_notifications <token> | /quit"
        .to_string()
}

impl Server {
    /// Configure TLS acceptor from environment variables
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.enable_tls {
            log::info!("[TLS] TLS disabled in configuration");
            return Ok(None);
        }

        let cert_path = std::env::var("TLS_CERT_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_CERT_PATH environment variable not set"))?;
        let key_path = std::env::var("TLS_KEY_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_KEY_PATH environment variable not set"))?;

        let cert_file = File::open(&cert_path)
            .map_err(|e| anyhow::anyhow!("failed to open certificate file '{}': {}", cert_path, e))?;
        let mut cert_reader = StdBufReader::new(cert_file);
        let cert_chain = certs(&mut cert_reader)?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(anyhow::anyhow!("no certificates found in {}", cert_path));
        }

        let key_file = File::open(&key_path)
            .map_err(|e| anyhow::anyhow!("failed to open private key file '{}': {}", key_path, e))?;
        let mut key_reader = StdBufReader::new(key_file);
        // PKCS8 first, then RSA
        let mut keys = pkcs8_private_keys(&mut key_reader)?;
        if keys.is_empty() {
            let key_file = File::open(&key_path)?;
            let mut key_reader = StdBufReader::new(key_file);
            keys = rsa_private_keys(&mut key_reader)?;
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("no private keys found in {}", key_path));
        }

        let priv_key = rustls::PrivateKey(keys.remove(0));
        let rustls_cfg = RustlsConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, priv_key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        log::info!("[TLS] Loaded certificate and key, TLS enabled");
        Ok(Some(TlsAcceptor::from(Arc::new(rustls_cfg))))
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("[SERVER] Listening on {}", addr);

        let tls_acceptor = match self.setup_tls_acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                log::warn!("[TLS] TLS configuration failed: {}, falling back to plain TCP", e);
                None
            }
        };

        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("[SERVER] New connection from {}", peer);
            let server = self.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let result = if let Some(acceptor) = acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.handle_client(tls_stream, peer).await,
                        Err(e) => {
                            log::warn!("[SERVER] TLS accept failed for {}: {}", peer, e);
                            return;
                        }
                    }
                } else {
                    server.handle_client(stream, peer).await
                };
                if let Err(e) = result {
                    log::warn!("[SERVER] Client error ({}): {}", peer, e);
                }
            });
        }
    }

    /// Line-oriented command loop, shared by plain TCP and TLS streams.
    async fn handle_client<S>(&self, stream: S, peer: std::net::SocketAddr) -> anyhow::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                log::info!("[SERVER] Client disconnected: {}", peer);
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.split_whitespace();
            let cmd = parts.next().unwrap_or("");
            let args: Vec<&str> = parts.collect();
            log::debug!("[CONN] [{}] Cmd='{}' ({} args)", peer, cmd, args.len());

            let response = self.handle_command(cmd, &args).await;
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            if cmd == "/quit" {
                break;
            }
        }
        Ok(())
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        match cmd {
            // ACCOUNTS
            "/register" if args.len() == 2 => {
                wire(auth::register(&self.db, args[0], args[1], &self.config).await)
            }
            "/login" if args.len() == 2 => {
                wire(auth::login(&self.db, args[0], args[1], &self.config).await)
            }
            "/logout" if args.len() == 1 => match auth::logout(&self.db, args[0]).await {
                Ok(()) => "OK: logged out".to_string(),
                Err(e) => e.to_wire(),
            },
            "/validate_session" | "/whoami" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(users::current_user(&self.db, &uid).await)
                } else {
                    session_err()
                }
            }

            // TRIPS
            "/create_trip" if args.len() >= 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    match parse_new_trip(&args[1..].join(" ")) {
                        Ok(input) => wire(trips::create_trip(&self.db, &uid, input).await),
                        Err(e) => e.to_wire(),
                    }
                } else {
                    session_err()
                }
            }
            "/list_trips" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(trips::list_trips(&self.db, &uid).await)
                } else {
                    session_err()
                }
            }
            "/get_trip" if args.len() == 2 => {
                if auth::validate_session(&self.db, args[0]).await.is_some() {
                    wire(trips::get_trip(&self.db, args[1]).await)
                } else {
                    session_err()
                }
            }
            "/update_trip" if args.len() >= 3 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    match parse_trip_patch(&args[2..].join(" ")) {
                        Ok(patch) => wire(trips::update_trip(&self.db, args[1], &uid, patch).await),
                        Err(e) => e.to_wire(),
                    }
                } else {
                    session_err()
                }
            }
            "/delete_trip" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    match trips::delete_trip(&self.db, args[1], &uid).await {
                        Ok(()) => "OK: trip deleted".to_string(),
                        Err(e) => e.to_wire(),
                    }
                } else {
                    session_err()
                }
            }

            // PARTICIPATION
            "/join_trip" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(participants::request_join(&self.db, args[1], &uid).await)
                } else {
                    session_err()
                }
            }
            "/decide" if args.len() == 4 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    match parse_i64(args[2], "participation id") {
                        Ok(pid) => {
                            wire(participants::decide(&self.db, args[1], pid, args[3], &uid).await)
                        }
                        Err(e) => e.to_wire(),
                    }
                } else {
                    session_err()
                }
            }
            "/trip_participants" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(participants::list_participants(&self.db, args[1], &uid).await)
                } else {
                    session_err()
                }
            }

            // DIRECT MESSAGES
            "/send_message" if args.len() >= 4 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    let body = args[3..].join(" ");
                    wire(messages::send_direct(&self.db, args[1], &uid, args[2], &body).await)
                } else {
                    session_err()
                }
            }
            "/messages" if args.len() == 2 || args.len() == 3 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    let counterpart = args.get(2).copied();
                    wire(messages::list_direct(&self.db, args[1], &uid, counterpart).await)
                } else {
                    session_err()
                }
            }
            "/mark_read" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    match parse_i64(args[1], "message id") {
                        Ok(mid) => match messages::mark_read(&self.db, mid, &uid).await {
                            Ok(()) => "OK: marked read".to_string(),
                            Err(e) => e.to_wire(),
                        },
                        Err(e) => e.to_wire(),
                    }
                } else {
                    session_err()
                }
            }
            "/unread_count" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(messages::unread_count(&self.db, &uid).await)
                } else {
                    session_err()
                }
            }

            // GROUP MESSAGES
            "/send_group_message" if args.len() >= 3 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    let body = args[2..].join(" ");
                    let sink = self.realtime.as_deref().map(|hub| hub as &dyn EventSink);
                    wire(messages::send_group(&self.db, sink, args[1], &uid, &body).await)
                } else {
                    session_err()
                }
            }
            "/group_messages" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(messages::list_group(&self.db, args[1], &uid).await)
                } else {
                    session_err()
                }
            }
            "/group_participants" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(messages::list_group_participants(&self.db, args[1], &uid).await)
                } else {
                    session_err()
                }
            }

            // NOTIFICATIONS
            "/notifications" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(notifications::list_for_user(&self.db, &uid).await)
                } else {
                    session_err()
                }
            }
            "/mark_notification_read" if args.len() == 2 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    match parse_i64(args[1], "notification id") {
                        Ok(nid) => match notifications::mark_read(&self.db, nid, &uid).await {
                            Ok(()) => "OK: marked read".to_string(),
                            Err(e) => e.to_wire(),
                        },
                        Err(e) => e.to_wire(),
                    }
                } else {
                    session_err()
                }
            }
            "/unread_notifications" if args.len() == 1 => {
                if let Some(uid) = auth::validate_session(&self.db, args[0]).await {
                    wire(notifications::unread_count(&self.db, &uid).await)
                } else {
                    session_err()
                }
            }

            // SYSTEM
            "/help" => help(),
            "/quit" => "OK: Disconnected".to_string(),
            _ => ApiError::Validation("unknown or invalid command".to_string()).to_wire(),
        }
    }
}
