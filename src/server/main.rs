// Entry point for the campool coordination server.
use campool::server::{
    auth,
    config::ServerConfig,
    connection::Server,
    database::Database,
    realtime::RealtimeHub,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    let database = Arc::new(Database::connect(&config.database_url).await?);
    database.migrate().await?;
    info!("Database ready at {}", config.database_url);

    // Realtime is optional: without Redis the command protocol still works,
    // group messages just lose live delivery.
    let realtime = match RealtimeHub::new(&config.redis_url).await {
        Ok(hub) => {
            let hub = Arc::new(hub);
            hub.start_subscriber();
            Some(hub)
        }
        Err(e) => {
            warn!("Redis unavailable ({}), realtime delivery disabled", e);
            None
        }
    };

    if let Some(hub) = &realtime {
        let ws_addr = format!("{}:{}", config.host, config.port + 1);
        let hub = hub.clone();
        let db = database.clone();
        tokio::spawn(async move {
            if let Err(e) = run_websocket_server(&ws_addr, hub, db).await {
                error!("WebSocket server error: {}", e);
            }
        });
        info!("WebSocket server started on {}:{}", config.host, config.port + 1);
    }

    // Hourly sweep of expired session rows.
    let cleanup_db = database.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            auth::cleanup_expired_sessions(&cleanup_db).await;
        }
    });

    let addr = format!("{}:{}", config.host, config.port);
    let server = Arc::new(Server {
        db: database,
        config,
        realtime,
    });
    server.run(&addr).await
}

async fn run_websocket_server(
    addr: &str,
    hub: Arc<RealtimeHub>,
    database: Arc<Database>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket listener bound on {}", addr);

    while let Ok((stream, peer)) = listener.accept().await {
        info!("New WebSocket connection from {}", peer);
        let hub = hub.clone();
        let database = database.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    if let Err(e) = hub.handle_connection(ws_stream, database).await {
                        error!("WebSocket connection error ({}): {}", peer, e);
                    }
                }
                Err(e) => error!("WebSocket handshake failed ({}): {}", peer, e),
            }
        });
    }
    Ok(())
}
