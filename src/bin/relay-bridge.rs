//! relay-bridge - live JetStream feeds over WebSocket
//!
//! Serves `/health` and a `/live` WebSocket endpoint: the first text message
//! on the socket is the stream request, after which every forwarded record is
//! pushed as one JSON frame. Also provides `check` and `tail` commands for
//! running the health probe or a single stream from the terminal.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_bridge::{
    BridgeError, BridgeSettings, ChannelStatus, Datasource, HealthStatus, LoopExit, OutputRecord,
    StreamRequest,
};

/// Records buffered between the poll loop and a slow subscriber.
const RECORD_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "relay-bridge")]
#[command(version, about = "Bridge NATS JetStream topics to live subscribers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP health endpoint and the /live WebSocket
    Serve {
        /// Listen address (default: 0.0.0.0:$PORT, PORT defaults to 8080)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Probe the broker connection and exit non-zero if it fails
    Check,

    /// Stream one topic to stdout as newline-delimited JSON frames
    Tail {
        /// Topic within the caller's namespace
        #[arg(short, long)]
        topic: String,

        /// RFC3339 start time; omit to receive only new messages
        #[arg(short, long)]
        start_time: Option<String>,

        /// Stable subscription id, reused as the durable consumer name
        #[arg(short, long)]
        path: Option<String>,
    },
}

#[derive(Clone)]
struct AppState {
    datasource: Arc<Datasource>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let settings = match BridgeSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    let datasource = Arc::new(Datasource::new(settings));

    let result = match cli.command {
        Commands::Serve { bind } => serve(datasource, bind).await,
        Commands::Check => check(&datasource).await,
        Commands::Tail { topic, start_time, path } => {
            let mut request = StreamRequest::new(topic);
            request.start_time = start_time;
            request.path = path;
            tail(datasource, request).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn serve(
    datasource: Arc<Datasource>,
    bind: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = match bind {
        Some(addr) => addr,
        None => {
            let port = std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()?;
            SocketAddr::from(([0, 0, 0, 0], port))
        }
    };

    let state = AppState { datasource };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/live", get(live_handler))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    tracing::info!("Relay bridge listening on {}", addr);
    tracing::info!("Broker: {}", state.datasource.settings().broker_address());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn check(datasource: &Datasource) -> Result<(), Box<dyn std::error::Error>> {
    let result = datasource.check_health().await;
    println!("{}", serde_json::to_string(&result)?);

    match result.status {
        HealthStatus::Ok => Ok(()),
        HealthStatus::Error => Err(result.message.into()),
    }
}

async fn tail(
    datasource: Arc<Datasource>,
    request: StreamRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    request.validate()?;

    let (tx, mut rx) = mpsc::channel::<OutputRecord>(RECORD_BUFFER);
    let cancel = CancellationToken::new();

    let stream_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { datasource.run_stream(request, tx, cancel).await }
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, stopping stream");
                cancel.cancel();
            }
        }
    });

    while let Some(record) = rx.recv().await {
        println!("{}", serde_json::to_string(&record.to_frame())?);
    }

    match stream_task.await? {
        Ok(LoopExit { reason: BridgeError::Cancelled, stats }) => {
            tracing::info!("Stream stopped after {} records", stats.forwarded);
            Ok(())
        }
        Ok(exit) => Err(exit.reason.into()),
        Err(e) => Err(e.into()),
    }
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Response {
    let result = state.datasource.check_health().await;
    let status = match result.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(result)).into_response()
}

/// WebSocket upgrade for live streams
async fn live_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_live_socket(socket, state))
}

async fn handle_live_socket(mut socket: WebSocket, state: AppState) {
    let Some(request) = read_stream_request(&mut socket).await else {
        return;
    };

    let path = request.path.clone().unwrap_or_default();
    if state.datasource.subscribe_stream(&path) != ChannelStatus::Ok {
        close_socket(&mut socket, close_code::POLICY, "subscription refused").await;
        return;
    }

    tracing::info!(topic = %request.topic, path = %path, "Live stream requested");

    let (tx, mut rx) = mpsc::channel::<OutputRecord>(RECORD_BUFFER);
    let cancel = CancellationToken::new();
    let mut stream_task = tokio::spawn({
        let datasource = state.datasource.clone();
        let cancel = cancel.clone();
        async move { datasource.run_stream(request, tx, cancel).await }
    });

    let mut records_open = true;
    let mut socket_open = true;

    let outcome = loop {
        tokio::select! {
            record = rx.recv(), if records_open => match record {
                Some(record) => {
                    let frame = match serde_json::to_string(&record.to_frame()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!("Failed to encode frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.send(Message::Text(frame)).await {
                        tracing::info!("Subscriber send failed: {}", e);
                        socket_open = false;
                        records_open = false;
                        rx.close();
                        cancel.cancel();
                    }
                }
                None => records_open = false,
            },
            incoming = socket.recv(), if socket_open => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    tracing::info!("Subscriber disconnected");
                    socket_open = false;
                    cancel.cancel();
                }
                Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                    if state.datasource.publish_stream(&path) == ChannelStatus::PermissionDenied {
                        tracing::debug!("Ignoring message published by subscriber");
                    }
                }
                Some(Ok(_)) => {}
            },
            joined = &mut stream_task => break joined,
        }
    };

    let (code, reason) = match outcome {
        Ok(Ok(exit)) => {
            tracing::info!(forwarded = exit.stats.forwarded, "Live stream ended: {}", exit.reason);
            (close_code::NORMAL, exit.reason.to_string())
        }
        Ok(Err(e)) => {
            tracing::warn!("Live stream setup failed: {}", e);
            (close_code::ERROR, e.to_string())
        }
        Err(e) => {
            tracing::error!("Live stream task failed: {}", e);
            (close_code::ERROR, "internal error".to_string())
        }
    };

    if socket_open {
        close_socket(&mut socket, code, reason).await;
    }
}

/// Wait for the first text message and parse it as a stream request
async fn read_stream_request(socket: &mut WebSocket) -> Option<StreamRequest> {
    while let Some(incoming) = socket.recv().await {
        match incoming {
            Ok(Message::Text(body)) => {
                return match StreamRequest::from_json(body.as_bytes()) {
                    Ok(request) => Some(request),
                    Err(e) => {
                        tracing::warn!("Rejected stream request: {}", e);
                        close_socket(socket, close_code::INVALID, e.to_string()).await;
                        None
                    }
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: impl Into<String>) {
    // Close reasons are limited to 123 bytes on the wire.
    let mut reason: String = reason.into();
    while reason.len() > 123 {
        reason.pop();
    }

    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!("Failed to send close frame: {}", e);
    }
}
