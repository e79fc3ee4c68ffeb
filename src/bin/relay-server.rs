//! Minimal HTTP/WS glue binary (§2.1/§6.5). Contains no room business
//! logic — it parses requests, calls into the hub/room handles, and
//! serializes the JSON shapes the wire contract defines. Transport framing,
//! cookie/session plumbing, and TLS termination are explicit out-of-scope
//! collaborators; this binary only demonstrates the documented interface
//! boundary so the crate is runnable end to end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use ghostroom::config::RelayConfig;
use ghostroom::growl::LoggingGrowlHandler;
use ghostroom::hub::{Hub, HubConfig};
use ghostroom::room::RoomError;

/// Per-request deadline for the HTTP surface (not the WS frame deadline,
/// which is `RoomEngineConfig::ws_timeout_secs` inside the room loop).
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "Ephemeral E2E-encrypted group chat relay")]
struct Args {
    /// Address to bind the HTTP/WS listener on, overrides config.
    #[arg(long)]
    bind: Option<String>,
    /// Path prefix for config file discovery (expects `<path>/default.toml`).
    #[arg(long)]
    config: Option<String>,
}

struct AppState {
    hub: Hub,
    max_message_len: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Some(dir) = &args.config {
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to switch to --config directory {dir}"))?;
    }

    let mut config = RelayConfig::load().unwrap_or_else(|e| {
        error!(error = %e, "failed to load config, using defaults");
        RelayConfig {
            bind: "127.0.0.1:8787".to_string(),
            room_engine: Default::default(),
        }
    });
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let hub = Hub::new(HubConfig {
        id_len: config.room_engine.room_id_len,
        max_peers_per_room: config.room_engine.max_peers_per_room,
        room_age: config.room_engine.room_age(),
        ws_timeout: config.room_engine.ws_timeout(),
    });

    for predefined in &config.room_engine.predefined_rooms {
        let users = predefined
            .users
            .iter()
            .map(|u| ghostroom::room::PredefinedUser {
                name: u.name.clone(),
                password: u.password.clone(),
                growl: u.growl,
            })
            .collect();
        let growl_handler = predefined
            .users
            .iter()
            .any(|u| u.growl)
            .then(|| Arc::new(LoggingGrowlHandler::new()) as Arc<dyn ghostroom::growl::GrowlHandler>);

        if let Err(e) = hub
            .add_predefined_room(
                predefined.id.clone(),
                predefined.name.clone(),
                predefined.motd.clone(),
                users,
                growl_handler,
            )
            .await
        {
            error!(room = %predefined.id, error = %e, "failed to start predefined room");
        }
    }

    let state = Arc::new(AppState {
        hub,
        max_message_len: config.room_engine.max_message_len,
    });

    let app = Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/:id/login", post(login))
        .route("/rooms/:id/ws", get(connect_ws))
        .route("/health", get(|| async { "ok" }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(HTTP_REQUEST_TIMEOUT)),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.bind))?;
    info!(bind = %config.bind, "relay-server listening");
    axum::serve(listener, app)
        .await
        .context("relay-server exited with an error")?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct CreateRoomRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
    id: String,
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateRoomRequest>>,
) -> impl IntoResponse {
    let name = body.map(|Json(b)| b.name).unwrap_or_default();
    match state.hub.add_room(name, None).await {
        Ok(handle) => Json(CreateRoomResponse { id: handle.id().to_string() }).into_response(),
        Err(e) => {
            error!(error = %e, "failed to create room");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    spub: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    al: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let Some(room) = state.hub.get_room(&room_id).await else {
        return (axum::http::StatusCode::NOT_FOUND, "room not found").into_response();
    };

    let outcome = match room.login(req.spub, req.secret).await {
        Ok(outcome) => outcome,
        Err(e) => return room_error_response(e),
    };

    let (handle, sealed_auths) = if !req.al.is_empty() {
        match room.get_login_tokens(req.al).await {
            Some(bundle) => (bundle.handle, bundle.sealed_auths),
            None => (String::new(), Default::default()),
        }
    } else {
        (String::new(), Default::default())
    };

    Json(ghostroom::schema::LoginResponse {
        secret: outcome.secret,
        since: outcome.since,
        server_pub_key: room.spub().to_string(),
        handle,
        sealed_auths,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    spub: String,
}

async fn connect_ws(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(room) = state.hub.get_room(&room_id).await else {
        return (axum::http::StatusCode::NOT_FOUND, "room not found").into_response();
    };

    ws.max_message_size(state.max_message_len)
        .on_upgrade(move |socket| async move {
            if let Err(e) = room.connect_peer(query.spub, socket) {
                error!(error = %e, "failed to hand socket to room");
            }
        })
        .into_response()
}

fn room_error_response(err: RoomError) -> axum::response::Response {
    let status = match err {
        RoomError::MalformedSpub
        | RoomError::InvalidRoomPassword
        | RoomError::InvalidUserPassword => axum::http::StatusCode::BAD_REQUEST,
        RoomError::AlreadyConnected | RoomError::RoomCapacityExceeded => {
            axum::http::StatusCode::CONFLICT
        }
        RoomError::Gone => axum::http::StatusCode::GONE,
    };
    (status, err.to_string()).into_response()
}
