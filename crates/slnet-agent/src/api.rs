use std::{future::Future, path::PathBuf};

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use slnet_process::{PlayerSnapshot, ServerEvent, ServerState, StatusSnapshot, format_uptime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{controller::ControlRequest, support::unix_ms};

/// Channels the HTTP surface shares with the controller task.
#[derive(Clone)]
pub struct ApiState {
    pub requests: mpsc::Sender<ControlRequest>,
    pub events: broadcast::Sender<ServerEvent>,
    pub status: watch::Receiver<StatusSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorBody { message: message.into() })).into_response()
}

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    snapshot: StatusSnapshot,
    uptime: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectoryRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ExternalIpResponse {
    ip: String,
    port: u16,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/players", get(players))
        .route("/api/external-ip", get(external_ip))
        .route("/api/events", get(events_ws))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/input", post(input))
        .route("/api/directory", post(directory))
        .route("/api/fatal/ack", post(fatal_ack))
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let snapshot = state.status.borrow().clone();
    let uptime = snapshot.uptime_secs(unix_ms()).map(format_uptime);
    Json(StatusResponse { snapshot, uptime })
}

async fn players(State(state): State<ApiState>) -> Json<PlayerSnapshot> {
    Json(state.status.borrow().players.clone())
}

async fn submit(state: &ApiState, req: ControlRequest) -> Response {
    match state.requests.send(req).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(Accepted { accepted: true })).into_response(),
        Err(_) => json_error(StatusCode::SERVICE_UNAVAILABLE, "supervisor is not running"),
    }
}

async fn start(State(state): State<ApiState>) -> Response {
    submit(&state, ControlRequest::Start).await
}

async fn stop(State(state): State<ApiState>) -> Response {
    submit(&state, ControlRequest::Stop).await
}

async fn fatal_ack(State(state): State<ApiState>) -> Response {
    submit(&state, ControlRequest::AcknowledgeFatal).await
}

async fn input(State(state): State<ApiState>, Json(body): Json<InputRequest>) -> Response {
    if body.text.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "text must not be empty");
    }
    submit(&state, ControlRequest::SendInput(body.text)).await
}

async fn directory(State(state): State<ApiState>, Json(body): Json<DirectoryRequest>) -> Response {
    if body.path.as_os_str().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path must not be empty");
    }
    submit(&state, ControlRequest::ChangeDirectory(body.path)).await
}

async fn external_ip(State(state): State<ApiState>) -> Response {
    let (tx, rx) = oneshot::channel();
    if state.requests.send(ControlRequest::ExternalIp(tx)).await.is_err() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "supervisor is not running");
    }
    match rx.await {
        Ok(Ok(ip)) => {
            let port = state.status.borrow().port;
            Json(ExternalIpResponse {
                ip: ip.to_string(),
                port,
            })
            .into_response()
        }
        Ok(Err(message)) => json_error(StatusCode::BAD_GATEWAY, message),
        Err(_) => json_error(StatusCode::SERVICE_UNAVAILABLE, "supervisor is not running"),
    }
}

async fn events_ws(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published in between is lost.
    let rx = state.events.subscribe();
    let current = state.status.borrow().state;
    ws.on_upgrade(move |socket| forward_events(socket, rx, current))
}

async fn forward_events(
    socket: WebSocket,
    mut rx: broadcast::Receiver<ServerEvent>,
    current: ServerState,
) {
    let (mut sender, mut receiver) = socket.split();

    if send_event(&mut sender, &ServerEvent::State { state: current })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Ok(ev) => {
                    if send_event(&mut sender, &ev).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagging; dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    ev: &ServerEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(ev).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
