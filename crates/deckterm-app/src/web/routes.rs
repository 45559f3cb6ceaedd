use axum::{
    body::Bytes,
    extract::{
        rejection::JsonRejection,
        ws::{Message as WsMessage, WebSocket},
        Path, RawQuery, State, WebSocketUpgrade,
    },
    http::{HeaderMap, Method},
    response::{IntoResponse, Json, Response},
    routing::{any, delete, get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use deckterm_terminal::{CreateRequest, Outbound, SessionSummary, Subscription, TerminalManager};
use deckterm_types::{ClientFrame, Owner, ServerFrame, SessionId};

use super::auth::Caller;
use super::error::AppError;
use super::upstream::UpstreamProxy;
use crate::config::IdentityConfig;

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TerminalManager>,
    pub identity: Arc<IdentityConfig>,
    pub upstream: Option<Arc<UpstreamProxy>>,
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new();
    // Served both bare and under /api
    for prefix in ["", "/api"] {
        router = router
            .route(&format!("{}/terminals", prefix), get(list_terminals).post(create_terminal))
            .route(&format!("{}/terminals/:id", prefix), delete(close_terminal))
            .route(&format!("{}/terminals/:id/resize", prefix), post(resize_terminal));
    }

    router = router
        .route("/api/health", get(health))
        // Streaming channel
        .route("/stream/terminals/:id", get(stream_handler))
        .route("/ws/terminals/:id", get(stream_handler));

    if state.upstream.is_some() {
        router = router.route("/upstream/*path", any(proxy_upstream));
    }

    router.with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateBody {
    cwd: Option<PathBuf>,
    cols: Option<u16>,
    rows: Option<u16>,
    persistent: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResizeBody {
    cols: Option<u16>,
    rows: Option<u16>,
}

/// GET /terminals - the caller's sessions, oldest first
async fn list_terminals(
    State(state): State<AppState>,
    Caller(owner): Caller,
) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list_by_owner(&owner.id).await)
}

/// POST /terminals - start a new shell
///
/// The body is optional; an empty body uses every default.
async fn create_terminal(
    State(state): State<AppState>,
    Caller(owner): Caller,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let body: CreateBody = if body.iter().all(u8::is_ascii_whitespace) {
        CreateBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))?
    };

    let session = state
        .manager
        .create(
            &owner,
            CreateRequest {
                cwd: body.cwd,
                cols: body.cols,
                rows: body.rows,
                persistent: body.persistent,
            },
        )
        .await?;
    let (cols, rows) = session.size();

    Ok(Json(serde_json::json!({
        "id": session.id,
        "cols": cols,
        "rows": rows,
        "cwd": session.cwd.display().to_string(),
    })))
}

/// DELETE /terminals/:id - close one of the caller's sessions
async fn close_terminal(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Caller(owner): Caller,
) -> Result<Json<serde_json::Value>, AppError> {
    state.manager.close(&id, &owner.id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /terminals/:id/resize
async fn resize_terminal(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Caller(owner): Caller,
    payload: Result<Json<ResizeBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(body) = payload?;
    let (cols, rows) = state
        .manager
        .resize(&id, &owner.id, body.cols.unwrap_or(0), body.rows.unwrap_or(0))
        .await?;
    Ok(Json(serde_json::json!({ "ok": true, "cols": cols, "rows": rows })))
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.manager.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "terminals": stats.terminals,
        "maxTerminals": stats.max_terminals,
        "uptimeSecs": stats.uptime.as_secs(),
    }))
}

/// GET /stream/terminals/:id - WebSocket endpoint
///
/// Ownership is checked before the upgrade so refusals are plain HTTP errors.
async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Caller(owner): Caller,
) -> Result<Response, AppError> {
    state.manager.authorize(&id, &owner.id).await?;
    Ok(ws.on_upgrade(move |socket| handle_stream(socket, state, id, owner)))
}

async fn handle_stream(socket: WebSocket, state: AppState, id: SessionId, owner: Owner) {
    let (mut sink, mut stream) = socket.split();

    // The session may have ended between the check and the upgrade
    let (session, subscription) = match state.manager.attach(&id, &owner.id).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(session_id = %id, owner = %owner.id, error = %e, "attach after upgrade failed");
            let frame = ServerFrame::Error {
                reason: e.reason().to_string(),
                message: e.to_string(),
            };
            let _ = sink.send(WsMessage::Text(frame.to_json())).await;
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
    };
    let Subscription {
        id: subscriber,
        mut receiver,
        sender,
        dropped,
    } = subscription;
    info!(session_id = %id, owner = %owner.id, subscriber, "stream attached");

    // Outbound pump: output and control frames in the order they were queued
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = receiver.recv().await {
            let message = match outbound {
                Outbound::Output(text) => WsMessage::Text(text),
                Outbound::Control(frame) => WsMessage::Text(frame.to_json()),
                Outbound::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                debug!(subscriber, "transport closed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            _ = dropped.cancelled() => {
                warn!(session_id = %id, subscriber, "subscriber fell behind, disconnecting");
                break;
            }
            message = stream.next() => {
                let frame = match message {
                    Some(Ok(WsMessage::Text(text))) => ClientFrame::decode(&text),
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        ClientFrame::Raw(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(session_id = %id, subscriber, error = %e, "stream read failed");
                        break;
                    }
                };
                state.manager.handle_frame(&session, &sender, frame).await;
            }
        }
    }

    state.manager.detach(&session, subscriber);
    send_task.abort();
    info!(session_id = %id, subscriber, "stream detached");
}

/// ANY /upstream/*path - forward to the companion service
async fn proxy_upstream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    Caller(owner): Caller,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let Some(proxy) = state.upstream.as_ref() else {
        return Ok(axum::http::StatusCode::NOT_FOUND.into_response());
    };
    proxy
        .forward(&owner, method, &path, query.as_deref(), &headers, body)
        .await
}
