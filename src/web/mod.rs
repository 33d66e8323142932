pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use self::state::{parse_message, result_message, state_message, Inbound, WebState};
use crate::control::{CommandQueue, Published, StatePublisher};
use crate::engine::Command;
use crate::macros::{storage, MacroId, MacroSummary};

/// State changes are pushed to sockets at most this often (~5 Hz).
const STATE_EMIT_INTERVAL: Duration = Duration::from_millis(200);
/// How long a socket waits for the hardware loop to apply a command.
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Start the web server on the given port.
pub async fn start_server(
    port: u16,
    publisher: Arc<StatePublisher>,
    commands: Arc<CommandQueue>,
) -> anyhow::Result<()> {
    let (updates, _) = broadcast::channel(16);
    tokio::spawn(emit_state(publisher.clone(), updates.clone()));

    let shared = Arc::new(WebState {
        publisher,
        commands,
        updates,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/state", get(api_state))
        .route("/api/macros", get(api_macros))
        .route("/api/macros/:id/export", get(api_export))
        .route("/ws", get(ws_handler))
        .with_state(shared);

    let addr = format!("0.0.0.0:{port}");
    info!("[WEB] Server starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Push the published state to every socket when it changes.
async fn emit_state(publisher: Arc<StatePublisher>, updates: broadcast::Sender<String>) {
    let mut interval = tokio::time::interval(STATE_EMIT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if let Some(published) = publisher.take_changed() {
            // No subscribers is fine
            let _ = updates.send(state_message("state", &published));
        }
    }
}

/// Serve the embedded index.html.
async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}

/// GET /api/state
async fn api_state(State(state): State<Arc<WebState>>) -> Json<Published> {
    Json(state.publisher.snapshot())
}

/// GET /api/macros
async fn api_macros(State(state): State<Arc<WebState>>) -> Json<Vec<MacroSummary>> {
    Json(state.publisher.snapshot().macros)
}

/// GET /api/macros/:id/export, the persisted MAC3 record.
async fn api_export(State(state): State<Arc<WebState>>, Path(id): Path<u32>) -> Response {
    let id = MacroId(id);
    let known = state.publisher.snapshot().macros.iter().any(|m| m.id == id);
    if !known {
        return (StatusCode::NOT_FOUND, format!("macro {id} not found")).into_response();
    }

    // The store belongs to the hardware loop, so ask it
    let reply = state.commands.request(Command::ExportMacro(id));
    match tokio::time::timeout(COMMAND_REPLY_TIMEOUT, reply).await {
        Ok(Ok(Ok(Some(data)))) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", storage::timeline_filename(id)),
                ),
            ],
            Bytes::from(data),
        )
            .into_response(),
        Ok(Ok(Ok(None))) => (StatusCode::INTERNAL_SERVER_ERROR, "export produced no data").into_response(),
        Ok(Ok(Err(e))) => {
            warn!("[WEB] Export of macro {id} failed: {e}");
            (StatusCode::NOT_FOUND, e).into_response()
        }
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "export dropped").into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "controller loop not responding").into_response(),
    }
}

/// WebSocket handler for real-time state updates and commands.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<WebState>) {
    let (mut sender, mut receiver) = socket.split();

    // Send initial state
    let init = state_message("init", &state.publisher.snapshot());
    if let Err(e) = sender.send(Message::Text(init)).await {
        debug!("[WEB] Failed to send init: {e}");
        return;
    }

    // Direct replies for this socket (command results, state on request)
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);
    let mut updates = BroadcastStream::new(state.updates.subscribe());

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                update = updates.next() => match update {
                    Some(Ok(msg)) => msg,
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        debug!("[WEB] Socket lagged, skipped {n} updates");
                        continue;
                    }
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let parsed = serde_json::from_str::<serde_json::Value>(&text)
                    .map_err(|e| format!("invalid JSON: {e}"))
                    .and_then(|val| parse_message(&val));
                match parsed {
                    Ok(Inbound::RequestState) => {
                        let msg = state_message("state", &state.publisher.snapshot());
                        let _ = reply_tx.send(msg).await;
                    }
                    Ok(Inbound::Command(cmd)) => {
                        let name = cmd.name();
                        let reply = state.commands.request(cmd);
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let outcome = match tokio::time::timeout(COMMAND_REPLY_TIMEOUT, reply).await {
                                Ok(Ok(outcome)) => outcome,
                                Ok(Err(_)) => Err("command dropped".into()),
                                Err(_) => Err("controller loop not running; command queued".into()),
                            };
                            let _ = reply_tx.send(result_message(name, &outcome)).await;
                        });
                    }
                    Err(e) => {
                        warn!("[WEB] Bad WebSocket message: {e}");
                        let _ = reply_tx.send(result_message("?", &Err(e))).await;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("[WEB] WebSocket error: {e}");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    debug!("[WEB] WebSocket connection closed");
}
