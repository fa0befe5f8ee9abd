//! WebSocket listener for provider media streams.
//!
//! One route upgrades the provider's connection and glues the socket to
//! a call pipeline: a reader task parses text frames into envelopes, a
//! writer task flushes serialized outbound envelopes, and the pipeline
//! runs in between. A live-call registry keeps a cancellation handle
//! per connection so shutdown and `/healthz` can see active calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::pipeline::{self, DialogDeps};
use crate::telephony;

const SOCKET_CHANNEL_SIZE: usize = 64;

/// Cancellation handles for every live connection.
#[derive(Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, token: CancellationToken) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut calls) = self.calls.lock() {
            calls.insert(id, token);
        }
        id
    }

    fn unregister(&self, id: Uuid) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.remove(&id);
        }
    }

    /// Number of connections currently running a call pipeline.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    /// Cancel every live call; each follows its orderly exit path.
    pub fn shutdown_all(&self) {
        if let Ok(calls) = self.calls.lock() {
            for token in calls.values() {
                token.cancel();
            }
        }
    }
}

/// Shared state behind the axum router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub deps: DialogDeps,
    pub registry: Arc<CallRegistry>,
}

/// Build the engine's router: health plus the media-stream upgrade.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/media-stream", get(media_stream))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_calls": state.registry.active_calls(),
    }))
}

async fn media_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

async fn handle_media_socket(socket: WebSocket, state: AppState) {
    info!("media stream connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (envelope_tx, envelope_rx) = mpsc::channel(SOCKET_CHANNEL_SIZE);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(SOCKET_CHANNEL_SIZE);

    let cancel = CancellationToken::new();
    let id = state.registry.register(cancel.clone());

    // Reader: socket text frames → parsed envelopes.
    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = reader_cancel.cancelled() => break,
                message = ws_rx.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match telephony::parse_envelope(&text) {
                                Ok(envelope) => {
                                    if envelope_tx.send(envelope).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "dropping unparseable message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => debug!("ignoring non-text frame"),
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error");
                            break;
                        }
                    }
                }
            }
        }
        // Dropping the sender tells ingress the socket is gone.
    });

    // Writer: serialized envelopes → socket.
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    pipeline::run_call(
        Arc::clone(&state.config),
        state.deps.clone(),
        envelope_rx,
        outbound_tx,
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    let _ = tokio::join!(reader, writer);
    state.registry.unregister(id);
    info!("media stream closed");
}
