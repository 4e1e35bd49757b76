//! Axum HTTP server for the gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::{DatabaseError, ExtractionError, GatewayError};
use crate::extraction::ExtractionEngine;
use crate::gateway::types::*;
use crate::relay::{Relay, RelayEvent, TurnRequest};
use crate::store::{Store, is_valid_session_id};

/// Events buffered between a running turn and its client.
const EVENT_BUFFER: usize = 64;

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub relay: Arc<Relay>,
    pub engine: Arc<ExtractionEngine>,
    pub store: Arc<dyn Store>,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(relay: Arc<Relay>, engine: Arc<ExtractionEngine>, store: Arc<dyn Store>) -> Self {
        Self {
            relay,
            engine,
            store,
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }

    /// Ask the server to stop accepting connections.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Build the router. `addr` is the bound address, used for the CORS origins.
pub fn router(state: Arc<GatewayState>, addr: SocketAddr) -> Router {
    let interview = Router::new()
        .route("/api/interview/stream", post(interview_stream_handler))
        .route("/api/interview/ws", get(interview_ws_handler));

    let sessions = Router::new()
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/{id}/transcript", get(transcript_handler))
        .route("/api/sessions/{id}/result", get(result_handler))
        .route("/api/sessions/{id}/complete", post(complete_handler))
        .route("/api/sessions/{id}/evaluate", post(evaluate_handler));

    // Only the gateway's own local origins may call it from a browser.
    let origins: Vec<HeaderValue> = [
        format!("http://{}:{}", addr.ip(), addr.port()),
        format!("http://localhost:{}", addr.port()),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(AllowHeaders::list([header::CONTENT_TYPE]));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(interview)
        .merge(sessions)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr`, serve in the background and return the bound address.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> Result<SocketAddr, GatewayError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::StartupFailed {
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::StartupFailed {
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(Arc::clone(&state), bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Gateway shutting down");
            })
            .await
        {
            tracing::error!("Gateway server error: {}", e);
        }
    });

    tracing::info!(%bound_addr, "Gateway listening");
    Ok(bound_addr)
}

// --- Health ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// --- Interview handlers ---

async fn interview_stream_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<TurnRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_session_id(&req.session_id)?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let relay = Arc::clone(&state.relay);
    tokio::spawn(async move {
        relay.run_turn(req, tx).await;
    });

    // Dropping the response body drops `rx`, which the relay sees as disconnect.
    let stream = ReceiverStream::new(rx).map(|event| Event::default().json_data(event));
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text(""),
    );
    Ok((
        [("X-Accel-Buffering", "no"), ("Cache-Control", "no-cache")],
        sse,
    ))
}

async fn interview_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_interview_socket(socket, state))
}

/// Run turns for one socket, one at a time, until the client goes away.
async fn handle_interview_socket(mut socket: WebSocket, state: Arc<GatewayState>) {
    tracing::debug!("Interview socket opened");

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let request: TurnRequest = match serde_json::from_str(text.as_str()) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected socket message");
                if send_event(&mut socket, &RelayEvent::error("Invalid JSON message"))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };
        if !is_valid_session_id(&request.session_id) {
            if send_event(&mut socket, &RelayEvent::error("Invalid session id"))
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let relay = Arc::clone(&state.relay);
        let turn = tokio::spawn(async move { relay.run_turn(request, tx).await });

        let mut client_gone = false;
        while let Some(event) = rx.recv().await {
            if send_event(&mut socket, &event).await.is_err() {
                client_gone = true;
                break;
            }
        }
        drop(rx);
        if let Err(e) = turn.await {
            tracing::error!(error = %e, "Turn task failed");
        }
        if client_gone {
            break;
        }
    }

    tracing::debug!("Interview socket closed");
}

async fn send_event(socket: &mut WebSocket, event: &RelayEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

// --- Session handlers ---

async fn create_session_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<(StatusCode, Json<SessionCreatedResponse>), (StatusCode, String)> {
    let session_id = state.store.create_session().await.map_err(store_error)?;
    tracing::info!(%session_id, "Session created");
    Ok((StatusCode::CREATED, Json(SessionCreatedResponse { session_id })))
}

async fn transcript_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<TranscriptResponse>, (StatusCode, String)> {
    validate_session_id(&id)?;
    if !state.store.session_exists(&id).await.map_err(store_error)? {
        return Err((StatusCode::NOT_FOUND, "Session not found".to_string()));
    }
    let messages = state.store.get_transcript(&id).await.map_err(store_error)?;
    let pass_complete = state.store.is_pass_complete(&id).await.map_err(store_error)?;
    Ok(Json(TranscriptResponse {
        session_id: id,
        pass_complete,
        messages,
    }))
}

async fn result_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::store::ExtractionResult>, (StatusCode, String)> {
    validate_session_id(&id)?;
    state
        .store
        .get_result(&id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or((
            StatusCode::NOT_FOUND,
            "No extraction result for this session".to_string(),
        ))
}

async fn complete_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<PassCompleteResponse>, (StatusCode, String)> {
    validate_session_id(&id)?;
    state.store.mark_pass_complete(&id).await.map_err(store_error)?;
    tracing::info!(session_id = %id, "First pass marked complete");
    Ok(Json(PassCompleteResponse {
        session_id: id,
        pass_complete: true,
    }))
}

async fn evaluate_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<EvaluateResponse>, (StatusCode, String)> {
    validate_session_id(&id)?;
    let _guard = state
        .relay
        .reserve_session(&id)
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    let outcome = state.engine.evaluate(&id).await.map_err(|e| match e {
        ExtractionError::EmptyTranscript { .. } => (
            StatusCode::NOT_FOUND,
            "No messages found in conversation".to_string(),
        ),
        ExtractionError::Database(e) => store_error(e),
        other => {
            tracing::error!(session_id = %id, error = %other, "Evaluation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    })?;
    Ok(Json(EvaluateResponse {
        session_id: id,
        degraded: outcome.degraded.as_ref().map(|e| e.to_string()),
        changed_fields: outcome.changed_fields,
        result: outcome.result,
    }))
}

// --- Helpers ---

fn validate_session_id(id: &str) -> Result<(), (StatusCode, String)> {
    if is_valid_session_id(id) {
        Ok(())
    } else {
        Err((StatusCode::BAD_REQUEST, "Invalid session id".to_string()))
    }
}

fn store_error(e: DatabaseError) -> (StatusCode, String) {
    match e {
        DatabaseError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        other => {
            tracing::error!(error = %other, "Store operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal storage error".to_string(),
            )
        }
    }
}
