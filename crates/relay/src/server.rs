//! HTTP server and WebSocket endpoint.
//!
//! Each connected client holds one WebSocket. On connect the client
//! receives a `load_messages` event carrying the history snapshot,
//! then a stream of `chat_message` events as they are accepted.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::relay::Relay;
use crate::store::{self, MessageStore};
use crate::types::{ClientEvent, RelayOptions, ServerEvent};

/// How long to wait for the durable store before falling back to
/// memory-only operation.
const STORE_BOOT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

/// Build the relay, connecting the durable store when a database URL
/// is configured. Store failures are logged and degrade the server to
/// memory-only operation; they never abort startup.
pub async fn build_relay(options: &RelayOptions) -> Arc<Relay> {
    let Some(database_url) = options.database_url.clone() else {
        info!("No database configured, running memory-only");
        return Relay::new(options);
    };

    let retention = options.retention_seconds;
    let capacity = options.history_capacity;
    let boot = tokio::task::spawn_blocking(move || {
        let store = MessageStore::open(&database_url, retention)?;
        let recent = store.load_recent(capacity)?;
        Ok::<_, store::StoreError>((store, recent))
    });

    match tokio::time::timeout(STORE_BOOT_TIMEOUT, boot).await {
        Ok(Ok(Ok((store, recent)))) => {
            let relay = {
                let (writer, _handle) = store::spawn_store_writer(Arc::new(store));
                Relay::with_writer(options, Some(writer))
            };
            relay.seed(recent);
            info!("Durable store connected");
            relay
        }
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Durable store unavailable, running memory-only");
            Relay::new(options)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Durable store task failed, running memory-only");
            Relay::new(options)
        }
        Err(_) => {
            warn!(
                timeout_secs = STORE_BOOT_TIMEOUT.as_secs(),
                "Durable store connection timed out, running memory-only"
            );
            Relay::new(options)
        }
    }
}

pub fn create_router(relay: Arc<Relay>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(AppState { relay })
}

/// Bind and serve until the process is stopped.
pub async fn start_server(options: &RelayOptions) -> Result<(), Box<dyn std::error::Error>> {
    let relay = build_relay(options).await;
    let router = create_router(relay);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Chat relay listening on {}", addr);

    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let conn_id = Uuid::new_v4();
    info!(%conn_id, "Client connected");

    // Subscribe before replay so nothing accepted in between is
    // missed or duplicated.
    let (snapshot, mut rx) = relay.subscribe();
    let (mut sender, mut receiver) = socket.split();

    if send_event(&mut sender, &ServerEvent::LoadMessages(snapshot))
        .await
        .is_err()
    {
        info!(%conn_id, "Client disconnected during replay");
        return;
    }

    loop {
        tokio::select! {
            broadcasted = rx.recv() => {
                match broadcasted {
                    Ok(message) => {
                        if send_event(&mut sender, &ServerEvent::ChatMessage(message))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // The client fell behind the broadcast buffer.
                        // It keeps the live stream from here on.
                        warn!(%conn_id, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(rejection) = handle_client_text(&relay, &text) {
                            if send_event(&mut sender, &rejection).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%conn_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!(%conn_id, "Client disconnected");
}

/// Parse and submit one inbound frame. Returns a `rejected` event to
/// send back when a well-formed submission fails validation.
/// Unparseable frames are logged and dropped without a reply.
fn handle_client_text(relay: &Relay, text: &str) -> Option<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed client frame");
            return None;
        }
    };

    let ClientEvent::ChatMessage(submission) = event;
    match relay.submit(&submission.username, &submission.text) {
        Ok(_) => None,
        Err(e) => Some(ServerEvent::Rejected {
            reason: e.to_string(),
        }),
    }
}

async fn send_event(
    sender: &mut (impl Sink<WsMessage, Error = axum::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Failed to serialize server event");
            return Ok(());
        }
    };
    sender.send(WsMessage::Text(payload.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};
    use tower::ServiceExt;

    use crate::types::{ChatMessage, Submission};

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    fn test_router() -> Router {
        create_router(Relay::new(&RelayOptions::default()))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_build_relay_without_database_is_memory_only() {
        let relay = build_relay(&RelayOptions::default()).await;
        assert!(!relay.durable());
    }

    #[tokio::test]
    async fn test_seed_respects_configured_history_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let database_url = dir.path().join("relay.sqlite").display().to_string();

        {
            let store =
                MessageStore::open(&database_url, RelayOptions::default().retention_seconds)
                    .unwrap();
            let now = chrono::Utc::now().timestamp_millis();
            for i in 0..5u64 {
                store
                    .save(&ChatMessage {
                        seq: i + 1,
                        username: format!("user{}", i),
                        text: format!("m{}", i),
                        timestamp: now + i as i64,
                    })
                    .unwrap();
            }
        }

        let options = RelayOptions {
            database_url: Some(database_url),
            history_capacity: 2,
            ..RelayOptions::default()
        };
        let relay = build_relay(&options).await;
        assert!(relay.durable());

        // Only the newest rows, up to the configured capacity.
        let snapshot = relay.history().snapshot();
        let texts: Vec<&str> = snapshot.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_build_relay_with_unreachable_database_degrades() {
        let options = RelayOptions {
            database_url: Some("/no/such/dir/relay.sqlite".to_string()),
            ..RelayOptions::default()
        };
        let relay = build_relay(&options).await;
        assert!(!relay.durable());
    }

    async fn serve_ephemeral(relay: Arc<Relay>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(relay)).await.unwrap();
        });
        format!("ws://{}/ws", addr)
    }

    async fn next_event(ws: &mut WsClient) -> ServerEvent {
        loop {
            match ws.next().await.unwrap().unwrap() {
                TungsteniteMessage::Text(text) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
                TungsteniteMessage::Ping(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    fn submission_frame(username: &str, text: &str) -> TungsteniteMessage {
        let event = ClientEvent::ChatMessage(Submission {
            username: username.to_string(),
            text: text.to_string(),
        });
        TungsteniteMessage::Text(serde_json::to_string(&event).unwrap().into())
    }

    #[tokio::test]
    async fn test_connect_replays_history_then_streams() {
        let relay = Relay::new(&RelayOptions::default());
        relay.submit("u1", "A").unwrap();
        relay.submit("u2", "B").unwrap();
        relay.submit("u3", "C").unwrap();

        let url = serve_ephemeral(relay.clone()).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let replay = next_event(&mut ws).await;
        let ServerEvent::LoadMessages(messages) = replay else {
            panic!("expected load_messages first, got {:?}", replay);
        };
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["A", "B", "C"]);

        relay.submit("u4", "D").unwrap();
        let live = next_event(&mut ws).await;
        let ServerEvent::ChatMessage(message) = live else {
            panic!("expected chat_message, got {:?}", live);
        };
        assert_eq!(message.text, "D");
        assert_eq!(message.seq, 4);
    }

    #[tokio::test]
    async fn test_submission_round_trips_to_sender() {
        let relay = Relay::new(&RelayOptions::default());
        let url = serve_ephemeral(relay).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let ServerEvent::LoadMessages(messages) = next_event(&mut ws).await else {
            panic!("expected load_messages first");
        };
        assert!(messages.is_empty());

        ws.send(submission_frame("alice", "hello")).await.unwrap();

        let live = next_event(&mut ws).await;
        let ServerEvent::ChatMessage(ChatMessage { username, text, .. }) = live else {
            panic!("expected chat_message");
        };
        assert_eq!(username, "alice");
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_invalid_submission_is_rejected_and_not_broadcast() {
        let relay = Relay::new(&RelayOptions::default());
        let url = serve_ephemeral(relay.clone()).await;

        let (mut sender_ws, _) = connect_async(&url).await.unwrap();
        let (mut watcher_ws, _) = connect_async(&url).await.unwrap();
        let _ = next_event(&mut sender_ws).await;
        let _ = next_event(&mut watcher_ws).await;

        sender_ws
            .send(submission_frame("alice", "   "))
            .await
            .unwrap();

        let response = next_event(&mut sender_ws).await;
        assert!(matches!(response, ServerEvent::Rejected { .. }));
        assert!(relay.history().is_empty());

        // The watcher only sees a valid follow-up, never the rejected one.
        sender_ws
            .send(submission_frame("alice", "real message"))
            .await
            .unwrap();
        let seen = next_event(&mut watcher_ws).await;
        let ServerEvent::ChatMessage(message) = seen else {
            panic!("expected chat_message");
        };
        assert_eq!(message.text, "real message");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_silently() {
        let relay = Relay::new(&RelayOptions::default());
        let url = serve_ephemeral(relay.clone()).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        let _ = next_event(&mut ws).await;

        ws.send(TungsteniteMessage::Text("this is not json".into()))
            .await
            .unwrap();

        // No reply for the garbage frame; the connection stays usable
        // and the next thing on the wire is the valid submission.
        ws.send(submission_frame("alice", "still here")).await.unwrap();
        let live = next_event(&mut ws).await;
        let ServerEvent::ChatMessage(message) = live else {
            panic!("expected chat_message, got {:?}", live);
        };
        assert_eq!(message.text, "still here");
        assert_eq!(relay.history().len(), 1);
    }
}
