//! HTTP surface: the landing page and the websocket signaling endpoint

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use fanout_sfu::{
    MediaEngine, RtcEngine, SfuManager, SignalError, SignalMessage, SignalReceiver, SignalSender,
};
use futures::{stream::SplitStream, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;

const INDEX_HTML: &str = include_str!("assets/index.html");
const WEBSOCKET_URL_PLACEHOLDER: &str = "{{WEBSOCKET_URL}}";
const MAX_MESSAGE_SIZE: usize = 64 * 1024;
const OUTBOUND_QUEUE_CAPACITY: usize = 1000;

pub struct FanoutServer {
    config: Config,
    manager: Arc<SfuManager<RtcEngine>>,
}

impl FanoutServer {
    #[must_use]
    pub const fn new(config: Config, manager: Arc<SfuManager<RtcEngine>>) -> Self {
        Self { config, manager }
    }

    /// Serve until a shutdown signal arrives, then tear every session down
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Fanout server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let keyframes = CancellationToken::new();
        let keyframe_task = self.manager.spawn_keyframe_task(keyframes.clone());
        info!(
            interval_secs = self.config.sfu.keyframe_interval_secs,
            "Keyframe dispatcher started"
        );

        let http_handle = self.start_http_server(shutdown_rx).await?;

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown(keyframes, keyframe_task).await;

        Ok(())
    }

    async fn shutdown(&self, keyframes: CancellationToken, keyframe_task: JoinHandle<()>) {
        info!("Shutting down Fanout server...");

        keyframes.cancel();
        if let Err(e) = keyframe_task.await {
            warn!("Keyframe task ended abnormally: {}", e);
        }

        let stats = self.manager.stats().await;
        info!(
            sessions = stats.sessions,
            streams = stats.streams,
            "Closing remaining sessions"
        );
        self.manager.shutdown().await;

        info!("Fanout server shut down");
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let http_router = router(Arc::clone(&self.manager));

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Build the HTTP router for a manager
pub fn router<E: MediaEngine>(manager: Arc<SfuManager<E>>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/websocket", get(websocket_handler::<E>))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn index(headers: HeaderMap) -> Html<String> {
    Html(INDEX_HTML.replace(WEBSOCKET_URL_PLACEHOLDER, &websocket_url(&headers)))
}

/// `ws://<Host>/websocket`, falling back to localhost when the header is
/// missing or carries characters that do not belong in an authority
fn websocket_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| {
            !host.is_empty()
                && host
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'))
        })
        .unwrap_or("localhost");

    format!("ws://{host}/websocket")
}

async fn websocket_handler<E: MediaEngine>(
    State(manager): State<Arc<SfuManager<E>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket<E: MediaEngine>(socket: WebSocket, manager: Arc<SfuManager<E>>) {
    let (mut ws_sink, ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);

    // Writer task; ends after a close frame or once every sender is gone
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_sink.send(message).await {
                debug!("WebSocket write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let signal: Arc<dyn SignalSender> = Arc::new(WebSocketSignal::new(tx));
    let receiver = WebSocketReceiver { receiver: ws_stream };

    if let Err(e) = manager.serve_session(signal, receiver).await {
        warn!("WebSocket session ended with error: {}", e);
    }
}

/// Outbound half of a websocket signaling channel
struct WebSocketSignal {
    sender: mpsc::Sender<Message>,
}

impl WebSocketSignal {
    const fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl SignalSender for WebSocketSignal {
    async fn send(&self, message: &SignalMessage) -> Result<(), SignalError> {
        let text = message.encode()?;

        // Never wait on a slow client; a full queue fails this send instead
        self.sender
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SignalError::Transport(
                    "Channel full: WebSocket client too slow to consume messages".to_string(),
                ),
                mpsc::error::TrySendError::Closed(_) => SignalError::Closed,
            })
    }

    async fn close(&self) {
        let _ = self.sender.try_send(Message::Close(None));
    }
}

/// Inbound half of a websocket signaling channel
struct WebSocketReceiver {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl SignalReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Option<Result<String, SignalError>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(SignalError::Transport(format!("WebSocket error: {e}"))));
                }
                // Ping/pong are answered by the socket; binary frames carry no envelopes
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
