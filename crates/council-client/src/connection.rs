use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use council_core::config::ReconnectConfig;
use council_core::error::{CouncilError, Result};
use council_core::event::{ClientCommand, InboundMessage, ServerFrame};

const OUTBOUND_BUFFER: usize = 32;

/// Lifecycle of the streaming connection.
///
/// `Failed` is terminal: the reconnect budget was exhausted and nothing more
/// will happen until `connect` is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Callback invoked synchronously in the driver task, once per decoded
/// frame, in delivery order.
pub type FrameHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct ConnInner {
    reconnect: ReconnectConfig,
    heartbeat_interval: Duration,
    status_tx: watch::Sender<ConnectionStatus>,
    latest_tx: watch::Sender<Option<InboundMessage>>,
    last_error: Mutex<Option<String>>,
    handler: Mutex<Option<FrameHandler>>,
}

/// Owns the single duplex streaming connection to the orchestration server:
/// connect/reconnect with capped backoff, keep-alive pings, an outbound
/// command sender, and the inbound frame feed.
///
/// Inbound delivery is a "latest message" watch slot plus an optional
/// synchronous frame handler. The slot alone gives no every-message
/// guarantee to slow observers; the handler (used by the event router) is
/// invoked once per frame before the slot is updated, which is what
/// preserves ordering for state mutation.
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
    outbound: Mutex<Option<mpsc::Sender<ClientCommand>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(reconnect: ReconnectConfig, heartbeat_interval: Duration) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (latest_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(ConnInner {
                reconnect,
                heartbeat_interval,
                status_tx,
                latest_tx,
                last_error: Mutex::new(None),
                handler: Mutex::new(None),
            }),
            outbound: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    /// Register the synchronous per-frame handler (at most one).
    pub fn set_handler(&self, handler: FrameHandler) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    /// Open the connection. Idempotent: a no-op while already connecting or
    /// connected.
    pub fn connect(&self, url: &str) {
        {
            let status = *self.inner.status_tx.borrow();
            if matches!(status, ConnectionStatus::Connecting | ConnectionStatus::Connected) {
                debug!(?status, "connect() ignored, connection already open");
                return;
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        *self.outbound.lock().unwrap() = Some(outbound_tx);

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        self.inner.status_tx.send_replace(ConnectionStatus::Connecting);

        let inner = self.inner.clone();
        let url = url.to_string();
        tokio::spawn(run_driver(inner, url, outbound_rx, cancel));
    }

    /// Close the connection client-side. Never triggers reconnection.
    pub fn disconnect(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        *self.outbound.lock().unwrap() = None;
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected);
    }

    /// Send a command over the streaming channel.
    ///
    /// Transmits only while connected; otherwise the command is logged and
    /// dropped — outbound delivery is at-most-once by design, there is no
    /// queueing across disconnects.
    pub fn send(&self, command: ClientCommand) {
        if *self.inner.status_tx.borrow() != ConnectionStatus::Connected {
            warn!("Cannot send command: not connected");
            return;
        }
        let tx = self.outbound.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if tx.try_send(command).is_err() {
                    warn!("Outbound queue unavailable, dropping command");
                }
            }
            None => warn!("Cannot send command: not connected"),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch status transitions (connect/reconnect/failure).
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Observe the most recently received decoded message. A slot, not a
    /// queue: a slow observer may miss intermediate frames.
    pub fn subscribe(&self) -> watch::Receiver<Option<InboundMessage>> {
        self.inner.latest_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Wait until the connection is established, or fail once the reconnect
    /// budget is exhausted.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.status_watch();
        loop {
            match *rx.borrow_and_update() {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Failed => {
                    return Err(CouncilError::ReconnectExhausted {
                        attempts: self.inner.reconnect.max_attempts,
                    })
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(CouncilError::Connection("connection manager gone".into()));
            }
        }
    }
}

enum CloseReason {
    /// `disconnect()` was called; do not reconnect.
    Client,
    /// The server closed or the socket errored; reconnect applies.
    Server,
}

async fn run_driver(
    inner: Arc<ConnInner>,
    url: String,
    mut outbound_rx: mpsc::Receiver<ClientCommand>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        // Cancellation paths never write status: disconnect() already set
        // it, and a fresh connect() may have raced ahead of this task.
        let connect = tokio::select! {
            result = tokio_tungstenite::connect_async(&url) => result,
            _ = cancel.cancelled() => return,
        };

        match connect {
            Ok((stream, _)) => {
                info!(%url, "WebSocket connected");
                inner.status_tx.send_replace(ConnectionStatus::Connected);
                attempt = 0;
                *inner.last_error.lock().unwrap() = None;

                match drive_socket(&inner, stream, &mut outbound_rx, &cancel).await {
                    CloseReason::Client => return,
                    CloseReason::Server => {
                        inner.status_tx.send_replace(ConnectionStatus::Connecting);
                    }
                }
            }
            Err(e) => {
                // Errors record last_error only; status moves on open/close.
                warn!(error = %e, "WebSocket connect failed");
                *inner.last_error.lock().unwrap() = Some(e.to_string());
            }
        }

        attempt += 1;
        if attempt > inner.reconnect.max_attempts {
            error!(
                attempts = attempt - 1,
                "Reconnect attempts exhausted, giving up"
            );
            inner.status_tx.send_replace(ConnectionStatus::Failed);
            return;
        }

        let delay = Duration::from_millis(inner.reconnect.base_delay_ms * attempt as u64);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

async fn drive_socket<S>(
    inner: &ConnInner,
    stream: tokio_tungstenite::WebSocketStream<S>,
    outbound_rx: &mut mpsc::Receiver<ClientCommand>,
    cancel: &CancellationToken,
) -> CloseReason
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = stream.split();
    let mut heartbeat = tokio::time::interval(inner.heartbeat_interval);
    // The first tick of a tokio interval fires immediately; skip it so the
    // heartbeat cadence starts one interval after connect.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                debug!("Client-initiated disconnect");
                return CloseReason::Client;
            }

            cmd = outbound_rx.recv() => {
                let cmd = match cmd {
                    Some(cmd) => cmd,
                    // Sender dropped by disconnect(); treat as client close.
                    None => return CloseReason::Client,
                };
                match serde_json::to_string(&cmd) {
                    Ok(json) => {
                        if let Err(e) = ws_tx.send(WsMessage::Text(json.into())).await {
                            warn!(error = %e, "Failed to send command");
                            *inner.last_error.lock().unwrap() = Some(e.to_string());
                            return CloseReason::Server;
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to serialize command"),
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new().into())).await {
                    warn!(error = %e, "Heartbeat ping failed");
                    *inner.last_error.lock().unwrap() = Some(e.to_string());
                    return CloseReason::Server;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match ServerFrame::decode(&text) {
                            Ok(decoded) => {
                                let handler = inner.handler.lock().unwrap().clone();
                                if let Some(handler) = handler {
                                    handler(&decoded);
                                }
                                inner.latest_tx.send_replace(Some(decoded));
                            }
                            Err(e) => warn!(error = %e, "Discarding malformed frame"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_tx.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        warn!("Server closed connection");
                        return CloseReason::Server;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        *inner.last_error.lock().unwrap() = Some(e.to_string());
                        return CloseReason::Server;
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        return CloseReason::Server;
                    }
                }
            }
        }
    }
}
