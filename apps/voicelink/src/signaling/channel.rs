use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};

use super::{ChannelConfig, ChannelError, ChannelEvent, ChannelState, SignalSink};
use crate::telemetry::logging::frame_preview;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const CLOSE_REASON: &str = "agent shutting down";

/// State the socket tasks share with the handle.
struct Shared {
    state: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: mpsc::UnboundedSender<ChannelEvent>,
    /// Bumped on every connect and close; readers of older connections
    /// compare against it and stay silent.
    connection: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                target = "signaling",
                from = ?previous,
                to = ?state,
                "channel state changed"
            );
        }
    }

    fn connection_lost(&self, connection: u64, reason: String) {
        {
            let mut outbound = self.outbound.lock();
            if self.connection.load(Ordering::SeqCst) != connection {
                return;
            }
            outbound.take();
            self.set_state(ChannelState::Disconnected);
        }
        tracing::warn!(
            target = "signaling",
            connection,
            reason = %reason,
            "relay connection lost"
        );
        let _ = self.inbound.send(ChannelEvent::Lost { reason });
    }
}

struct ConnectionTasks {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ConnectionTasks {
    fn abort(self) {
        self.writer.abort();
        self.reader.abort();
    }
}

pub struct SignalingChannel {
    config: ChannelConfig,
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    tasks: Mutex<Option<ConnectionTasks>>,
    /// Serializes connect and close against each other.
    lifecycle: AsyncMutex<()>,
}

impl SignalingChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Shared {
                state,
                outbound: Mutex::new(None),
                inbound,
                connection: AtomicU64::new(0),
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Hands out the inbound event stream. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.inbound_rx.lock().take()
    }

    /// Dials the relay and registers. Calling this on a live channel is a
    /// no-op, so it is safe to retry from a supervisor.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ChannelState::Connected {
            tracing::debug!(target = "signaling", "connect requested while connected");
            return Ok(());
        }
        if let Some(stale) = self.tasks.lock().take() {
            stale.abort();
        }

        self.shared.set_state(ChannelState::Connecting);
        let url = self.config.url.as_str();
        let ws_stream = match connect_async(url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(err) => {
                self.shared.set_state(ChannelState::Disconnected);
                tracing::warn!(target = "signaling", url = %url, error = %err, "relay connect failed");
                return Err(ChannelError::Connect(err.to_string()));
            }
        };
        let (mut ws_write, ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        // registration must be the first frame the relay sees
        send_tx
            .send(Message::Text(self.config.client_id.clone()))
            .map_err(|_| ChannelError::Closed)?;

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    tracing::debug!(target = "signaling", error = %err, "relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let connection = {
            let mut outbound = self.shared.outbound.lock();
            let connection = self.shared.connection.fetch_add(1, Ordering::SeqCst) + 1;
            *outbound = Some(send_tx);
            self.shared.set_state(ChannelState::Connected);
            connection
        };
        let reader = tokio::spawn(read_loop(Arc::clone(&self.shared), ws_read, connection));
        *self.tasks.lock() = Some(ConnectionTasks { writer, reader });

        tracing::info!(
            target = "signaling",
            url = %url,
            client_id = %self.config.client_id,
            connection,
            "registered with relay"
        );
        Ok(())
    }

    /// Sends a normal-closure frame and tears the connection down. No
    /// `Lost` event is produced for a close we asked for.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let send_tx = {
            let mut outbound = self.shared.outbound.lock();
            self.shared.connection.fetch_add(1, Ordering::SeqCst);
            outbound.take()
        };
        let tasks = self.tasks.lock().take();

        if let Some(send_tx) = send_tx {
            self.shared.set_state(ChannelState::Closing);
            let _ = send_tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(CLOSE_REASON),
            })));
            drop(send_tx);
            if let Some(ConnectionTasks { mut writer, reader }) = tasks {
                if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                    .await
                    .is_err()
                {
                    tracing::debug!(target = "signaling", "close frame not flushed in time");
                    writer.abort();
                }
                reader.abort();
            }
            tracing::info!(target = "signaling", "relay connection closed");
        } else if let Some(tasks) = tasks {
            tasks.abort();
        }
        self.shared.set_state(ChannelState::Disconnected);
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, frame: String) -> Result<(), ChannelError> {
        let outbound = self.shared.outbound.lock();
        let send_tx = outbound.as_ref().ok_or(ChannelError::Closed)?;
        tracing::trace!(target = "signaling", event = "ws_out", len = frame.len());
        send_tx
            .send(Message::Text(frame))
            .map_err(|_| ChannelError::Closed)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.abort();
        }
    }
}

async fn read_loop<S>(shared: Arc<Shared>, mut ws_read: S, connection: u64)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => {
                tracing::trace!(
                    target = "signaling",
                    event = "ws_in",
                    kind = "text",
                    len = text.len()
                );
                if shared.inbound.send(ChannelEvent::Frame(text)).is_err() {
                    break "inbound consumer dropped".to_string();
                }
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::trace!(
                    target = "signaling",
                    event = "ws_in",
                    kind = "binary",
                    len = data.len(),
                    preview = %frame_preview(&data),
                    "ignoring binary frame"
                );
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!(
                        "relay closed ({}): {}",
                        u16::from(frame.code),
                        frame.reason
                    ),
                    None => "relay closed".to_string(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "signaling", "relay websocket error: {err}");
                    }
                }
                break err.to_string();
            }
            None => break "relay stream ended".to_string(),
        }
    };
    shared.connection_lost(connection, reason);
}
