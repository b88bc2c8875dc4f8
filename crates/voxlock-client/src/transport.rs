//! WebSocket driver for the voice gateway.
//!
//! A thin I/O layer: frames in and out travel over channels, a spawned
//! task owns the socket, and the sans-IO [`crate::session::VoiceSession`]
//! never sees it. Reconnects sleep five seconds between attempts and give
//! up after five consecutive tight retries.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::errors::ClientError;

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Consecutive retries closer together than [`TIGHT_RETRY_WINDOW`]
/// tolerated before giving up.
pub const MAX_TIGHT_RETRIES: u32 = 5;

/// Two attempts closer than this count as a tight retry.
pub const TIGHT_RETRY_WINDOW: Duration = Duration::from_secs(3);

/// A frame from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// JSON control frame.
    Text(String),
    /// Binary extension frame.
    Binary(Vec<u8>),
    /// The socket closed, with the close code if one was sent.
    Closed {
        /// WebSocket/voice close code.
        code: Option<u16>,
    },
}

/// A frame for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    /// JSON control frame.
    Text(String),
    /// Binary extension frame.
    Binary(Vec<u8>),
}

/// Handle to a connected gateway socket.
pub struct ConnectedGateway {
    /// Send frames to the server.
    pub to_server: mpsc::Sender<GatewayCommand>,
    /// Receive frames from the server. Ends with [`GatewayEvent::Closed`].
    pub from_server: mpsc::Receiver<GatewayEvent>,
    abort_handle: tokio::task::AbortHandle,
}

impl ConnectedGateway {
    /// Stop the connection task.
    pub fn stop(&self) {
        self.abort_handle.abort();
    }
}

/// Connect to the voice gateway.
pub async fn connect(url: &str) -> Result<ConnectedGateway, ClientError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| ClientError::Gateway(format!("handshake failed: {e}")))?;

    let (to_server_tx, to_server_rx) = mpsc::channel::<GatewayCommand>(32);
    let (from_server_tx, from_server_rx) = mpsc::channel::<GatewayEvent>(32);

    let handle = tokio::spawn(run_connection(stream, to_server_rx, from_server_tx));

    Ok(ConnectedGateway {
        to_server: to_server_tx,
        from_server: from_server_rx,
        abort_handle: handle.abort_handle(),
    })
}

async fn run_connection(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut to_server: mpsc::Receiver<GatewayCommand>,
    from_server: mpsc::Sender<GatewayEvent>,
) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = to_server.recv() => {
                let Some(command) = command else {
                    break;
                };
                let message = match command {
                    GatewayCommand::Text(text) => Message::Text(text),
                    GatewayCommand::Binary(frame) => Message::Binary(frame),
                };
                if let Err(error) = sink.send(message).await {
                    warn!(%error, "gateway send failed");
                    let _ = from_server.send(GatewayEvent::Closed { code: None }).await;
                    break;
                }
            },
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = from_server.send(GatewayEvent::Text(text)).await;
                    },
                    Some(Ok(Message::Binary(frame))) => {
                        let _ = from_server.send(GatewayEvent::Binary(frame)).await;
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|frame| u16::from(frame.code));
                        debug!(?code, "gateway sent close");
                        let _ = from_server.send(GatewayEvent::Closed { code }).await;
                        break;
                    },
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite.
                    },
                    Some(Err(error)) => {
                        warn!(%error, "gateway read failed");
                        let _ = from_server.send(GatewayEvent::Closed { code: None }).await;
                        break;
                    },
                    None => {
                        let _ = from_server.send(GatewayEvent::Closed { code: None }).await;
                        break;
                    },
                }
            },
        }
    }
}

/// Tracks reconnect attempts and enforces the tight-retry cap.
#[derive(Debug)]
pub struct ReconnectPolicy {
    tight_retries: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectPolicy {
    /// Fresh policy with no attempts recorded.
    pub fn new() -> Self {
        Self { tight_retries: 0, last_attempt: None }
    }

    /// Record an attempt at `now`. Returns `false` when the tight-retry
    /// budget is exhausted and the caller must give up.
    ///
    /// An attempt at least [`TIGHT_RETRY_WINDOW`] after the previous one
    /// resets the budget.
    pub fn register_attempt(&mut self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last) if now.duration_since(last) < TIGHT_RETRY_WINDOW => {
                self.tight_retries += 1;
            },
            _ => {
                self.tight_retries = 0;
            },
        }
        self.last_attempt = Some(now);
        self.tight_retries < MAX_TIGHT_RETRIES
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect forever with [`RECONNECT_DELAY`] between attempts, until
/// connected or the tight-retry budget runs out.
pub async fn connect_with_retry(url: &str) -> Result<ConnectedGateway, ClientError> {
    let mut policy = ReconnectPolicy::new();
    loop {
        if !policy.register_attempt(Instant::now()) {
            return Err(ClientError::Gateway("too many tight reconnect attempts".into()));
        }
        match connect(url).await {
            Ok(gateway) => return Ok(gateway),
            Err(error) => {
                warn!(%error, "voice gateway connect failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaced_attempts_never_exhaust() {
        let mut policy = ReconnectPolicy::new();
        let mut now = Instant::now();
        for _ in 0..20 {
            assert!(policy.register_attempt(now));
            now += TIGHT_RETRY_WINDOW;
        }
    }

    #[test]
    fn tight_attempts_exhaust_after_five() {
        let mut policy = ReconnectPolicy::new();
        let now = Instant::now();

        for _ in 0..MAX_TIGHT_RETRIES {
            assert!(policy.register_attempt(now));
        }
        assert!(!policy.register_attempt(now));
    }

    #[test]
    fn spaced_attempt_resets_budget() {
        let mut policy = ReconnectPolicy::new();
        let now = Instant::now();

        for _ in 0..MAX_TIGHT_RETRIES {
            assert!(policy.register_attempt(now));
        }
        // A well-spaced attempt recovers the budget.
        assert!(policy.register_attempt(now + TIGHT_RETRY_WINDOW));
        assert!(policy.register_attempt(now + TIGHT_RETRY_WINDOW));
    }
}
