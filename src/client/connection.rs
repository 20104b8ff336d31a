//! # Connection
//!
//! A [`Connector`] produces one [`Connection`]: a pair of text-frame
//! channels standing in for the socket. Closing of the `incoming` channel
//! means the socket closed.
//!
//! - [`WsConnector`]: WebSocket transport, sends the session cookie on the
//!   upgrade request
//! - [`MemoryConnector`]: in-process transport; every connection attempt
//!   hands the server end to the test driving it
//! - [`Backoff`]: exponential reconnect delay with jitter

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::client::user::SessionCookie;
use crate::shared::config::AppConfig;
use crate::shared::error::SyncError;

/// Frames buffered per direction
const CHANNEL_CAPACITY: usize = 256;

/// An open transport
#[derive(Debug)]
pub struct Connection {
    /// Identifies this attempt in logs
    pub id: Uuid,
    /// Server to client frames; `None` from `recv` means closed
    pub incoming: mpsc::Receiver<String>,
    /// Client to server frames
    pub outgoing: mpsc::Sender<String>,
}

/// Opens transports to the server
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        cookie: Option<SessionCookie>,
    ) -> impl Future<Output = Result<Connection, SyncError>> + Send;
}

/// WebSocket transport
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.server_url.clone())
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        cookie: Option<SessionCookie>,
    ) -> impl Future<Output = Result<Connection, SyncError>> + Send {
        let url = self.url.clone();
        async move {
            let id = Uuid::new_v4();
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| SyncError::transport(format!("bad server URL {}: {}", url, e)))?;
            if let Some(cookie) = cookie {
                let value = HeaderValue::from_str(&cookie.header_value())
                    .map_err(|e| SyncError::transport(format!("bad session cookie: {}", e)))?;
                request.headers_mut().insert(COOKIE, value);
            }

            tracing::info!(connection = %id, url = %url, "Connecting");
            let (stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| SyncError::transport(format!("connect to {} failed: {}", url, e)))?;
            let (mut sink, mut source) = stream.split();

            let (incoming_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);
            let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if incoming_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            tracing::info!(connection = %id, ?frame, "Server closed the socket");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(connection = %id, "Socket read failed: {}", e);
                            break;
                        }
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(text) = outgoing_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!(connection = %id, "Socket write failed: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            Ok(Connection {
                id,
                incoming,
                outgoing,
            })
        }
    }
}

/// Server side of an in-memory connection
#[derive(Debug)]
pub struct ServerEnd {
    pub id: Uuid,
    /// Cookie presented by the client
    pub cookie: Option<SessionCookie>,
    /// Frames the client sent
    pub incoming: mpsc::Receiver<String>,
    /// Frames to deliver to the client; dropping this closes the connection
    pub outgoing: mpsc::Sender<String>,
}

impl ServerEnd {
    pub async fn send(&self, frame: impl Into<String>) -> bool {
        self.outgoing.send(frame.into()).await.is_ok()
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }
}

/// In-process transport for tests and embedding
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryConnector {
    /// The receiver yields the server end of every connection attempt.
    /// Dropping it makes further attempts fail.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accept, accepted) = mpsc::unbounded_channel();
        (Self { accept }, accepted)
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        cookie: Option<SessionCookie>,
    ) -> impl Future<Output = Result<Connection, SyncError>> + Send {
        let accept = self.accept.clone();
        async move {
            let id = Uuid::new_v4();
            let (to_client, incoming) = mpsc::channel(CHANNEL_CAPACITY);
            let (outgoing, from_client) = mpsc::channel(CHANNEL_CAPACITY);
            accept
                .send(ServerEnd {
                    id,
                    cookie,
                    incoming: from_client,
                    outgoing: to_client,
                })
                .map_err(|_| SyncError::transport("in-memory server is gone"))?;
            Ok(Connection {
                id,
                incoming,
                outgoing,
            })
        }
    }
}

/// Exponential reconnect delay with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Fraction of the delay added at random (0.0 to 1.0)
    jitter: f64,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.1,
            attempt: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_max)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt; grows until `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let spread = delay.as_secs_f64() * self.jitter;
        let extra = if spread > 0.0 {
            Duration::from_secs_f64(self.rng.gen_range(0.0..spread))
        } else {
            Duration::ZERO
        };
        (delay + extra).min(self.max)
    }

    /// Back to `base` after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
