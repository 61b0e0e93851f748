//! Agent-side gateway link with auto-reconnect.
//!
//! Connects to the gateway as an agent, streams [`ToAgent`] frames
//! through a [`tokio::sync::broadcast`] channel and forwards queued
//! [`AgentMessage`]s upstream. Reconnection uses exponential backoff
//! with jitter. Telemetry queued while disconnected is sent once the
//! link is back up.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleetlink_api::client::{AgentLink, ReconnectConfig};
//! use fleetlink_api::Handshake;
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let cancel = CancellationToken::new();
//! let url = Url::parse("ws://127.0.0.1:4100/")?;
//! let link = AgentLink::connect(url, Handshake::agent("c1", "b1", "till-1"), ReconnectConfig::default(), cancel.clone());
//! let mut rx = link.subscribe();
//!
//! while let Ok(frame) = rx.recv().await {
//!     println!("{frame:?}");
//! }
//!
//! link.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::handshake::Handshake;
use crate::protocol::{AgentMessage, ToAgent};

// ── Channel capacities ───────────────────────────────────────────────

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── AgentLink ────────────────────────────────────────────────────────

/// Handle to a running agent connection.
///
/// Call [`shutdown`](Self::shutdown) to tear down the background task.
pub struct AgentLink {
    inbound_rx: broadcast::Receiver<Arc<ToAgent>>,
    outbound_tx: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
}

impl AgentLink {
    /// Spawn the connection loop and return immediately.
    ///
    /// The first connection attempt happens asynchronously. Subscribe
    /// before the gateway sends anything you care about.
    pub fn connect(
        gateway: Url,
        handshake: Handshake,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (inbound_tx, inbound_rx) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let url = handshake.apply_to(&gateway);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            link_loop(url, inbound_tx, outbound_rx, reconnect, task_cancel).await;
        });

        Self {
            inbound_rx,
            outbound_tx,
            cancel,
        }
    }

    /// Get a new receiver for gateway frames.
    ///
    /// A consumer that falls behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ToAgent>> {
        self.inbound_rx.resubscribe()
    }

    /// Queue a message for the gateway.
    pub async fn send(&self, message: AgentMessage) -> Result<(), Error> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| Error::WebSocketClosed {
                code: 1001,
                reason: "agent link shut down".into(),
            })
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: connect → pump frames → on error, backoff → reconnect.
async fn link_loop(
    url: Url,
    inbound_tx: broadcast::Sender<Arc<ToAgent>>,
    mut outbound_rx: mpsc::Receiver<AgentMessage>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_pump(&url, &inbound_tx, &mut outbound_rx, &cancel) => result,
        };

        match result {
            // Clean disconnect: reconnect immediately.
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::info!("gateway link closed cleanly, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "gateway link error");

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(max_retries = max, "reconnection limit reached, giving up");
                        break;
                    }
                }

                let delay = calculate_backoff(attempt, &reconnect);
                tracing::info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }

    tracing::debug!("gateway link loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn connect_and_pump(
    url: &Url,
    inbound_tx: &broadcast::Sender<Arc<ToAgent>>,
    outbound_rx: &mut mpsc::Receiver<AgentMessage>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(url = %url, "connecting to gateway");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!("gateway link established");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => parse_and_broadcast(text.as_str(), inbound_tx),
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(cf) => Err(Error::WebSocketClosed {
                                code: u16::from(cf.code),
                                reason: cf.reason.as_str().to_owned(),
                            }),
                            None => Ok(()),
                        };
                    }
                    Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                    None => return Ok(()),
                    Some(Ok(_)) => {}
                }
            }
            message = outbound_rx.recv() => {
                let Some(message) = message else {
                    // Every AgentLink handle dropped.
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                };
                let text = serde_json::to_string(&message)?;
                write
                    .send(Message::text(text))
                    .await
                    .map_err(|e: tungstenite::Error| Error::WebSocketConnect(e.to_string()))?;
            }
        }
    }
}

// ── Message parsing ──────────────────────────────────────────────────

/// Decode a gateway text frame and hand it to subscribers.
fn parse_and_broadcast(text: &str, inbound_tx: &broadcast::Sender<Arc<ToAgent>>) {
    match serde_json::from_str::<ToAgent>(text) {
        Ok(frame) => {
            // No subscribers is fine.
            let _ = inbound_tx.send(Arc::new(frame));
        }
        Err(e) => tracing::debug!(error = %e, "ignoring undecodable gateway frame"),
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms when a gateway
/// restarts under a whole fleet of agents.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
