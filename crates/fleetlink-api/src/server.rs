//! WebSocket accept loop for the gateway.
//!
//! Accepts TCP connections, validates the handshake during the HTTP
//! upgrade (bad handshakes get a `400` and never become connections),
//! then runs one reader and one writer task per socket. Everything the
//! gateway does with a connection goes through [`ConnectionHandler`],
//! which keeps this crate free of any routing logic.
//!
//! Frames from one socket are delivered to the handler strictly in
//! arrival order; there is no ordering across sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::handshake::{ConnectionId, Handshake};

// ── Outbound frames ──────────────────────────────────────────────────

/// A frame queued for delivery to one connection.
///
/// Text is pre-encoded and shared so a broadcast serializes once.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Arc<str>),
    Close,
}

// ── ConnectionHandler ────────────────────────────────────────────────

/// Callbacks from the transport into whoever owns connection state.
///
/// All methods are synchronous and must not block: they run on the
/// connection's reader task.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A peer completed the upgrade. `outbound` feeds its writer task.
    fn on_open(&self, id: ConnectionId, handshake: Handshake, outbound: mpsc::Sender<Outbound>);

    /// A text frame arrived from the peer.
    fn on_frame(&self, id: ConnectionId, text: &str);

    /// The socket is gone (close frame, error or server shutdown).
    fn on_close(&self, id: ConnectionId);
}

// ── ServerConfig ─────────────────────────────────────────────────────

/// Tuning for the accept loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-connection outbound queue depth. Default: 256 frames.
    pub outbound_buffer: usize,
    /// Largest accepted inbound frame in bytes. Default: 1 MiB.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

// ── Accept loop ──────────────────────────────────────────────────────

/// Accept connections until `cancel` fires.
///
/// Connection tasks observe the same token, so cancelling shuts every
/// socket down with a close frame.
pub async fn serve<H: ConnectionHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "gateway listening");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        let config = config.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(stream, peer, handler, config, cancel).await {
                                tracing::debug!(peer = %peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        // Typically EMFILE; keep serving existing sockets.
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    tracing::info!(addr = %local, "gateway listener stopped");
    Ok(())
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn handle_socket<H: ConnectionHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut handshake: Option<Handshake> = None;

    let ws_config = tungstenite::protocol::WebSocketConfig::default()
        .max_frame_size(Some(config.max_frame_bytes))
        .max_message_size(Some(config.max_frame_bytes));

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match Handshake::from_query(request.uri().query()) {
            Ok(hs) => {
                handshake = Some(hs);
                Ok(response)
            }
            Err(e) => {
                tracing::info!(peer = %peer, error = %e, "rejecting handshake");
                let mut rejection = ErrorResponse::new(Some(e.to_string()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    let Some(handshake) = handshake else {
        return Err(Error::InvalidHandshake {
            reason: "upgrade completed without a handshake".into(),
        });
    };

    let id = ConnectionId::new();
    tracing::debug!(peer = %peer, connection = %id, role = %handshake.role, "connection accepted");

    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(config.outbound_buffer);

    handler.on_open(id, handshake, out_tx);

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = writer_cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                frame = out_rx.recv() => {
                    match frame {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = write.send(Message::text(text.to_string())).await {
                                tracing::debug!(connection = %id, error = %e, "write failed");
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handler.on_frame(id, text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::debug!(connection = %id, code = %cf.code, reason = %cf.reason, "close frame received");
                        }
                        break Ok(());
                    }
                    Some(Ok(_)) => {
                        // Binary and control frames carry nothing for us;
                        // tungstenite answers pings itself.
                    }
                    Some(Err(e)) => break Err(Error::WebSocketConnect(e.to_string())),
                    None => break Ok(()),
                }
            }
        }
    };

    handler.on_close(id);
    cancel.cancel();
    let _ = writer.await;
    tracing::debug!(connection = %id, "connection closed");

    result
}
