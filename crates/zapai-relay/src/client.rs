// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One framed connection to one relay.
//!
//! The supervisor only sees [`RelayTransport`] and [`RelayLink`]; the
//! production implementation speaks JSON text frames over WebSocket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

use zapai_proto::{ClientFrame, RelayFrame};

use crate::error::RelayError;

/// Factory for relay connections.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayLink>, RelayError>;
}

/// A live framed connection.  `recv` surfaces remote close as
/// [`RelayError::Closed`] so the caller's loop can tear down and reconnect.
#[async_trait]
pub trait RelayLink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), RelayError>;
    async fn recv(&mut self) -> Result<RelayFrame, RelayError>;
}

/// WebSocket transport (wss:// and ws:// URLs).
#[derive(Default)]
pub struct WsTransport;

#[async_trait]
impl RelayTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayLink>, RelayError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RelayLink for WsLink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), RelayError> {
        self.ws
            .send(Message::Text(frame.to_json()))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<RelayFrame, RelayError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    match RelayFrame::parse(&text) {
                        Ok(frame) => return Ok(frame),
                        // A single bad frame is not worth a reconnect.
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping unparseable relay frame");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(RelayError::Closed(reason));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RelayError::Transport(e.to_string())),
                None => return Err(RelayError::Closed("stream ended".into())),
            }
        }
    }
}
