//! Transport seam between a session and the synthesis service.
//!
//! A [`Connector`] yields one [`Transport`] per call, already split into a
//! writer half (owned by the uplink) and a reader half (owned by the
//! downlink), so each direction has exactly one user.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use wavecraft_core::types::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer went away (close handshake, reset, or EOF).
    #[error("connection closed")]
    Closed,
    #[error("{0}")]
    Io(String),
}

/// One message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one text message; resolves once the transport accepted it.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Next message, or `None` once the peer has finished sending.
    async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>>;
}

/// A live connection, split by direction.
pub struct Transport {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

/// Establishes transports to resolved endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Transport, TransportError>;
}

// --- WebSocket ---

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Transport, TransportError> {
        debug!(url = endpoint.redacted_url(), "Opening WebSocket");
        let (ws, response) = tokio_tungstenite::connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        Ok(Transport {
            writer: Box::new(WsWriter { sink }),
            reader: Box::new(WsReader { stream }),
        })
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await.map_err(map_ws_error) {
            Err(TransportError::Closed) => Ok(()),
            other => other,
        }
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(TransportMessage::Text(text.as_str().to_owned())));
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(TransportMessage::Binary(bytes.to_vec())));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Peer closed WebSocket");
                    return None;
                }
                // Ping/pong are answered by tungstenite.
                Ok(_) => continue,
                Err(e) => {
                    return match map_ws_error(e) {
                        TransportError::Closed => None,
                        other => Some(Err(other)),
                    };
                }
            }
        }
    }
}

fn map_ws_error(e: tungstenite::Error) -> TransportError {
    use std::io::ErrorKind;
    use tungstenite::error::ProtocolError;

    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::Closed
        }
        tungstenite::Error::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}
