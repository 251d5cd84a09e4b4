//! In-process transport: a connector paired with a scriptable peer.
//!
//! Used to drive sessions deterministically in tests and demos without a
//! network. The outbound direction is a bounded channel, so a peer that stops
//! reading applies backpressure to the uplink exactly like a slow socket.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use wavecraft_core::protocol::{OutboundFrame, audio_frame_json};
use wavecraft_core::types::Endpoint;

use crate::transport::{
    Connector, FrameReader, FrameWriter, Transport, TransportError, TransportMessage,
};

const DEFAULT_CAPACITY: usize = 64;

/// Create a connected (connector, peer) pair.
pub fn pair() -> (MemoryConnector, MemoryPeer) {
    pair_with_capacity(DEFAULT_CAPACITY)
}

/// Like [`pair`], with at most `capacity` unread outbound frames in flight.
pub fn pair_with_capacity(capacity: usize) -> (MemoryConnector, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let transport = Transport {
        writer: Box::new(MemoryWriter { tx: Some(out_tx) }),
        reader: Box::new(MemoryReader { rx: in_rx }),
    };

    (
        MemoryConnector {
            transport: Mutex::new(Some(transport)),
        },
        MemoryPeer {
            outbound: out_rx,
            inbound: Some(in_tx),
        },
    )
}

/// Hands out its single transport once; later connects fail.
pub struct MemoryConnector {
    transport: Mutex<Option<Transport>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Transport, TransportError> {
        self.transport
            .lock()
            .map_err(|_| TransportError::Io("memory transport poisoned".into()))?
            .take()
            .ok_or_else(|| TransportError::Io("memory transport already connected".into()))
    }
}

struct MemoryWriter {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(text).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<TransportMessage>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn next(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// The service side of an in-memory connection.
pub struct MemoryPeer {
    outbound: mpsc::Receiver<String>,
    inbound: Option<mpsc::UnboundedSender<TransportMessage>>,
}

impl MemoryPeer {
    /// Next raw frame the client sent, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next client frame, parsed.
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// A frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(TransportMessage::Text(text.into()))
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.push(TransportMessage::Binary(bytes))
    }

    /// Send an audio frame carrying `bytes`.
    pub fn send_audio(&self, bytes: &[u8]) -> bool {
        self.send_text(audio_frame_json(bytes))
    }

    /// Send the end-of-audio control frame.
    pub fn send_end(&self) -> bool {
        self.send_text(r#"{"type":"end"}"#)
    }

    /// Stop sending: the client's reader observes the peer finishing.
    pub fn finish(&mut self) {
        self.inbound = None;
    }

    /// Drop the connection in both directions.
    pub fn disconnect(self) {}

    fn push(&self, message: TransportMessage) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            session_id: "mem".into(),
            url: "ws://memory".into(),
            parameters: Default::default(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_connects_only_once() {
        let (connector, _peer) = pair();
        assert!(connector.connect(&endpoint()).await.is_ok());
        assert!(connector.connect(&endpoint()).await.is_err());
    }

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let (connector, mut peer) = pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();

        transport.writer.send("hi".into()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hi"));

        assert!(peer.send_text("yo"));
        assert_eq!(
            transport.reader.next().await,
            Some(Ok(TransportMessage::Text("yo".into())))
        );

        peer.finish();
        assert_eq!(transport.reader.next().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_fails_writes() {
        let (connector, peer) = pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();
        peer.disconnect();
        assert_eq!(
            transport.writer.send("late".into()).await,
            Err(TransportError::Closed)
        );
        assert_eq!(transport.reader.next().await, None);
    }

    #[tokio::test]
    async fn test_writer_close_is_seen_by_peer() {
        let (connector, mut peer) = pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();
        transport.writer.close().await.unwrap();
        assert_eq!(peer.recv().await, None);
    }
}
