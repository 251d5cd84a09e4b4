//! Uplink pipeline: text producer -> `text` frames -> transport.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, trace};

use wavecraft_core::protocol::OutboundFrame;

use crate::metrics;
use crate::session::{Activity, SessionError};
use crate::transport::FrameWriter;

/// What the uplink sent before finishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkOutcome {
    pub fragments_sent: u64,
    /// All fragments, concatenated in order.
    pub text: String,
}

/// Forward every fragment as a text frame, then send exactly one end frame.
///
/// Each transmit is awaited before the next fragment is pulled, so transport
/// backpressure stalls the producer instead of buffering or dropping.
/// `end_sent` is raised as soon as the end frame has been accepted.
pub(crate) async fn run(
    mut source: BoxStream<'static, anyhow::Result<String>>,
    writer: &mut dyn FrameWriter,
    activity: &Activity,
    end_sent: &AtomicBool,
) -> Result<UplinkOutcome, SessionError> {
    let mut outcome = UplinkOutcome::default();

    while let Some(item) = source.next().await {
        let content = item.map_err(|e| SessionError::Source(format!("{e:#}")))?;
        let sequence = outcome.fragments_sent;
        outcome.text.push_str(&content);

        let frame = OutboundFrame::Text { content, sequence };
        writer
            .send(frame.to_json())
            .await
            .map_err(|e| SessionError::Transmit(e.to_string()))?;

        trace!(sequence, "Sent text frame");
        outcome.fragments_sent += 1;
        activity.touch();
        metrics::record_frame_sent();
    }

    writer
        .send(OutboundFrame::End.to_json())
        .await
        .map_err(|e| SessionError::Transmit(e.to_string()))?;
    end_sent.store(true, Ordering::SeqCst);
    activity.touch();
    metrics::record_frame_sent();

    debug!(fragments = outcome.fragments_sent, "Text stream complete");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::transport::Connector;
    use wavecraft_core::types::Endpoint;

    fn endpoint() -> Endpoint {
        Endpoint {
            session_id: "up".into(),
            url: "ws://memory".into(),
            parameters: Default::default(),
            expires_at: None,
        }
    }

    fn fragments(items: Vec<anyhow::Result<String>>) -> BoxStream<'static, anyhow::Result<String>> {
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_sends_ordered_frames_then_end() {
        let (connector, mut peer) = memory::pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();
        let (activity, _rx) = Activity::new();
        let end_sent = AtomicBool::new(false);

        let source = fragments(vec![Ok("a".into()), Ok("b".into()), Ok("c".into())]);
        let outcome = run(source, transport.writer.as_mut(), &activity, &end_sent)
            .await
            .unwrap();

        assert_eq!(outcome.fragments_sent, 3);
        assert_eq!(outcome.text, "abc");
        assert!(end_sent.load(Ordering::SeqCst));

        for (i, expected) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(
                peer.recv_frame().await,
                Some(OutboundFrame::Text {
                    content: expected.to_string(),
                    sequence: i as u64,
                })
            );
        }
        assert_eq!(peer.recv_frame().await, Some(OutboundFrame::End));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_empty_source_sends_only_end() {
        let (connector, mut peer) = memory::pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();
        let (activity, _rx) = Activity::new();
        let end_sent = AtomicBool::new(false);

        let outcome = run(fragments(vec![]), transport.writer.as_mut(), &activity, &end_sent)
            .await
            .unwrap();
        assert_eq!(outcome.fragments_sent, 0);
        assert_eq!(peer.recv_frame().await, Some(OutboundFrame::End));
    }

    #[tokio::test]
    async fn test_source_error_stops_without_end_frame() {
        let (connector, mut peer) = memory::pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();
        let (activity, _rx) = Activity::new();
        let end_sent = AtomicBool::new(false);

        let source = fragments(vec![Ok("a".into()), Err(anyhow::anyhow!("model crashed"))]);
        let err = run(source, transport.writer.as_mut(), &activity, &end_sent)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Source(ref msg) if msg.contains("model crashed")));
        assert!(!end_sent.load(Ordering::SeqCst));
        assert!(matches!(peer.recv_frame().await, Some(OutboundFrame::Text { .. })));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_transport_is_transmit_error() {
        let (connector, peer) = memory::pair();
        let mut transport = connector.connect(&endpoint()).await.ok().unwrap();
        peer.disconnect();
        let (activity, _rx) = Activity::new();
        let end_sent = AtomicBool::new(false);

        let err = run(fragments(vec![Ok("a".into())]), transport.writer.as_mut(), &activity, &end_sent)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Transmit("connection closed".into()));
    }
}
