//! Downlink pipeline: transport -> inbound frames -> decoded audio queue.

use tracing::{debug, trace, warn};

use wavecraft_core::protocol::InboundFrame;
use wavecraft_core::types::AudioBuffer;

use crate::metrics;
use crate::playback::AudioQueue;
use crate::session::{Activity, SessionError};
use crate::transport::{FrameReader, TransportError, TransportMessage};

/// How the peer finished sending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownlinkEnd {
    /// Explicit `end` control frame.
    #[default]
    EndOfAudio,
    /// The transport was closed by the peer.
    PeerClosed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownlinkOutcome {
    pub end: DownlinkEnd,
    /// Inbound audio frames, including ones that carried nothing playable.
    pub audio_frames: u64,
    pub buffers: u64,
    pub bytes: u64,
    pub decode_drops: u64,
}

/// Read until the peer finishes, queueing every decodable audio payload.
///
/// Undecodable payloads are logged and dropped; everything else that is
/// not an audio or end frame ends the pipeline with an error. The queue is
/// dropped on return, which tells playback no more audio is coming.
pub(crate) async fn run(
    reader: &mut dyn FrameReader,
    queue: AudioQueue,
    activity: &Activity,
) -> Result<DownlinkOutcome, SessionError> {
    let mut outcome = DownlinkOutcome::default();

    loop {
        let message = match reader.next().await {
            None | Some(Err(TransportError::Closed)) => {
                debug!("Peer closed the connection");
                outcome.end = DownlinkEnd::PeerClosed;
                return Ok(outcome);
            }
            Some(Err(e)) => return Err(SessionError::Receive(e.to_string())),
            Some(Ok(message)) => message,
        };
        activity.touch();

        let text = match message {
            TransportMessage::Text(text) => text,
            TransportMessage::Binary(bytes) => {
                return Err(SessionError::Protocol(format!(
                    "unexpected binary message ({} bytes)",
                    bytes.len()
                )));
            }
        };

        match InboundFrame::parse(&text).map_err(|e| SessionError::Protocol(e.to_string()))? {
            InboundFrame::Audio(payload) => {
                let sequence = outcome.audio_frames;
                outcome.audio_frames += 1;

                match payload.decode() {
                    Ok(Some(data)) => {
                        let len = data.len();
                        trace!(sequence, bytes = len, "Queued audio");
                        outcome.buffers += 1;
                        outcome.bytes += len as u64;
                        metrics::record_audio_buffer(len);
                        if !queue.push(AudioBuffer { sequence, data }) {
                            debug!(sequence, "Playback stopped, audio not queued");
                        }
                    }
                    Ok(None) => trace!(sequence, "Audio frame without payload"),
                    Err(e) => {
                        warn!(sequence, error = %e, "Dropping undecodable audio");
                        outcome.decode_drops += 1;
                        metrics::record_decode_drop();
                    }
                }
            }
            InboundFrame::End => {
                debug!(audio_frames = outcome.audio_frames, "End of audio");
                outcome.end = DownlinkEnd::EndOfAudio;
                return Ok(outcome);
            }
            InboundFrame::Error { code, message } => {
                return Err(SessionError::Remote {
                    code,
                    message: message.unwrap_or_else(|| "unspecified error".into()),
                });
            }
        }
    }
}
