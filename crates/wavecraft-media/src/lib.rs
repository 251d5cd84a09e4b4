//! Streaming synthesis sessions.
//!
//! A [`StreamingSession`] owns one connection for one turn and runs two
//! pipelines over it: the uplink forwards text fragments as `text` frames,
//! the downlink decodes inbound audio into the [`PlaybackCoordinator`]'s
//! queue. [`TurnRunner`] ties a session to the control plane.

pub mod downlink;
pub mod memory;
pub mod metrics;
pub mod playback;
pub mod session;
pub mod sink;
pub mod transport;
pub mod turn;
pub mod uplink;

pub use playback::{AudioQueue, PlaybackCoordinator, PlaybackStatus};
pub use session::{SessionError, SessionSummary, StreamingSession};
pub use sink::{AudioSink, FanoutSink, NullSink, PcmWriter, PlaybackError, WavRecorder};
pub use transport::{Connector, Transport, TransportError, WsConnector};
pub use turn::{TurnError, TurnReport, TurnRunner};
