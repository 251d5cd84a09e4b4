//! Per-turn orchestration: resolve -> session -> drain -> close -> settle.

use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use wavecraft_control::{EndpointResolver, ResolutionError, TurnSettlement};
use wavecraft_core::config::{AudioConfig, SessionConfig};
use wavecraft_core::types::{ErrorKind, TurnId};

use crate::session::{SessionError, StreamingSession};
use crate::sink::{AudioSink, FanoutSink, WavRecorder};
use crate::transport::Connector;

/// A failed turn. Reported once, never retried.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("turn {turn_id}: {source}")]
    Resolution {
        turn_id: TurnId,
        #[source]
        source: ResolutionError,
    },

    #[error("turn {turn_id} (session {session_id}): {source}")]
    Session {
        turn_id: TurnId,
        session_id: String,
        #[source]
        source: SessionError,
    },
}

impl TurnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Session { source, .. } => source.kind(),
        }
    }

    pub fn turn_id(&self) -> TurnId {
        match self {
            Self::Resolution { turn_id, .. } | Self::Session { turn_id, .. } => *turn_id,
        }
    }
}

/// Outcome of a completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub session_id: String,
    /// Everything sent to the service, in order.
    pub text: String,
    pub fragments_sent: u64,
    pub audio_buffers: u64,
    pub audio_bytes: u64,
    pub decode_drops: u64,
    pub playback_error: Option<String>,
}

/// Runs turns: every turn resolves a fresh endpoint and opens its own session.
pub struct TurnRunner {
    resolver: Arc<dyn EndpointResolver>,
    settlement: Option<Arc<dyn TurnSettlement>>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    recording: Option<(PathBuf, AudioConfig)>,
}

impl TurnRunner {
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        Self {
            resolver,
            settlement: None,
            connector,
            config,
            recording: None,
        }
    }

    /// Report each turn's outcome to the control plane.
    pub fn with_settlement(mut self, settlement: Arc<dyn TurnSettlement>) -> Self {
        self.settlement = Some(settlement);
        self
    }

    /// Also save every turn's audio as a WAV file in `dir`.
    pub fn with_recording(mut self, dir: impl Into<PathBuf>, format: AudioConfig) -> Self {
        self.recording = Some((dir.into(), format));
        self
    }

    /// Run one turn: stream `source` to a freshly resolved endpoint and play
    /// the returned audio on `sink`.
    pub async fn run_turn<S>(
        &self,
        intent: &str,
        source: S,
        sink: Box<dyn AudioSink>,
    ) -> Result<TurnReport, TurnError>
    where
        S: Stream<Item = anyhow::Result<String>> + Send + 'static,
    {
        let turn_id = TurnId::new();

        let endpoint = match self.resolver.resolve(intent).await {
            Ok(endpoint) => endpoint,
            Err(source) => {
                let err = TurnError::Resolution { turn_id, source };
                error!(turn_id = %turn_id, kind = %err.kind(), error = %err, "Turn failed");
                return Err(err);
            }
        };
        let session_id = endpoint.session_id.clone();
        info!(turn_id = %turn_id, session_id = %session_id, "Turn started");

        let sink: Box<dyn AudioSink> = match &self.recording {
            Some((dir, format)) => Box::new(FanoutSink::new(vec![
                sink,
                Box::new(WavRecorder::new(dir.clone(), session_id.clone(), format.clone())),
            ])),
            None => sink,
        };

        let mut session = StreamingSession::new(turn_id, endpoint, self.config.clone());
        let result = match session.open(self.connector.as_ref(), source, sink).await {
            Ok(()) => session.drain().await,
            Err(e) => Err(e),
        };
        session.close().await;

        match result {
            Ok(summary) => {
                self.confirm(&session_id, true, summary.text.chars().count()).await;
                info!(
                    turn_id = %turn_id,
                    session_id = %session_id,
                    fragments = summary.fragments_sent,
                    audio_buffers = summary.audio_buffers,
                    "Turn complete"
                );
                Ok(TurnReport {
                    turn_id,
                    session_id,
                    text: summary.text,
                    fragments_sent: summary.fragments_sent,
                    audio_buffers: summary.audio_buffers,
                    audio_bytes: summary.audio_bytes,
                    decode_drops: summary.decode_drops,
                    playback_error: summary.playback_error,
                })
            }
            Err(source) => {
                // A turn that never reached the service is cancelled, not confirmed.
                if source.kind() == ErrorKind::Connect {
                    self.cancel(&session_id).await;
                } else {
                    self.confirm(&session_id, false, 0).await;
                }
                let err = TurnError::Session {
                    turn_id,
                    session_id,
                    source,
                };
                error!(turn_id = %turn_id, kind = %err.kind(), error = %err, "Turn failed");
                Err(err)
            }
        }
    }

    async fn confirm(&self, session_id: &str, success: bool, text_len: usize) {
        let Some(settlement) = &self.settlement else {
            return;
        };
        if let Err(e) = settlement.confirm(session_id, success, text_len).await {
            warn!(session_id, error = %e, "Turn confirmation failed");
        }
    }

    async fn cancel(&self, session_id: &str) {
        let Some(settlement) = &self.settlement else {
            return;
        };
        if let Err(e) = settlement.cancel(session_id).await {
            warn!(session_id, error = %e, "Turn cancellation failed");
        }
    }
}
