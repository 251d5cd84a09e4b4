//! Streaming session: one connection, one turn.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Draining -> Closed
//!             \              \           \
//!              +--------------+-----------+--> Failed
//! ```
//!
//! `open` connects and spawns the uplink, downlink and playback tasks.
//! `drain` supervises them until the end frame is sent, the peer has
//! finished, and playback is idle. Any pipeline error fails the session and
//! tears everything down at once. A session is never reopened; the next
//! turn builds a new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wavecraft_core::config::SessionConfig;
use wavecraft_core::types::{Endpoint, ErrorKind, SessionState, TurnId};

use crate::downlink::{self, DownlinkEnd, DownlinkOutcome};
use crate::metrics;
use crate::playback::{AudioQueue, PlaybackCoordinator, PlaybackStatus};
use crate::sink::AudioSink;
use crate::transport::{Connector, FrameReader, FrameWriter, Transport};
use crate::uplink::{self, UplinkOutcome};

/// Terminal session failure. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transmit failed: {0}")]
    Transmit(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("service error (code {code:?}): {message}")]
    Remote { code: Option<i64>, message: String },

    #[error("no activity for {0:?}")]
    Timeout(Duration),

    #[error("text source failed: {0}")]
    Source(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) => ErrorKind::Connect,
            Self::Transmit(_) => ErrorKind::Transmit,
            Self::Receive(_) => ErrorKind::Receive,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Source(_) => ErrorKind::Source,
        }
    }
}

/// Progress signal shared by the pipelines; every touch resets the idle timer.
#[derive(Clone)]
pub(crate) struct Activity(Arc<watch::Sender<u64>>);

impl Activity {
    pub(crate) fn new() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self(Arc::new(tx)), rx)
    }

    pub(crate) fn touch(&self) {
        self.0.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// What a completed session did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub turn_id: String,
    pub session_id: String,
    pub fragments_sent: u64,
    pub text: String,
    pub audio_frames: u64,
    pub audio_buffers: u64,
    pub audio_bytes: u64,
    pub decode_drops: u64,
    pub rendered_buffers: u64,
    pub playback_error: Option<String>,
}

enum PipelineEvent {
    /// The uplink hands its writer back so teardown can close it.
    /// `None` means the pipeline was cancelled.
    Uplink {
        writer: Box<dyn FrameWriter>,
        result: Option<Result<UplinkOutcome, SessionError>>,
    },
    Downlink(Option<Result<DownlinkOutcome, SessionError>>),
}

enum Step {
    Event(Option<PipelineEvent>),
    PlaybackIdle,
    Activity,
    ActivityClosed,
    PlaybackClosed,
    Timeout,
}

struct Running {
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    uplink: Option<JoinHandle<()>>,
    downlink: Option<JoinHandle<()>>,
    playback: PlaybackCoordinator,
    activity: watch::Receiver<u64>,
    playback_status: watch::Receiver<PlaybackStatus>,
    end_sent: Arc<AtomicBool>,
    writer: Option<Box<dyn FrameWriter>>,
    uplink_done: Option<UplinkOutcome>,
    downlink_done: Option<DownlinkOutcome>,
}

/// One turn's connection and the pipelines running over it.
pub struct StreamingSession {
    turn_id: TurnId,
    endpoint: Endpoint,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    running: Option<Running>,
    connected: bool,
    failure: Option<SessionError>,
    summary: Option<SessionSummary>,
}

impl StreamingSession {
    pub fn new(turn_id: TurnId, endpoint: Endpoint, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            turn_id,
            endpoint,
            config,
            state,
            cancel: CancellationToken::new(),
            running: None,
            connected: false,
            failure: None,
            summary: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The error that failed the session, if any.
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    /// Connect and start streaming `source` to the service, playing received
    /// audio on `sink`. Only valid on a fresh session.
    pub async fn open<S>(
        &mut self,
        connector: &dyn Connector,
        source: S,
        sink: Box<dyn AudioSink>,
    ) -> Result<(), SessionError>
    where
        S: Stream<Item = anyhow::Result<String>> + Send + 'static,
    {
        if self.state() != SessionState::Idle {
            return Err(SessionError::Connect(format!(
                "session is {}, a session is opened only once",
                self.state()
            )));
        }

        self.set_state(SessionState::Connecting);
        debug!(
            turn_id = %self.turn_id,
            session_id = %self.endpoint.session_id,
            url = self.endpoint.redacted_url(),
            "Connecting"
        );

        let timeout = self.config.connect_timeout();
        let transport = match tokio::time::timeout(timeout, connector.connect(&self.endpoint)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(self.fail(SessionError::Connect(e.to_string())).await),
            Err(_) => {
                let err = SessionError::Connect(format!("no connection within {timeout:?}"));
                return Err(self.fail(err).await);
            }
        };
        self.connected = true;
        metrics::record_session_open();

        let Transport { writer, reader } = transport;
        let (activity, activity_rx) = Activity::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback, queue) = PlaybackCoordinator::start(sink, self.cancel.child_token());
        let playback_status = playback.subscribe();
        let end_sent = Arc::new(AtomicBool::new(false));

        self.set_state(SessionState::Streaming);

        let downlink = tokio::spawn(downlink_task(
            reader,
            queue,
            activity.clone(),
            self.cancel.clone(),
            events_tx.clone(),
        ));
        let uplink = tokio::spawn(uplink_task(
            source.boxed(),
            writer,
            activity,
            end_sent.clone(),
            self.cancel.clone(),
            events_tx,
        ));

        self.running = Some(Running {
            events: events_rx,
            uplink: Some(uplink),
            downlink: Some(downlink),
            playback,
            activity: activity_rx,
            playback_status,
            end_sent,
            writer: None,
            uplink_done: None,
            downlink_done: None,
        });

        info!(
            turn_id = %self.turn_id,
            session_id = %self.endpoint.session_id,
            "Session streaming"
        );
        Ok(())
    }

    /// Run the session to completion: text fully sent, peer finished, and
    /// playback idle. Returns what the session did, or the error that
    /// failed it.
    pub async fn drain(&mut self) -> Result<SessionSummary, SessionError> {
        match self.state() {
            SessionState::Streaming | SessionState::Draining => {}
            SessionState::Closed => {
                return self
                    .summary
                    .clone()
                    .ok_or_else(|| SessionError::Connect("session closed before it was drained".into()));
            }
            SessionState::Failed => {
                return Err(self
                    .failure
                    .clone()
                    .unwrap_or_else(|| SessionError::Connect("session failed".into())));
            }
            other => return Err(SessionError::Connect(format!("session is {other}, not open"))),
        }

        let idle = self.config.idle_timeout();
        let mut deadline = Instant::now() + idle;
        let mut activity_open = true;
        let mut playback_open = true;

        loop {
            let Some(running) = self.running.as_mut() else {
                return Err(SessionError::Connect("session is not running".into()));
            };
            let pipelines_done = running.uplink_done.is_some() && running.downlink_done.is_some();

            let step = tokio::select! {
                event = running.events.recv(), if !pipelines_done => Step::Event(event),
                _ = running.playback.wait_until_idle(), if pipelines_done => Step::PlaybackIdle,
                changed = running.activity.changed(), if activity_open => match changed {
                    Ok(()) => Step::Activity,
                    Err(_) => Step::ActivityClosed,
                },
                changed = running.playback_status.changed(), if playback_open => match changed {
                    Ok(()) => Step::Activity,
                    Err(_) => Step::PlaybackClosed,
                },
                _ = tokio::time::sleep_until(deadline) => Step::Timeout,
            };

            match step {
                Step::Activity => deadline = Instant::now() + idle,
                Step::ActivityClosed => activity_open = false,
                Step::PlaybackClosed => playback_open = false,
                Step::Timeout => return Err(self.fail(SessionError::Timeout(idle)).await),
                Step::PlaybackIdle => return self.complete().await,
                Step::Event(None) => {
                    let err = SessionError::Receive("pipeline task ended unexpectedly".into());
                    return Err(self.fail(err).await);
                }
                Step::Event(Some(event)) => {
                    deadline = Instant::now() + idle;
                    if let Err(e) = self.on_event(event) {
                        return Err(self.fail(e).await);
                    }
                }
            }
        }
    }

    /// Cancel both pipelines and release the transport. A no-op once the
    /// session is `Closed` or `Failed`.
    pub async fn close(&mut self) {
        match self.state() {
            SessionState::Closed | SessionState::Failed => return,
            SessionState::Idle => {
                self.set_state(SessionState::Closed);
                return;
            }
            _ => {}
        }
        debug!(turn_id = %self.turn_id, state = %self.state(), "Closing session");
        self.teardown().await;
        self.set_state(SessionState::Closed);
        info!(turn_id = %self.turn_id, session_id = %self.endpoint.session_id, "Session closed");
    }

    fn on_event(&mut self, event: PipelineEvent) -> Result<(), SessionError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };

        match event {
            PipelineEvent::Uplink { writer, result } => {
                running.writer = Some(writer);
                match result {
                    Some(Ok(outcome)) => {
                        debug!(
                            turn_id = %self.turn_id,
                            fragments = outcome.fragments_sent,
                            "Uplink finished, draining"
                        );
                        running.uplink_done = Some(outcome);
                        self.state.send_replace(SessionState::Draining);
                    }
                    Some(Err(e)) => return Err(e),
                    None => debug!("Uplink cancelled"),
                }
            }
            PipelineEvent::Downlink(result) => match result {
                Some(Ok(outcome)) => {
                    let mid_stream = outcome.end == DownlinkEnd::PeerClosed
                        && !running.end_sent.load(Ordering::SeqCst);
                    if mid_stream {
                        return Err(SessionError::Transmit(
                            "connection closed by peer before text stream completed".into(),
                        ));
                    }
                    running.downlink_done = Some(outcome);
                }
                Some(Err(e)) => return Err(e),
                None => debug!("Downlink cancelled"),
            },
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<SessionSummary, SessionError> {
        let grace = self.config.close_grace();
        let mut summary = SessionSummary {
            turn_id: self.turn_id.to_string(),
            session_id: self.endpoint.session_id.clone(),
            ..Default::default()
        };

        if let Some(running) = self.running.as_mut() {
            // Lets the sink finish (e.g. flush a recording) before teardown cancels it.
            running.playback.join(grace).await;

            if let Some(up) = running.uplink_done.take() {
                summary.fragments_sent = up.fragments_sent;
                summary.text = up.text;
            }
            if let Some(down) = running.downlink_done.take() {
                summary.audio_frames = down.audio_frames;
                summary.audio_buffers = down.buffers;
                summary.audio_bytes = down.bytes;
                summary.decode_drops = down.decode_drops;
            }
            let status = running.playback.status();
            summary.rendered_buffers = status.rendered;
            summary.playback_error = status.failed;
        }

        self.teardown().await;
        self.set_state(SessionState::Closed);
        info!(
            turn_id = %self.turn_id,
            session_id = %self.endpoint.session_id,
            fragments = summary.fragments_sent,
            audio_buffers = summary.audio_buffers,
            bytes = summary.audio_bytes,
            "Session closed"
        );
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    async fn fail(&mut self, err: SessionError) -> SessionError {
        warn!(
            turn_id = %self.turn_id,
            session_id = %self.endpoint.session_id,
            kind = %err.kind(),
            error = %err,
            "Session failed"
        );
        self.set_state(SessionState::Failed);
        self.teardown().await;
        metrics::record_session_failure(err.kind().as_str());
        self.failure = Some(err.clone());
        err
    }

    /// Cancel everything, waiting at most `close_grace` per task.
    async fn teardown(&mut self) {
        self.cancel.cancel();
        let Some(mut running) = self.running.take() else {
            self.release();
            return;
        };
        let grace = self.config.close_grace();

        if let Some(handle) = running.uplink.take() {
            join_with_grace(handle, grace, "uplink").await;
        }
        if let Some(handle) = running.downlink.take() {
            join_with_grace(handle, grace, "downlink").await;
        }

        while let Ok(event) = running.events.try_recv() {
            if let PipelineEvent::Uplink { writer, .. } = event {
                running.writer = Some(writer);
            }
        }
        if let Some(mut writer) = running.writer.take() {
            match tokio::time::timeout(grace, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Transport close failed"),
                Err(_) => warn!("Transport close timed out"),
            }
        }

        running.playback.shutdown(grace).await;
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.connected) {
            metrics::record_session_close();
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(turn_id = %self.turn_id, from = %previous, to = %state, "Session state");
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn uplink_task(
    source: BoxStream<'static, anyhow::Result<String>>,
    mut writer: Box<dyn FrameWriter>,
    activity: Activity,
    end_sent: Arc<AtomicBool>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PipelineEvent>,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = uplink::run(source, writer.as_mut(), &activity, &end_sent) => Some(result),
    };
    let _ = events.send(PipelineEvent::Uplink { writer, result });
}

async fn downlink_task(
    mut reader: Box<dyn FrameReader>,
    queue: AudioQueue,
    activity: Activity,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PipelineEvent>,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = downlink::run(reader.as_mut(), queue, &activity) => Some(result),
    };
    let _ = events.send(PipelineEvent::Downlink(result));
}

async fn join_with_grace(handle: JoinHandle<()>, grace: Duration, pipeline: &'static str) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(pipeline, error = %e, "Pipeline task ended abnormally"),
        Err(_) => {
            warn!(pipeline, "Pipeline did not stop in time, aborting");
            abort.abort();
        }
    }
}
