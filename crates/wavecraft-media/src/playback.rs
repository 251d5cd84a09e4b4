//! Playback coordinator.
//!
//! Owns the receiving end of a session's audio queue and the output sink.
//! Buffers are rendered strictly in queue order, one at a time. Progress is
//! published through a `watch` channel so the session can wait for idle and
//! treat rendering as activity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wavecraft_core::types::AudioBuffer;

use crate::sink::AudioSink;

/// Snapshot of playback progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStatus {
    /// Buffers pushed but not yet rendered (including the one rendering now).
    pub queued: usize,
    pub rendered: u64,
    pub rendered_bytes: u64,
    /// Set once the sink failed. Later buffers are discarded unless the sink
    /// still accepts them (a fanout with surviving outputs).
    pub failed: Option<String>,
    /// The playback task has exited.
    pub finished: bool,
}

impl PlaybackStatus {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 || self.finished
    }
}

/// Append-only handle to the playback queue. There is exactly one per
/// coordinator; dropping it tells playback no more audio will arrive.
pub struct AudioQueue {
    tx: mpsc::UnboundedSender<AudioBuffer>,
    status: Arc<watch::Sender<PlaybackStatus>>,
}

impl AudioQueue {
    /// Append a buffer. Returns `false` if playback has already stopped.
    pub fn push(&self, buffer: AudioBuffer) -> bool {
        // Count first so the buffer is never observable as "idle" in flight.
        self.status.send_modify(|s| s.queued += 1);
        if self.tx.send(buffer).is_err() {
            self.status
                .send_modify(|s| s.queued = s.queued.saturating_sub(1));
            return false;
        }
        true
    }
}

/// Drives queued audio to an [`AudioSink`] on its own task.
pub struct PlaybackCoordinator {
    status: watch::Receiver<PlaybackStatus>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackCoordinator {
    /// Spawn the playback task. The task stops when `cancel` fires or the
    /// returned queue is dropped and fully rendered.
    pub fn start(sink: Box<dyn AudioSink>, cancel: CancellationToken) -> (Self, AudioQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::default());
        let status_tx = Arc::new(status_tx);

        let handle = tokio::spawn(render_loop(sink, rx, status_tx.clone(), cancel.clone()));

        (
            Self {
                status: status_rx,
                cancel,
                handle: Some(handle),
            },
            AudioQueue {
                tx,
                status: status_tx,
            },
        )
    }

    /// True iff the queue is empty and nothing is rendering.
    pub fn is_idle(&self) -> bool {
        self.status.borrow().is_idle()
    }

    /// Suspend until [`is_idle`](Self::is_idle) holds.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.status.clone();
        // An error means the task is gone, which is idle too.
        let _ = rx.wait_for(PlaybackStatus::is_idle).await;
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    /// A receiver notified on every change of progress.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    /// Wait up to `grace` for the playback task to exit on its own, then abort it.
    pub async fn join(&mut self, grace: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Playback task ended abnormally"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Playback did not stop in time, aborting");
                abort.abort();
            }
        }
    }

    /// Stop rendering now and discard whatever is still queued.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.cancel.cancel();
        self.join(grace).await;
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn render_loop(
    mut sink: Box<dyn AudioSink>,
    mut rx: mpsc::UnboundedReceiver<AudioBuffer>,
    status: Arc<watch::Sender<PlaybackStatus>>,
    cancel: CancellationToken,
) {
    loop {
        let buffer = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(buffer) => buffer,
                None => break,
            },
        };

        let failed = status.borrow().failed.is_some();
        if failed && !sink.accepts_more() {
            status.send_modify(|s| s.queued = s.queued.saturating_sub(1));
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = sink.play(&buffer) => result,
        };

        match result {
            Ok(()) => status.send_modify(|s| {
                s.queued = s.queued.saturating_sub(1);
                s.rendered += 1;
                s.rendered_bytes += buffer.len() as u64;
            }),
            Err(e) if failed => {
                debug!(sequence = buffer.sequence, error = %e, "Audio output failed again");
                status.send_modify(|s| s.queued = s.queued.saturating_sub(1));
            }
            Err(e) => {
                if sink.accepts_more() {
                    warn!(sequence = buffer.sequence, error = %e, "Audio output partly failed");
                } else {
                    warn!(sequence = buffer.sequence, error = %e, "Audio output failed, discarding the rest of the turn");
                }
                status.send_modify(|s| {
                    s.queued = s.queued.saturating_sub(1);
                    s.failed = Some(e.to_string());
                });
            }
        }
    }

    rx.close();
    let mut discarded = 0usize;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "Dropped queued audio on stop");
    }

    let failed = status.borrow().failed.is_some();
    if !failed || sink.accepts_more() {
        if let Err(e) = sink.finish().await {
            warn!(error = %e, "Audio output did not finish cleanly");
            status.send_modify(|s| {
                s.failed.get_or_insert_with(|| e.to_string());
            });
        }
    }

    status.send_modify(|s| {
        s.queued = 0;
        s.finished = true;
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use wavecraft_core::config::AudioConfig;

    use super::*;
    use crate::sink::{FanoutSink, PlaybackError, WavRecorder};

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<u64>>>);

    #[async_trait]
    impl AudioSink for Collect {
        async fn play(&mut self, buffer: &AudioBuffer) -> Result<(), PlaybackError> {
            self.0.lock().unwrap().push(buffer.sequence);
            Ok(())
        }
    }

    struct FailOn(u64);

    #[async_trait]
    impl AudioSink for FailOn {
        async fn play(&mut self, buffer: &AudioBuffer) -> Result<(), PlaybackError> {
            if buffer.sequence == self.0 {
                return Err(PlaybackError::Unavailable("device unplugged".into()));
            }
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl AudioSink for Stuck {
        async fn play(&mut self, _buffer: &AudioBuffer) -> Result<(), PlaybackError> {
            std::future::pending().await
        }
    }

    fn buffer(sequence: u64) -> AudioBuffer {
        AudioBuffer {
            sequence,
            data: vec![0; 10],
        }
    }

    #[tokio::test]
    async fn test_idle_before_any_audio() {
        let (playback, _queue) = PlaybackCoordinator::start(Box::new(Collect::default()), CancellationToken::new());
        assert!(playback.is_idle());
        playback.wait_until_idle().await;
    }

    #[tokio::test]
    async fn test_renders_in_queue_order() {
        let sink = Collect::default();
        let seen = sink.0.clone();
        let (playback, queue) = PlaybackCoordinator::start(Box::new(sink), CancellationToken::new());

        for seq in 0..5 {
            assert!(queue.push(buffer(seq)));
        }
        playback.wait_until_idle().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        let status = playback.status();
        assert_eq!(status.rendered, 5);
        assert_eq!(status.rendered_bytes, 50);
        assert!(status.failed.is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_discards_rest_and_reaches_idle() {
        let (mut playback, queue) = PlaybackCoordinator::start(Box::new(FailOn(1)), CancellationToken::new());
        for seq in 0..4 {
            queue.push(buffer(seq));
        }
        playback.wait_until_idle().await;

        let status = playback.status();
        assert_eq!(status.rendered, 1);
        assert!(status.failed.unwrap().contains("device unplugged"));

        drop(queue);
        playback.join(Duration::from_secs(1)).await;
        assert!(playback.status().finished);
    }

    #[tokio::test]
    async fn test_recording_survives_output_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FanoutSink::new(vec![
            Box::new(FailOn(0)) as Box<dyn AudioSink>,
            Box::new(WavRecorder::new(dir.path(), "s1", AudioConfig::default())),
        ]);
        let (mut playback, queue) = PlaybackCoordinator::start(Box::new(sink), CancellationToken::new());
        for seq in 0..3 {
            queue.push(buffer(seq));
        }
        drop(queue);
        playback.join(Duration::from_secs(1)).await;

        let status = playback.status();
        assert!(status.finished);
        assert!(status.failed.unwrap().contains("device unplugged"));

        let saved: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(saved.len(), 1);
        let bytes = std::fs::read(saved[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(bytes.len(), 44 + 30);
    }

    #[tokio::test]
    async fn test_stuck_sink_is_not_idle() {
        let (playback, queue) = PlaybackCoordinator::start(Box::new(Stuck), CancellationToken::new());
        queue.push(buffer(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!playback.is_idle());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_rendering() {
        let (mut playback, queue) = PlaybackCoordinator::start(Box::new(Stuck), CancellationToken::new());
        queue.push(buffer(0));
        queue.push(buffer(1));

        playback.shutdown(Duration::from_secs(1)).await;
        let status = playback.status();
        assert!(status.finished);
        assert!(playback.is_idle());
        assert!(!queue.push(buffer(2)));
    }

    #[tokio::test]
    async fn test_dropping_queue_finishes_task() {
        let (mut playback, queue) = PlaybackCoordinator::start(Box::new(Collect::default()), CancellationToken::new());
        queue.push(buffer(0));
        drop(queue);
        playback.join(Duration::from_secs(1)).await;
        let status = playback.status();
        assert!(status.finished);
        assert_eq!(status.rendered, 1);
    }
}
