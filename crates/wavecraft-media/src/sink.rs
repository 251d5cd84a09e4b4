//! Audio output devices.
//!
//! The playback coordinator drives an [`AudioSink`]; what the sink does with
//! the bytes (speaker, pipe, file) is opaque to the session.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use wavecraft_core::config::AudioConfig;
use wavecraft_core::types::AudioBuffer;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("output device unavailable: {0}")]
    Unavailable(String),

    #[error("buffer rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An output device accepting raw audio buffers in order.
#[async_trait]
pub trait AudioSink: Send {
    /// Render one buffer; resolves when the device has accepted it.
    async fn play(&mut self, buffer: &AudioBuffer) -> Result<(), PlaybackError>;

    /// Called once after the last buffer of the turn.
    async fn finish(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }

    /// Whether the sink still takes buffers after `play` returned an error.
    fn accepts_more(&self) -> bool {
        false
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&mut self, _buffer: &AudioBuffer) -> Result<(), PlaybackError> {
        Ok(())
    }
}

/// Streams raw PCM to any async writer (e.g. stdout piped into a player).
pub struct PcmWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PcmWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> AudioSink for PcmWriter<W> {
    async fn play(&mut self, buffer: &AudioBuffer) -> Result<(), PlaybackError> {
        self.writer.write_all(&buffer.data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), PlaybackError> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Collects a turn's audio and saves it as a WAV file when the turn ends.
pub struct WavRecorder {
    dir: PathBuf,
    session_id: String,
    format: AudioConfig,
    pcm: Vec<u8>,
    saved: Option<PathBuf>,
}

impl WavRecorder {
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>, format: AudioConfig) -> Self {
        Self {
            dir: dir.into(),
            session_id: session_id.into(),
            format,
            pcm: Vec::new(),
            saved: None,
        }
    }

    /// Path of the written file, once `finish` has run.
    pub fn saved_path(&self) -> Option<&Path> {
        self.saved.as_deref()
    }

    fn file_name(&self) -> String {
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        format!("session_{}_{ts}.wav", sanitize(&self.session_id))
    }
}

#[async_trait]
impl AudioSink for WavRecorder {
    async fn play(&mut self, buffer: &AudioBuffer) -> Result<(), PlaybackError> {
        self.pcm.extend_from_slice(&buffer.data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), PlaybackError> {
        if self.pcm.is_empty() {
            debug!(session_id = %self.session_id, "No audio to save");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(self.file_name());
        let wav = pcm_to_wav(
            &self.pcm,
            self.format.sample_rate,
            self.format.channels,
            self.format.bits_per_sample,
        );
        tokio::fs::write(&path, wav).await?;
        info!(path = %path.display(), bytes = self.pcm.len(), "Saved turn audio");
        self.saved = Some(path);
        Ok(())
    }
}

/// Plays every buffer to several sinks in order.
///
/// A sink that fails is dropped and the rest keep playing; `play` reports the
/// first failure of that buffer.
pub struct FanoutSink {
    sinks: Vec<Box<dyn AudioSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn AudioSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AudioSink for FanoutSink {
    async fn play(&mut self, buffer: &AudioBuffer) -> Result<(), PlaybackError> {
        let mut first_err = None;
        let mut i = 0;
        while i < self.sinks.len() {
            match self.sinks[i].play(buffer).await {
                Ok(()) => i += 1,
                Err(e) => {
                    if self.sinks[i].accepts_more() {
                        i += 1;
                    } else {
                        self.sinks.remove(i);
                    }
                    warn!(sequence = buffer.sequence, remaining = self.sinks.len(), error = %e, "Fanout output failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn finish(&mut self) -> Result<(), PlaybackError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn accepts_more(&self) -> bool {
        !self.sinks.is_empty()
    }
}

/// Wrap raw little-endian PCM bytes in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len;

    let mut wav = Vec::with_capacity(44 + pcm.len());

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(sequence: u64, data: &[u8]) -> AudioBuffer {
        AudioBuffer {
            sequence,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_wav_header() {
        let pcm = vec![0u8; 640]; // 320 samples, 16-bit mono
        let wav = pcm_to_wav(&pcm, 16000, 1, 16);
        assert_eq!(wav.len(), 44 + 640);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 16000);
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 32000);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 640);
    }

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize("abc-123_x"), "abc-123_x");
        assert_eq!(sanitize("../etc/passwd"), "___etc_passwd");
    }

    #[tokio::test]
    async fn test_pcm_writer_writes_in_order() {
        let mut sink = PcmWriter::new(Vec::new());
        sink.play(&buffer(0, b"ab")).await.unwrap();
        sink.play(&buffer(1, b"cd")).await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.writer, b"abcd");
    }

    #[tokio::test]
    async fn test_recorder_saves_wav() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = WavRecorder::new(dir.path(), "sess-1", AudioConfig::default());
        recorder.play(&buffer(0, &[1, 2])).await.unwrap();
        recorder.play(&buffer(1, &[3, 4])).await.unwrap();
        recorder.finish().await.unwrap();

        let path = recorder.saved_path().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("session_sess-1_"));
        assert!(name.ends_with(".wav"));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[44..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recorder_without_audio_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = WavRecorder::new(dir.path().join("audio"), "s", AudioConfig::default());
        recorder.finish().await.unwrap();
        assert!(recorder.saved_path().is_none());
        assert!(!dir.path().join("audio").exists());
    }

    #[tokio::test]
    async fn test_fanout_plays_to_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut fanout = FanoutSink::new(vec![
            Box::new(NullSink) as Box<dyn AudioSink>,
            Box::new(WavRecorder::new(dir.path(), "fan", AudioConfig::default())),
        ]);
        fanout.play(&buffer(0, &[9, 9])).await.unwrap();
        fanout.finish().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    struct Unplugged;

    #[async_trait]
    impl AudioSink for Unplugged {
        async fn play(&mut self, _buffer: &AudioBuffer) -> Result<(), PlaybackError> {
            Err(PlaybackError::Unavailable("unplugged".into()))
        }
    }

    #[tokio::test]
    async fn test_fanout_keeps_recording_after_device_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut fanout = FanoutSink::new(vec![
            Box::new(Unplugged) as Box<dyn AudioSink>,
            Box::new(WavRecorder::new(dir.path(), "fan", AudioConfig::default())),
        ]);

        let err = fanout.play(&buffer(0, &[1, 2])).await.unwrap_err();
        assert!(err.to_string().contains("unplugged"));
        assert!(fanout.accepts_more());

        fanout.play(&buffer(1, &[3, 4])).await.unwrap();
        fanout.finish().await.unwrap();

        let saved: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(saved.len(), 1);
        let bytes = std::fs::read(saved[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(&bytes[44..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_fanout_with_every_sink_failed_accepts_nothing() {
        let mut fanout = FanoutSink::new(vec![Box::new(Unplugged) as Box<dyn AudioSink>]);
        assert!(fanout.play(&buffer(0, &[1])).await.is_err());
        assert!(!fanout.accepts_more());
    }
}
