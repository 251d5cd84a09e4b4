//! Shared types used across the resolver, session, and playback crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short prefix used in log lines and file names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Synthesis parameters handed back by the control plane alongside the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParameters {
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_level")]
    pub speed: u8,
    #[serde(default = "default_level")]
    pub volume: u8,
    #[serde(default = "default_level")]
    pub pitch: u8,
}

fn default_voice() -> String {
    "x5_lingfeiyi_flow".into()
}

fn default_level() -> u8 {
    50
}

impl Default for VoiceParameters {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            speed: default_level(),
            volume: default_level(),
            pitch: default_level(),
        }
    }
}

/// A resolved, single-use connection target.
///
/// The URL carries the short-lived credential, so an `Endpoint` must never be
/// reused for a second turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Control-plane session id, used for settlement.
    pub session_id: String,
    /// `ws://` or `wss://` URL of the synthesis service.
    pub url: String,
    #[serde(default)]
    pub parameters: VoiceParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Endpoint {
    /// URL with the query string removed, safe for logging.
    pub fn redacted_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

/// Decoded audio bytes ready for the output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    /// Position of the inbound audio frame this buffer was decoded from.
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl AudioBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    /// `Closed` and `Failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of the terminal error that ended a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Resolution,
    Connect,
    Transmit,
    Receive,
    Protocol,
    Remote,
    Timeout,
    Source,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Connect => "connect",
            Self::Transmit => "transmit",
            Self::Receive => "receive",
            Self::Protocol => "protocol",
            Self::Remote => "remote",
            Self::Timeout => "timeout",
            Self::Source => "source",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
