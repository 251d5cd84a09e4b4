//! Synthesis service wire protocol.
//!
//! All frames are JSON text messages discriminated by a `type` field.
//! Outbound: `text` and `end`. Inbound: `audio`, `end`, and `error`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client -> service frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// One text fragment. `sequence` increases by one per fragment, starting at 0.
    Text { content: String, sequence: u64 },
    /// Turn termination: no more text will follow.
    End,
}

impl OutboundFrame {
    pub fn to_json(&self) -> String {
        // Serializing a string/u64 enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Service -> client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Audio(AudioPayload),
    /// End of audio: the service has nothing more to send for this turn.
    End,
    /// The service reported a failure.
    Error {
        code: Option<i64>,
        message: Option<String>,
    },
}

/// The `payload.audio.audio` field of an audio frame, as found on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    Encoded(String),
    /// No payload, or no nested `audio` field.
    Missing,
    /// Present but not shaped like `{ "audio": { "audio": "<base64>" } }`.
    Malformed(String),
}

/// Application-level framing violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),
    #[error("frame has no `type` discriminator")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` frame: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Audio payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64 audio: {0}")]
    Base64(String),
    #[error("unexpected audio payload shape: {0}")]
    Shape(String),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl InboundFrame {
    /// Parse one inbound text message.
    ///
    /// Only the envelope is validated here; a broken audio payload is carried
    /// through as [`AudioPayload::Malformed`] so the caller can drop it without
    /// failing the connection.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FrameError::NotJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(FrameError::MissingType)?;

        match kind {
            "audio" => Ok(Self::Audio(extract_audio(&value))),
            "end" => Ok(Self::End),
            "error" => {
                let body: ErrorBody =
                    serde_json::from_value(value.clone()).map_err(|e| FrameError::Malformed {
                        kind: "error",
                        reason: e.to_string(),
                    })?;
                Ok(Self::Error {
                    code: body.code,
                    message: body.message,
                })
            }
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

fn extract_audio(frame: &serde_json::Value) -> AudioPayload {
    let Some(payload) = frame.get("payload").filter(|p| !p.is_null()) else {
        return AudioPayload::Missing;
    };
    let Some(outer) = payload.as_object() else {
        return AudioPayload::Malformed("payload is not an object".into());
    };
    let Some(audio) = outer.get("audio").filter(|a| !a.is_null()) else {
        return AudioPayload::Missing;
    };
    let Some(inner) = audio.as_object() else {
        return AudioPayload::Malformed("payload.audio is not an object".into());
    };
    match inner.get("audio") {
        None | Some(serde_json::Value::Null) => AudioPayload::Missing,
        Some(serde_json::Value::String(s)) => AudioPayload::Encoded(s.clone()),
        Some(_) => AudioPayload::Malformed("payload.audio.audio is not a string".into()),
    }
}

impl AudioPayload {
    /// Decode to raw bytes. `Ok(None)` means there was nothing to play.
    pub fn decode(&self) -> Result<Option<Vec<u8>>, DecodeError> {
        match self {
            Self::Missing => Ok(None),
            Self::Encoded(s) if s.is_empty() => Ok(None),
            Self::Encoded(s) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| DecodeError::Base64(e.to_string()))?;
                Ok((!bytes.is_empty()).then_some(bytes))
            }
            Self::Malformed(reason) => Err(DecodeError::Shape(reason.clone())),
        }
    }
}

/// Encode raw audio the way the service does. Used by test peers.
pub fn encode_audio(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Build an inbound audio frame carrying `bytes`.
pub fn audio_frame_json(bytes: &[u8]) -> String {
    serde_json::json!({
        "type": "audio",
        "payload": { "audio": { "audio": encode_audio(bytes) } },
    })
    .to_string()
}
