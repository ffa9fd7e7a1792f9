//! Upstream realtime wire protocol.
//!
//! Outbound messages are built as JSON values; inbound frames are parsed
//! into a typed [`ServerEvent`] so the protocol core can be exercised
//! without a socket.

use serde_json::{json, Value};

/// Voice mode controls upstream turn detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceMode {
    /// Client signals end of speech explicitly; no upstream VAD.
    PushToTalk,
    /// Upstream VAD decides when the user stopped talking.
    OpenMic,
}

impl VoiceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PushToTalk => "push-to-talk",
            Self::OpenMic => "open-mic",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "open-mic" | "open_mic" => Self::OpenMic,
            _ => Self::PushToTalk,
        }
    }
}

// ── Outbound builders ──────────────────────────────────────────────

/// Initial (and update) session configuration.
pub fn session_update(instructions: &str, voice: &str, mode: VoiceMode) -> Value {
    let turn_detection = match mode {
        VoiceMode::OpenMic => json!({ "type": "server_vad" }),
        VoiceMode::PushToTalk => Value::Null,
    };
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["audio", "text"],
            "voice": voice,
            "instructions": instructions,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": {
                "model": "gpt-4o-mini-transcribe"
            },
            "turn_detection": turn_detection,
        }
    })
}

pub fn input_audio_append(b64_audio: &str) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": b64_audio,
    })
}

pub fn input_audio_commit() -> Value {
    json!({ "type": "input_audio_buffer.commit" })
}

pub fn input_audio_clear() -> Value {
    json!({ "type": "input_audio_buffer.clear" })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

pub fn response_cancel() -> Value {
    json!({ "type": "response.cancel" })
}

// ── Inbound events ─────────────────────────────────────────────────

/// Typed upstream server event. Unknown types parse to `Other` so new
/// upstream events degrade to a debug log instead of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated,
    SessionUpdated,
    SpeechStarted,
    InputCommitted,
    ResponseCreated,
    /// Decoded PCM16 bytes from a `response.audio.delta`.
    AudioDelta(Vec<u8>),
    AudioTranscriptDelta(String),
    AudioTranscriptDone(String),
    InputTranscriptionCompleted(String),
    ResponseDone,
    RateLimitsUpdated(Value),
    Error {
        code: String,
        message: String,
    },
    Other(String),
}

/// Parse one upstream text frame.
pub fn parse_server_event(json_text: &str) -> anyhow::Result<ServerEvent> {
    let value: Value = serde_json::from_str(json_text)
        .map_err(|e| anyhow::anyhow!("malformed upstream frame: {e}"))?;
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let event = match event_type {
        "session.created" => ServerEvent::SessionCreated,
        "session.updated" => ServerEvent::SessionUpdated,
        "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
        "input_audio_buffer.committed" => ServerEvent::InputCommitted,
        "response.created" => ServerEvent::ResponseCreated,
        "response.audio.delta" => {
            let delta = value
                .get("delta")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("audio delta without payload"))?;
            ServerEvent::AudioDelta(crate::audio::decode_base64(delta)?)
        }
        "response.audio_transcript.delta" => ServerEvent::AudioTranscriptDelta(
            value
                .get("delta")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        ),
        "response.audio_transcript.done" => ServerEvent::AudioTranscriptDone(
            value
                .get("transcript")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        ),
        "conversation.item.input_audio_transcription.completed" => {
            ServerEvent::InputTranscriptionCompleted(
                value
                    .get("transcript")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            )
        }
        "response.done" => ServerEvent::ResponseDone,
        "rate_limits.updated" => ServerEvent::RateLimitsUpdated(
            value.get("rate_limits").cloned().unwrap_or(Value::Null),
        ),
        "error" => {
            let err = value.get("error").cloned().unwrap_or(Value::Null);
            ServerEvent::Error {
                code: err
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                message: err
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown upstream error")
                    .to_string(),
            }
        }
        other => ServerEvent::Other(other.to_string()),
    };
    Ok(event)
}
