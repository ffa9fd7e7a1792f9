//! Client ↔ server wire protocol.
//!
//! JSON messages over a bidirectional stream; the transport framing itself
//! (WebSocket, etc.) lives outside the core. Audio payloads are base64
//! PCM16 little-endian mono 24 kHz in both directions.

use serde::{Deserialize, Serialize};

/// Messages sent from the client to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Open a session for this browser.
    #[serde(rename = "session.start")]
    SessionStart {
        fingerprint: String,
        #[serde(rename = "userAgent")]
        user_agent: String,
        #[serde(rename = "voiceMode", skip_serializing_if = "Option::is_none")]
        voice_mode: Option<String>,
    },

    /// End the session.
    #[serde(rename = "session.end")]
    SessionEnd,

    /// Switch between push-to-talk and open-mic.
    #[serde(rename = "session.set_mode")]
    SessionSetMode {
        #[serde(rename = "voiceMode")]
        voice_mode: String,
    },

    /// Microphone audio.
    #[serde(rename = "audio.chunk")]
    AudioChunk {
        /// Base64 PCM16LE.
        data: String,
        format: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
    },

    /// Seal the input buffer and request a response.
    #[serde(rename = "audio.commit")]
    AudioCommit,

    /// Clear the input buffer; no response.
    #[serde(rename = "audio.cancel")]
    AudioCancel,

    /// Stop capture; buffer untouched.
    #[serde(rename = "audio.stop")]
    AudioStop,

    /// The user started speaking over the assistant.
    #[serde(rename = "user.barge_in")]
    UserBargeIn,

    /// Client-side playback drained.
    #[serde(rename = "playback.ended")]
    PlaybackEnded { timestamp: u64 },
}

/// Messages sent from the gateway to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.ready")]
    SessionReady {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Upstream session established; includes returning-user facts.
    #[serde(rename = "provider.ready")]
    ProviderReady {
        #[serde(rename = "isReturningUser")]
        is_returning_user: bool,
        #[serde(rename = "previousSessionCount")]
        previous_session_count: i64,
    },

    #[serde(rename = "response.start")]
    ResponseStart,

    #[serde(rename = "response.end")]
    ResponseEnd,

    /// Speaker audio.
    #[serde(rename = "audio.chunk")]
    AudioChunk {
        /// Base64 PCM16LE.
        data: String,
        format: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
    },

    /// Assistant transcript.
    #[serde(rename = "transcript")]
    Transcript {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },

    /// Transcription of the user's speech.
    #[serde(rename = "user_transcript")]
    UserTranscript {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },

    #[serde(rename = "lane.state_changed")]
    LaneStateChanged {
        from: String,
        to: String,
        cause: String,
    },

    #[serde(rename = "lane.owner_changed")]
    LaneOwnerChanged {
        from: String,
        to: String,
        cause: String,
    },

    /// The commit was under the minimum buffer duration.
    #[serde(rename = "commit.skipped")]
    CommitSkipped,

    #[serde(rename = "audio.cancel.ack")]
    AudioCancelAck,

    #[serde(rename = "audio.stop.ack")]
    AudioStopAck,

    #[serde(rename = "user.barge_in.ack")]
    UserBargeInAck,

    #[serde(rename = "session.mode_changed")]
    SessionModeChanged {
        #[serde(rename = "voiceMode")]
        voice_mode: String,
    },

    #[serde(rename = "error")]
    Error { error: String },

    /// The upstream provider could not be reached.
    #[serde(rename = "connection.failed")]
    ConnectionFailed,
}
