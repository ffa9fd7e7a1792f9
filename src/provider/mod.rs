//! Provider adapter: stateful client to the upstream realtime audio API.
//!
//! One full-duplex upstream connection per session. The adapter translates
//! lane-level operations into the provider's message protocol and enforces
//! the buffer-commit contract:
//!
//! ```text
//! client stops talking
//!   → commit_audio() returns true
//!   → await upstream "input_audio_buffer.committed"
//!   → only then emit response.create
//! ```
//!
//! The arbitrator and Lane B depend on [`RealtimeProvider`], never on the
//! concrete client.

pub mod openai;
pub mod protocol;
pub mod state;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde_json::Value;

pub use openai::OpenAiRealtimeClient;
pub use protocol::VoiceMode;

/// Event surfaced by a provider adapter toward Lane B.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Upstream session established and configured.
    Ready,
    /// The most recent commit was acknowledged upstream.
    CommitConfirmed,
    /// Upstream started producing a response.
    ResponseStart,
    /// First audio delta since the last confirmed commit.
    FirstAudioReady { ttfb_ms: Option<u64> },
    /// Decoded PCM16 output audio.
    Audio { pcm: Vec<u8> },
    /// Assistant transcript text (streaming or final).
    Transcript { text: String, is_final: bool },
    /// Transcription of the user's committed input audio.
    UserTranscript { text: String, is_final: bool },
    /// Response finished; `truncated` when the transport died mid-response.
    ResponseEnd { truncated: bool, ttfb_ms: Option<u64> },
    /// Upstream rate limit snapshot (metrics).
    RateLimits { limits: Value },
    /// Upstream or transport error. Fatal errors end the session.
    Error {
        code: String,
        message: String,
        fatal: bool,
    },
}

/// Capability set of an upstream realtime session.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    /// Open the upstream connection and configure the session. Resolves
    /// once the upstream acknowledges session creation.
    async fn connect(&self, session_id: &str) -> Result<(), ProviderError>;

    /// Append PCM16 input audio. Silent no-op when disconnected; rejects
    /// non-PCM formats.
    async fn send_audio(&self, pcm: &[u8], format: &str) -> Result<(), ProviderError>;

    /// Attempt to commit the input buffer. Returns whether a commit was
    /// actually sent upstream (false when the buffer was under the
    /// minimum duration).
    async fn commit_audio(&self) -> Result<bool, ProviderError>;

    /// Clear the input buffer without producing a response.
    async fn clear_audio(&self) -> Result<(), ProviderError>;

    /// Cancel the in-flight response. Input buffer state is untouched.
    async fn cancel(&self) -> Result<(), ProviderError>;

    /// Switch between push-to-talk and open-mic turn detection.
    async fn set_voice_mode(&self, mode: VoiceMode) -> Result<(), ProviderError>;

    /// Replace the conversation context merged into instructions on the
    /// next session update.
    async fn set_conversation_context(&self, context: &str) -> Result<(), ProviderError>;

    /// Cancel any in-flight response, close the transport, drop buffers.
    async fn disconnect(&self);

    /// Receive the next adapter event. `None` once the session is closed.
    async fn recv_event(&self) -> Option<ProviderEvent>;
}
