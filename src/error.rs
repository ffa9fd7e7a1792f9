//! Error taxonomy for the orchestration core.
//!
//! Fatal transport/credential failures flip the session to error; protocol
//! rejections from the upstream reset local state and keep the session in
//! LISTENING; everything else is absorbed where it happens and surfaced as
//! bus events.

use thiserror::Error;

/// Errors surfaced by the provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The upstream transport never opened, or `session.created` was not
    /// observed within the configured window.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Credential rejected by the upstream. Fatal for the session.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// `send_audio` called with a format other than PCM16.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The upstream rejected a protocol message (non-fatal).
    #[error("upstream protocol error: {code}: {message}")]
    Protocol { code: String, message: String },

    /// The WebSocket closed underneath us.
    #[error("websocket error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether this error ends the session (transport/credential class)
    /// as opposed to being absorbed and retried by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::AuthenticationFailed | Self::Transport(_)
        )
    }
}

/// Errors from the storage layer. Callers on the audit path log these and
/// continue; only session bootstrap treats them as hard failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration failed at version {version}: {message}")]
    Migration { version: u32, message: String },
}
