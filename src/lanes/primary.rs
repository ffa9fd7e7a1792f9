//! Lane B: the primary AI response stream.
//!
//! A thin wrapper over the provider adapter that exposes exactly the
//! signals the arbitrator and runtime need, forwards audio, and tracks
//! TTFB (commit-confirmed to first audio delta).

use crate::provider::{ProviderEvent, RealtimeProvider, VoiceMode};
use crate::error::ProviderError;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lane-level signal surfaced to the session runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneBEvent {
    Ready,
    CommitConfirmed,
    ResponseStart,
    /// First audio since the last confirmed commit; `ttfb_ms` measures
    /// commit-confirmed → first delta.
    FirstAudioReady { ttfb_ms: Option<u64> },
    Audio { pcm: Vec<u8> },
    Transcript { text: String, is_final: bool },
    UserTranscript { text: String, is_final: bool },
    ResponseEnd { truncated: bool, ttfb_ms: Option<u64> },
    RateLimits { limits: serde_json::Value },
    Error {
        code: String,
        message: String,
        fatal: bool,
    },
}

/// Lane B handle for one session.
pub struct PrimaryLane {
    provider: Arc<dyn RealtimeProvider>,
    session_id: String,
}

impl PrimaryLane {
    pub fn new(provider: Arc<dyn RealtimeProvider>, session_id: impl Into<String>) -> Self {
        Self {
            provider,
            session_id: session_id.into(),
        }
    }

    /// Connect the upstream session and start forwarding provider events
    /// into `out` until the provider stream closes.
    pub async fn connect(&self, out: mpsc::Sender<LaneBEvent>) -> Result<(), ProviderError> {
        self.provider.connect(&self.session_id).await?;

        let provider = Arc::clone(&self.provider);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            Self::pump(provider, out, session_id).await;
        });
        Ok(())
    }

    async fn pump(
        provider: Arc<dyn RealtimeProvider>,
        out: mpsc::Sender<LaneBEvent>,
        session_id: String,
    ) {
        while let Some(event) = provider.recv_event().await {
            let lane_event = match event {
                ProviderEvent::Ready => LaneBEvent::Ready,
                ProviderEvent::CommitConfirmed => LaneBEvent::CommitConfirmed,
                ProviderEvent::ResponseStart => LaneBEvent::ResponseStart,
                ProviderEvent::FirstAudioReady { ttfb_ms } => {
                    if let Some(ttfb) = ttfb_ms {
                        tracing::info!(
                            session_id = %session_id,
                            ttfb_ms = ttfb,
                            "Lane B first audio ready"
                        );
                    }
                    LaneBEvent::FirstAudioReady { ttfb_ms }
                }
                ProviderEvent::Audio { pcm } => LaneBEvent::Audio { pcm },
                ProviderEvent::Transcript { text, is_final } => {
                    LaneBEvent::Transcript { text, is_final }
                }
                ProviderEvent::UserTranscript { text, is_final } => {
                    LaneBEvent::UserTranscript { text, is_final }
                }
                ProviderEvent::ResponseEnd { truncated, ttfb_ms } => {
                    LaneBEvent::ResponseEnd { truncated, ttfb_ms }
                }
                ProviderEvent::RateLimits { limits } => {
                    tracing::debug!(session_id = %session_id, ?limits, "Upstream rate limits");
                    LaneBEvent::RateLimits { limits }
                }
                ProviderEvent::Error {
                    code,
                    message,
                    fatal,
                } => LaneBEvent::Error {
                    code,
                    message,
                    fatal,
                },
            };
            if out.send(lane_event).await.is_err() {
                break;
            }
        }
        tracing::debug!(session_id = %session_id, "Lane B pump terminated");
    }

    pub async fn send_audio(&self, pcm: &[u8], format: &str) -> Result<(), ProviderError> {
        self.provider.send_audio(pcm, format).await
    }

    pub async fn commit_audio(&self) -> Result<bool, ProviderError> {
        self.provider.commit_audio().await
    }

    pub async fn clear_audio(&self) -> Result<(), ProviderError> {
        self.provider.clear_audio().await
    }

    pub async fn cancel(&self) -> Result<(), ProviderError> {
        self.provider.cancel().await
    }

    pub async fn set_voice_mode(&self, mode: VoiceMode) -> Result<(), ProviderError> {
        self.provider.set_voice_mode(mode).await
    }

    pub async fn set_conversation_context(&self, context: &str) -> Result<(), ProviderError> {
        self.provider.set_conversation_context(context).await
    }

    pub async fn disconnect(&self) {
        self.provider.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    /// Provider fake that plays back a scripted event sequence.
    struct ScriptedProvider {
        events: AsyncMutex<Vec<ProviderEvent>>,
        committed: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(events: Vec<ProviderEvent>) -> Self {
            Self {
                events: AsyncMutex::new(events),
                committed: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl RealtimeProvider for ScriptedProvider {
        async fn connect(&self, _session_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn send_audio(&self, _pcm: &[u8], format: &str) -> Result<(), ProviderError> {
            if format != "pcm" {
                return Err(ProviderError::UnsupportedFormat(format.into()));
            }
            Ok(())
        }
        async fn commit_audio(&self) -> Result<bool, ProviderError> {
            *self.committed.lock() += 1;
            Ok(true)
        }
        async fn clear_audio(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn cancel(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn set_voice_mode(&self, _mode: VoiceMode) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn set_conversation_context(&self, _context: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn recv_event(&self) -> Option<ProviderEvent> {
            let mut events = self.events.lock().await;
            if events.is_empty() {
                None
            } else {
                Some(events.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn pump_translates_provider_events_in_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderEvent::Ready,
            ProviderEvent::CommitConfirmed,
            ProviderEvent::ResponseStart,
            ProviderEvent::FirstAudioReady { ttfb_ms: Some(120) },
            ProviderEvent::Audio { pcm: vec![1, 2] },
            ProviderEvent::ResponseEnd {
                truncated: false,
                ttfb_ms: Some(120),
            },
        ]));
        let lane = PrimaryLane::new(provider, "s1");
        let (tx, mut rx) = mpsc::channel(16);
        lane.connect(tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), LaneBEvent::Ready);
        assert_eq!(rx.recv().await.unwrap(), LaneBEvent::CommitConfirmed);
        assert_eq!(rx.recv().await.unwrap(), LaneBEvent::ResponseStart);
        assert_eq!(
            rx.recv().await.unwrap(),
            LaneBEvent::FirstAudioReady { ttfb_ms: Some(120) }
        );
        assert_eq!(rx.recv().await.unwrap(), LaneBEvent::Audio { pcm: vec![1, 2] });
        assert_eq!(
            rx.recv().await.unwrap(),
            LaneBEvent::ResponseEnd {
                truncated: false,
                ttfb_ms: Some(120)
            }
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn lane_ops_pass_through() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let lane = PrimaryLane::new(Arc::clone(&provider) as Arc<dyn RealtimeProvider>, "s1");
        assert!(lane.commit_audio().await.unwrap());
        assert_eq!(*provider.committed.lock(), 1);
        assert!(lane.send_audio(&[0, 0], "opus").await.is_err());
    }
}
