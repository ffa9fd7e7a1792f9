//! Pure protocol core for the provider adapter.
//!
//! Owns the input-buffer bookkeeping and the response lifecycle, and turns
//! upstream server events into adapter effects. No sockets, no timers; the
//! WebSocket client in `openai.rs` interprets the effects, which is what
//! makes the commit protocol testable without a network.
//!
//! The one invariant everything here protects: `response.create` is never
//! sent unless the most recent commit was acknowledged with
//! `input_audio_buffer.committed`.

use super::protocol::ServerEvent;
use super::ProviderEvent;
use crate::audio::AppendBuffer;

/// Commit must represent at least this much audio.
pub const MIN_COMMIT_DURATION_MS: f64 = 100.0;

/// Quiet period after the last append before a commit may be sent, so the
/// transport has flushed every append frame upstream.
pub const COMMIT_SAFETY_WINDOW_MS: u64 = 50;

/// Below this duration a commit without upstream VAD confirmation gets a
/// warning log (but proceeds).
pub const VAD_SOFT_WARN_BELOW_MS: f64 = 500.0;

/// Upstream error code for the empty-buffer race.
pub const COMMIT_EMPTY_CODE: &str = "input_audio_buffer_commit_empty";

/// Outcome of a commit attempt gate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommitGate {
    /// Under the minimum; buffer has been reset, nothing was sent.
    TooShort { duration_ms: f64 },
    /// A commit is already awaiting its acknowledgement.
    AlreadyPending,
    /// Safety window not yet elapsed; retry after this many ms.
    Wait { remaining_ms: u64 },
    /// Commit may be sent now.
    Ready { vad_warning: bool },
}

/// Side effect the socket layer must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(ProviderEvent),
    /// Send `response.create` upstream. Only ever produced in direct
    /// response to a commit acknowledgement.
    SendResponseCreate,
}

/// Protocol state for one upstream session.
#[derive(Debug, Default)]
pub struct ProviderCore {
    buffer: AppendBuffer,
    last_append_ms: u64,
    speech_detected: bool,
    pending_commit: bool,
    responding: bool,
    /// Bumped on every cancel; identifies stale audio in logs.
    epoch: u64,
    commit_confirmed_ms: Option<u64>,
    first_audio_pending: bool,
}

impl ProviderCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responding(&self) -> bool {
        self.responding
    }

    pub fn pending_commit(&self) -> bool {
        self.pending_commit
    }

    pub fn speech_detected(&self) -> bool {
        self.speech_detected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn buffered_ms(&self) -> f64 {
        self.buffer.duration_ms()
    }

    /// Record appended input audio.
    pub fn append_audio(&mut self, pcm: &[u8], now_ms: u64) {
        self.buffer.append(pcm);
        self.last_append_ms = now_ms;
    }

    /// Check the three commit guards.
    pub fn commit_gate(&mut self, now_ms: u64) -> CommitGate {
        if self.pending_commit {
            return CommitGate::AlreadyPending;
        }

        let duration_ms = self.buffer.duration_ms();
        if duration_ms < MIN_COMMIT_DURATION_MS {
            self.reset_input();
            return CommitGate::TooShort { duration_ms };
        }

        let elapsed = now_ms.saturating_sub(self.last_append_ms);
        if elapsed < COMMIT_SAFETY_WINDOW_MS {
            return CommitGate::Wait {
                remaining_ms: COMMIT_SAFETY_WINDOW_MS - elapsed,
            };
        }

        CommitGate::Ready {
            vad_warning: !self.speech_detected && duration_ms < VAD_SOFT_WARN_BELOW_MS,
        }
    }

    /// Mark the commit message as sent upstream.
    pub fn on_commit_sent(&mut self) {
        self.pending_commit = true;
    }

    /// Clear the input side (client `audio.cancel` path).
    pub fn clear_input(&mut self) {
        self.reset_input();
        self.pending_commit = false;
    }

    /// Response-side cancel. Input buffer state is left alone; the epoch
    /// bump marks any still-in-flight deltas as stale.
    pub fn on_cancel(&mut self) {
        self.responding = false;
        self.epoch += 1;
        self.first_audio_pending = false;
    }

    /// Transport dropped underneath us.
    pub fn on_transport_closed(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.responding {
            self.responding = false;
            effects.push(Effect::Emit(ProviderEvent::ResponseEnd {
                truncated: true,
                ttfb_ms: None,
            }));
        }
        effects
    }

    fn reset_input(&mut self) {
        self.buffer.clear();
        self.speech_detected = false;
        self.last_append_ms = 0;
    }

    /// Apply one upstream event and return the effects to carry out.
    pub fn on_server_event(&mut self, event: ServerEvent, now_ms: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            ServerEvent::SessionCreated => {
                effects.push(Effect::Emit(ProviderEvent::Ready));
            }
            ServerEvent::SessionUpdated => {}
            ServerEvent::SpeechStarted => {
                self.speech_detected = true;
            }
            ServerEvent::InputCommitted => {
                if !self.pending_commit {
                    // Duplicate acknowledgement; idempotent.
                    tracing::debug!("Duplicate input_audio_buffer.committed ignored");
                    return effects;
                }
                self.pending_commit = false;
                self.reset_input();
                self.commit_confirmed_ms = Some(now_ms);
                self.first_audio_pending = true;
                effects.push(Effect::Emit(ProviderEvent::CommitConfirmed));
                if !self.responding {
                    effects.push(Effect::SendResponseCreate);
                }
            }
            ServerEvent::ResponseCreated => {
                self.responding = true;
                effects.push(Effect::Emit(ProviderEvent::ResponseStart));
            }
            ServerEvent::AudioDelta(pcm) => {
                if !self.responding {
                    // Delta for a cancelled or never-started response.
                    tracing::debug!(
                        epoch = self.epoch,
                        bytes = pcm.len(),
                        "Dropping stale audio delta"
                    );
                    return effects;
                }
                if self.first_audio_pending {
                    self.first_audio_pending = false;
                    let ttfb_ms = self
                        .commit_confirmed_ms
                        .map(|t| now_ms.saturating_sub(t));
                    effects.push(Effect::Emit(ProviderEvent::FirstAudioReady { ttfb_ms }));
                }
                effects.push(Effect::Emit(ProviderEvent::Audio { pcm }));
            }
            ServerEvent::AudioTranscriptDelta(text) => {
                if !text.is_empty() {
                    effects.push(Effect::Emit(ProviderEvent::Transcript {
                        text,
                        is_final: false,
                    }));
                }
            }
            ServerEvent::AudioTranscriptDone(text) => {
                effects.push(Effect::Emit(ProviderEvent::Transcript {
                    text,
                    is_final: true,
                }));
            }
            ServerEvent::InputTranscriptionCompleted(text) => {
                if !text.is_empty() {
                    effects.push(Effect::Emit(ProviderEvent::UserTranscript {
                        text,
                        is_final: true,
                    }));
                }
            }
            ServerEvent::ResponseDone => {
                if !self.responding {
                    // response.done for a cancelled response; absorbed.
                    tracing::debug!("response.done with no response in flight");
                    return effects;
                }
                self.responding = false;
                let ttfb_ms = self.commit_confirmed_ms.take().map(|t| now_ms.saturating_sub(t));
                effects.push(Effect::Emit(ProviderEvent::ResponseEnd {
                    truncated: false,
                    ttfb_ms,
                }));
            }
            ServerEvent::RateLimitsUpdated(limits) => {
                effects.push(Effect::Emit(ProviderEvent::RateLimits { limits }));
            }
            ServerEvent::Error { code, message } => {
                if code == COMMIT_EMPTY_CODE {
                    // The documented race: the upstream saw an empty buffer.
                    // Reset and report; response.create is never sent.
                    self.pending_commit = false;
                    self.reset_input();
                }
                let fatal = is_fatal_upstream_error(&code, &message);
                effects.push(Effect::Emit(ProviderEvent::Error {
                    code,
                    message,
                    fatal,
                }));
            }
            ServerEvent::Other(event_type) => {
                tracing::debug!(event_type = %event_type, "Unhandled upstream event");
            }
        }
        effects
    }
}

/// Credential and transport failures end the session; everything else is
/// recoverable.
fn is_fatal_upstream_error(code: &str, message: &str) -> bool {
    let haystack = format!("{code} {message}").to_ascii_lowercase();
    ["connection failed", "authentication failed", "invalid api key", "invalid_api_key", "websocket error"]
        .iter()
        .any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(effects: &[Effect]) -> Vec<&ProviderEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(ev),
                Effect::SendResponseCreate => None,
            })
            .collect()
    }

    fn wants_response_create(effects: &[Effect]) -> bool {
        effects.iter().any(|e| *e == Effect::SendResponseCreate)
    }

    #[test]
    fn commit_gate_rejects_short_buffer() {
        let mut core = ProviderCore::new();
        // 99.9 ms ≈ 4795 bytes (one sample under 100 ms)
        core.append_audio(&vec![0u8; 4798], 1_000);
        match core.commit_gate(2_000) {
            CommitGate::TooShort { duration_ms } => assert!(duration_ms < 100.0),
            other => panic!("expected TooShort, got {other:?}"),
        }
        // Buffer was reset by the failed gate.
        assert_eq!(core.buffered_ms(), 0.0);
    }

    #[test]
    fn commit_gate_accepts_exactly_100ms() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 4800], 1_000);
        match core.commit_gate(1_100) {
            CommitGate::Ready { .. } => {}
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn commit_gate_enforces_safety_window() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        match core.commit_gate(1_020) {
            CommitGate::Wait { remaining_ms } => assert_eq!(remaining_ms, 30),
            other => panic!("expected Wait, got {other:?}"),
        }
        match core.commit_gate(1_050) {
            CommitGate::Ready { .. } => {}
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn commit_gate_warns_without_vad_on_short_audio() {
        let mut core = ProviderCore::new();
        // 200 ms, no speech_started seen
        core.append_audio(&vec![0u8; 9600], 1_000);
        match core.commit_gate(1_100) {
            CommitGate::Ready { vad_warning } => assert!(vad_warning),
            other => panic!("expected Ready, got {other:?}"),
        }

        // With VAD confirmation there is no warning.
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_server_event(ServerEvent::SpeechStarted, 1_010);
        match core.commit_gate(1_100) {
            CommitGate::Ready { vad_warning } => assert!(!vad_warning),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn commit_gate_refuses_while_pending() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_commit_sent();
        assert_eq!(core.commit_gate(2_000), CommitGate::AlreadyPending);
    }

    #[test]
    fn committed_ack_triggers_response_create() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_commit_sent();

        let effects = core.on_server_event(ServerEvent::InputCommitted, 1_100);
        assert!(wants_response_create(&effects));
        assert!(!core.pending_commit());
        assert_eq!(core.buffered_ms(), 0.0);
    }

    #[test]
    fn duplicate_committed_ack_is_idempotent() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_commit_sent();

        let first = core.on_server_event(ServerEvent::InputCommitted, 1_100);
        assert!(wants_response_create(&first));

        let second = core.on_server_event(ServerEvent::InputCommitted, 1_101);
        assert!(second.is_empty());
    }

    #[test]
    fn no_response_create_without_commit_ack() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_commit_sent();

        // The upstream responds with the empty-buffer race error instead.
        let effects = core.on_server_event(
            ServerEvent::Error {
                code: COMMIT_EMPTY_CODE.into(),
                message: "buffer too small".into(),
            },
            1_100,
        );

        assert!(!wants_response_create(&effects));
        assert!(!core.pending_commit());
        assert_eq!(core.buffered_ms(), 0.0);
        match emitted(&effects).as_slice() {
            [ProviderEvent::Error { code, fatal, .. }] => {
                assert_eq!(code, COMMIT_EMPTY_CODE);
                assert!(!fatal);
            }
            other => panic!("expected a single error event, got {other:?}"),
        }
    }

    #[test]
    fn committed_while_responding_does_not_create_second_response() {
        let mut core = ProviderCore::new();
        core.on_server_event(ServerEvent::ResponseCreated, 1_000);
        assert!(core.responding());

        core.append_audio(&vec![0u8; 9600], 1_010);
        core.on_commit_sent();
        let effects = core.on_server_event(ServerEvent::InputCommitted, 1_100);
        assert!(!wants_response_create(&effects));
    }

    #[test]
    fn first_audio_delta_emits_first_audio_ready_with_ttfb() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_commit_sent();
        core.on_server_event(ServerEvent::InputCommitted, 1_100);
        core.on_server_event(ServerEvent::ResponseCreated, 1_150);

        let effects = core.on_server_event(ServerEvent::AudioDelta(vec![0; 100]), 1_300);
        let events = emitted(&effects);
        assert_eq!(events.len(), 2);
        match events[0] {
            ProviderEvent::FirstAudioReady { ttfb_ms } => assert_eq!(*ttfb_ms, Some(200)),
            other => panic!("expected FirstAudioReady, got {other:?}"),
        }
        assert!(matches!(events[1], ProviderEvent::Audio { .. }));

        // Second delta: no further first_audio_ready.
        let effects = core.on_server_event(ServerEvent::AudioDelta(vec![0; 100]), 1_350);
        let events = emitted(&effects);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProviderEvent::Audio { .. }));
    }

    #[test]
    fn cancel_drops_subsequent_deltas_and_done() {
        let mut core = ProviderCore::new();
        core.on_server_event(ServerEvent::ResponseCreated, 1_000);
        core.on_cancel();
        assert!(!core.responding());
        assert_eq!(core.epoch(), 1);

        let effects = core.on_server_event(ServerEvent::AudioDelta(vec![0; 100]), 1_100);
        assert!(effects.is_empty());

        let effects = core.on_server_event(ServerEvent::ResponseDone, 1_200);
        assert!(effects.is_empty());
    }

    #[test]
    fn cancel_leaves_input_buffer_alone() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_cancel();
        assert!(core.buffered_ms() > 0.0);
    }

    #[test]
    fn clear_input_resets_everything_input_side() {
        let mut core = ProviderCore::new();
        core.append_audio(&vec![0u8; 9600], 1_000);
        core.on_server_event(ServerEvent::SpeechStarted, 1_010);
        core.on_commit_sent();
        core.clear_input();
        assert_eq!(core.buffered_ms(), 0.0);
        assert!(!core.speech_detected());
        assert!(!core.pending_commit());
    }

    #[test]
    fn response_done_emits_end_once() {
        let mut core = ProviderCore::new();
        core.on_server_event(ServerEvent::ResponseCreated, 1_000);
        let effects = core.on_server_event(ServerEvent::ResponseDone, 2_000);
        match emitted(&effects).as_slice() {
            [ProviderEvent::ResponseEnd { truncated, .. }] => assert!(!truncated),
            other => panic!("expected ResponseEnd, got {other:?}"),
        }
        // A duplicate done is absorbed.
        assert!(core.on_server_event(ServerEvent::ResponseDone, 2_001).is_empty());
    }

    #[test]
    fn transport_close_mid_response_truncates() {
        let mut core = ProviderCore::new();
        core.on_server_event(ServerEvent::ResponseCreated, 1_000);
        let effects = core.on_transport_closed();
        match effects.as_slice() {
            [Effect::Emit(ProviderEvent::ResponseEnd { truncated, .. })] => assert!(truncated),
            other => panic!("expected truncated ResponseEnd, got {other:?}"),
        }
        assert!(core.on_transport_closed().is_empty());
    }

    #[test]
    fn fatal_error_classification() {
        assert!(is_fatal_upstream_error("invalid_api_key", "bad key"));
        assert!(is_fatal_upstream_error("", "Authentication failed"));
        assert!(!is_fatal_upstream_error(COMMIT_EMPTY_CODE, "too small"));
        assert!(!is_fatal_upstream_error("rate_limit", "slow down"));
    }
}
