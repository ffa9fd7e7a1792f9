//! Fallback planner.
//!
//! When policy cancels in-flight output the arbitrator swaps the speaker
//! to a pre-approved utterance. The mode comes from (in order) explicit
//! configuration, the decision payload, then a mapping from the decision
//! itself. Audio is synthesized once per phrase and cached; if the TTS
//! collaborator fails, a tone of matching duration fills the slot.

use super::reflex::PlaybackHandle;
use super::{reflex, PlaybackEvent};
use crate::audio;
use crate::config::{FallbackConfig, FallbackMode};
use crate::policy::Decision;
use crate::tts::{ToneTts, TtsService};
use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Hard-coded safe line per mode, used when the configured pool is empty.
fn default_phrase(mode: FallbackMode) -> &'static str {
    match mode {
        FallbackMode::Auto | FallbackMode::RefusePolitely => {
            "I'm sorry, but I can't help with that. Is there something else I can do for you?"
        }
        FallbackMode::AskClarifyingQuestion => {
            "Could you tell me a bit more about what you're looking for?"
        }
        FallbackMode::SwitchToTextSummary => {
            "Let me send you a short text summary instead."
        }
        FallbackMode::EscalateToHuman => {
            "Let me connect you with a human teammate who can help."
        }
        FallbackMode::OfferEmailOrLink => {
            "I can send you an email with more details if you'd like."
        }
    }
}

/// Resolve the effective mode: explicit config beats the decision payload,
/// which beats the decision mapping.
pub fn resolve_mode(
    configured: FallbackMode,
    payload_mode: Option<FallbackMode>,
    decision: Decision,
) -> FallbackMode {
    if configured != FallbackMode::Auto {
        return configured;
    }
    if let Some(mode) = payload_mode {
        if mode != FallbackMode::Auto {
            return mode;
        }
    }
    match decision {
        Decision::Escalate => FallbackMode::EscalateToHuman,
        _ => FallbackMode::RefusePolitely,
    }
}

/// Fallback utterance player for one session.
pub struct FallbackPlanner {
    config: FallbackConfig,
    tts: Arc<dyn TtsService>,
    /// Synthesized clips keyed by phrase; entries are immutable.
    cache: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    active: Mutex<Option<CancellationToken>>,
}

impl FallbackPlanner {
    pub fn new(config: FallbackConfig, tts: Arc<dyn TtsService>) -> Self {
        Self {
            config,
            tts,
            cache: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// Pick the phrase for a resolved mode.
    fn pick_phrase(&self, mode: FallbackMode) -> String {
        if self.config.phrases.is_empty() {
            return default_phrase(mode).to_string();
        }
        let idx = rand::rng().random_range(0..self.config.phrases.len());
        self.config.phrases[idx].clone()
    }

    /// Synthesize (or reuse) the clip for a phrase.
    async fn clip_for(&self, phrase: &str) -> Arc<Vec<u8>> {
        if let Some(clip) = self.cache.lock().get(phrase).cloned() {
            return clip;
        }
        let clip = match self.tts.synthesize(phrase).await {
            Ok(pcm) => Arc::new(pcm),
            Err(e) => {
                tracing::warn!(error = %e, "Fallback TTS failed, substituting tone");
                Arc::new(audio::synth_tone(ToneTts::duration_for(phrase), 440.0))
            }
        };
        self.cache
            .lock()
            .insert(phrase.to_string(), Arc::clone(&clip));
        clip
    }

    /// Start playing the fallback utterance for a decision.
    ///
    /// Any previous playback is stopped first; chunks stream into `out` on
    /// the 100 ms cadence, ending with a single `Done` event.
    pub async fn start(
        &self,
        decision: Decision,
        payload_mode: Option<FallbackMode>,
        out: mpsc::Sender<PlaybackEvent>,
    ) -> PlaybackHandle {
        let mode = resolve_mode(self.config.mode, payload_mode, decision);
        let phrase = self.pick_phrase(mode);
        tracing::info!(
            mode = ?mode,
            phrase = %phrase,
            "Playing fallback utterance"
        );
        let clip = self.clip_for(&phrase).await;

        let token = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if let Some(prev) = active.take() {
                prev.cancel();
            }
            *active = Some(token.clone());
        }

        let task_token = token.clone();
        tokio::spawn(async move {
            reflex::stream_clip(clip, out, task_token).await;
        });
        PlaybackHandle::from_token(token)
    }

    /// Stop the current playback, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self.active.lock().take() {
            token.cancel();
        }
    }
}
