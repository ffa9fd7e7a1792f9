//! Text-to-speech collaborator interface.
//!
//! Synthesis itself is outside the orchestration core; Lane A and the
//! fallback planner only need "text in, PCM16 24 kHz out". The tone
//! synthesizer stands in when no real service is wired up and doubles as
//! the deterministic test implementation.

use crate::audio;
use async_trait::async_trait;

/// Synthesize one phrase to PCM16 mono at the gateway sample rate.
#[async_trait]
pub trait TtsService: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}

/// Deterministic stand-in: a quiet tone whose duration scales with the
/// word count, so playback timing behaves like real speech.
pub struct ToneTts {
    freq_hz: f64,
}

impl ToneTts {
    pub fn new() -> Self {
        Self { freq_hz: 440.0 }
    }

    /// Duration model: 150 ms floor plus 180 ms per word.
    pub fn duration_for(text: &str) -> u64 {
        let words = text.split_whitespace().count().max(1) as u64;
        150 + words * 180
    }
}

impl Default for ToneTts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsService for ToneTts {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        Ok(audio::synth_tone(Self::duration_for(text), self.freq_hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tone_tts_duration_scales_with_words() {
        let tts = ToneTts::new();
        let short = tts.synthesize("Okay").await.unwrap();
        let long = tts.synthesize("let me check that for you").await.unwrap();
        assert!(long.len() > short.len());
        // 1 word → 330 ms → 15840 bytes
        assert_eq!(short.len(), audio::bytes_for_ms(330));
    }

    #[test]
    fn duration_floor_applies_to_empty_text() {
        assert_eq!(ToneTts::duration_for(""), 330);
    }
}
