//! Lane A: reflex acknowledgements.
//!
//! A fixed whitelist of short phrases ("Mmhmm", "Yeah", "Okay") is
//! synthesized once at construction and kept in an LRU map keyed by the
//! lowercased phrase. `start` picks a phrase by weighted random and streams
//! it in 100 ms chunks on a wall-clock cadence; the arbitrator stops it by
//! cancelling the playback handle. Disabled mode is a silent no-op.

use super::{PlaybackEvent, StopReason};
use crate::audio::CHUNK_100MS_BYTES;
use crate::config::ReflexConfig;
use crate::tts::TtsService;
use parking_lot::Mutex;
use rand::RngExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Clip cache ─────────────────────────────────────────────────────

/// Small LRU of synthesized clips keyed by lowercased phrase.
struct ClipCache {
    map: HashMap<String, Arc<Vec<u8>>>,
    order: VecDeque<String>,
    cap: usize,
}

impl ClipCache {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(clip) = self.map.get(key).cloned() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
            Some(clip)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, clip: Vec<u8>) {
        if self.map.len() >= self.cap && !self.map.contains_key(&key) {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.retain(|k| k != &key);
        self.order.push_back(key.clone());
        self.map.insert(key, Arc::new(clip));
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Handle for a single playback stream.
pub struct PlaybackHandle {
    token: CancellationToken,
}

impl PlaybackHandle {
    /// Idempotent stop. The stream emits `Done { Stopped }` once.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Handle for a playback that never started (lane disabled).
    fn inert() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self { token }
    }

    pub(super) fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }
}

/// Lane A engine.
pub struct ReflexEngine {
    config: ReflexConfig,
    cache: Mutex<ClipCache>,
}

impl ReflexEngine {
    /// Build the engine and preload TTS audio for the whitelist.
    pub async fn new(config: ReflexConfig, tts: Arc<dyn TtsService>) -> Self {
        let mut cache = ClipCache::new(config.cache_capacity);
        if config.enabled {
            for phrase in &config.phrases {
                match tts.synthesize(phrase).await {
                    Ok(clip) => cache.put(phrase.to_lowercase(), clip),
                    Err(e) => {
                        tracing::warn!(phrase = %phrase, error = %e, "Reflex preload failed");
                    }
                }
            }
            tracing::info!(clips = cache.len(), "Reflex clips preloaded");
        }
        Self {
            config,
            cache: Mutex::new(cache),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Weighted random phrase from the whitelist.
    fn pick_phrase(&self) -> Option<String> {
        if self.config.phrases.is_empty() {
            return None;
        }
        let weights: Vec<u32> = self
            .config
            .phrases
            .iter()
            .enumerate()
            .map(|(i, _)| self.config.weights.get(i).copied().unwrap_or(1).max(1))
            .collect();
        let total: u32 = weights.iter().sum();
        let mut roll = rand::rng().random_range(0..total);
        for (phrase, weight) in self.config.phrases.iter().zip(weights) {
            if roll < weight {
                return Some(phrase.clone());
            }
            roll -= weight;
        }
        self.config.phrases.first().cloned()
    }

    /// Start a reflex playback, streaming chunks into `out`.
    ///
    /// Returns the stop handle. When the lane is disabled (or no clip is
    /// cached) nothing is streamed and the handle is inert.
    pub fn start(&self, out: mpsc::Sender<PlaybackEvent>) -> PlaybackHandle {
        if !self.config.enabled {
            return PlaybackHandle::inert();
        }
        let Some(phrase) = self.pick_phrase() else {
            return PlaybackHandle::inert();
        };
        let Some(clip) = self.cache.lock().get(&phrase.to_lowercase()) else {
            tracing::warn!(phrase = %phrase, "No cached reflex clip");
            return PlaybackHandle::inert();
        };

        tracing::debug!(phrase = %phrase, bytes = clip.len(), "Playing reflex");

        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            stream_clip(clip, out, task_token).await;
        });
        PlaybackHandle { token }
    }
}

/// Stream a clip as 100 ms chunks on a wall-clock cadence.
pub(super) async fn stream_clip(
    clip: Arc<Vec<u8>>,
    out: mpsc::Sender<PlaybackEvent>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(100));
    let mut offset = 0usize;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = out
                    .send(PlaybackEvent::Done { reason: StopReason::Stopped })
                    .await;
                return;
            }
            _ = interval.tick() => {
                if offset >= clip.len() {
                    let _ = out
                        .send(PlaybackEvent::Done { reason: StopReason::Done })
                        .await;
                    return;
                }
                let end = (offset + CHUNK_100MS_BYTES).min(clip.len());
                if out
                    .send(PlaybackEvent::Chunk(clip[offset..end].to_vec()))
                    .await
                    .is_err()
                {
                    return;
                }
                offset = end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::ToneTts;

    fn config() -> ReflexConfig {
        ReflexConfig::default()
    }

    async fn engine(enabled: bool) -> ReflexEngine {
        let mut c = config();
        c.enabled = enabled;
        ReflexEngine::new(c, Arc::new(ToneTts::new())).await
    }

    #[tokio::test]
    async fn preload_fills_cache() {
        let e = engine(true).await;
        assert_eq!(e.cache.lock().len(), config().phrases.len());
    }

    #[tokio::test]
    async fn disabled_engine_is_silent() {
        let e = engine(false).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = e.start(tx);
        drop(e);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn playback_streams_chunks_then_done() {
        let e = engine(true).await;
        let (tx, mut rx) = mpsc::channel(64);
        let _handle = e.start(tx);

        let mut chunks = 0;
        loop {
            match rx.recv().await.unwrap() {
                PlaybackEvent::Chunk(c) => {
                    assert!(c.len() <= CHUNK_100MS_BYTES);
                    chunks += 1;
                }
                PlaybackEvent::Done { reason } => {
                    assert_eq!(reason, StopReason::Done);
                    break;
                }
            }
        }
        // Shortest default phrase is one word → 330 ms → 4 chunks.
        assert!(chunks >= 4, "only {chunks} chunks");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_emits_stopped_once() {
        let e = engine(true).await;
        let (tx, mut rx) = mpsc::channel(64);
        let handle = e.start(tx);

        // First chunk arrives on the immediate tick.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, PlaybackEvent::Chunk(_)));

        handle.stop();
        handle.stop(); // idempotent

        let mut done_count = 0;
        while let Some(ev) = rx.recv().await {
            if let PlaybackEvent::Done { reason } = ev {
                assert_eq!(reason, StopReason::Stopped);
                done_count += 1;
            }
        }
        assert_eq!(done_count, 1);
    }

    #[tokio::test]
    async fn weighted_pick_respects_whitelist() {
        let e = engine(true).await;
        for _ in 0..50 {
            let phrase = e.pick_phrase().unwrap();
            assert!(config().phrases.contains(&phrase));
        }
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache = ClipCache::new(2);
        cache.put("a".into(), vec![1]);
        cache.put("b".into(), vec![2]);
        // Touch "a" so "b" is the eviction candidate.
        cache.get("a");
        cache.put("c".into(), vec![3]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }
}
