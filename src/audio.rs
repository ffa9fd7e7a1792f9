//! PCM16 audio helpers.
//!
//! Everything in the gateway is PCM16 little-endian, mono, 24 kHz. Data is
//! base64 inside JSON frames and raw bytes everywhere else.

use base64::Engine;

/// Sample rate used in both directions.
pub const SAMPLE_RATE: u32 = 24_000;

/// Bytes per sample (PCM16).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Bytes in one 100 ms playback chunk at 24 kHz.
pub const CHUNK_100MS_BYTES: usize = (SAMPLE_RATE as usize / 10) * BYTES_PER_SAMPLE;

/// Cap on the provider append buffer: 5 seconds of PCM.
pub const APPEND_BUFFER_CAP_BYTES: usize = SAMPLE_RATE as usize * BYTES_PER_SAMPLE * 5;

/// Duration represented by `bytes` of PCM16 at the gateway sample rate.
pub fn duration_ms(bytes: usize) -> f64 {
    bytes as f64 * 1000.0 / (SAMPLE_RATE as f64 * BYTES_PER_SAMPLE as f64)
}

/// Byte count for a duration at the gateway sample rate, rounded down to a
/// whole sample.
pub fn bytes_for_ms(ms: u64) -> usize {
    let bytes = (ms as usize * SAMPLE_RATE as usize * BYTES_PER_SAMPLE) / 1000;
    bytes & !1
}

/// Encode PCM bytes for a JSON frame.
pub fn encode_base64(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

/// Decode a JSON audio payload back to raw PCM bytes.
pub fn decode_base64(data: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow::anyhow!("invalid base64 audio payload: {e}"))
}

// ── Append ring buffer ─────────────────────────────────────────────

/// Bounded append buffer for not-yet-committed input audio.
///
/// Appends past the 5-second cap overwrite the oldest bytes. The cap is a
/// memory bound, not an expected code path; normal turns commit well under
/// it.
#[derive(Debug, Default)]
pub struct AppendBuffer {
    data: Vec<u8>,
}

impl AppendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append PCM bytes, dropping the oldest bytes past the cap.
    pub fn append(&mut self, pcm: &[u8]) {
        if pcm.len() >= APPEND_BUFFER_CAP_BYTES {
            self.data.clear();
            self.data
                .extend_from_slice(&pcm[pcm.len() - APPEND_BUFFER_CAP_BYTES..]);
            return;
        }
        self.data.extend_from_slice(pcm);
        if self.data.len() > APPEND_BUFFER_CAP_BYTES {
            let excess = self.data.len() - APPEND_BUFFER_CAP_BYTES;
            self.data.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration_ms(&self) -> f64 {
        duration_ms(self.data.len())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

// ── Resampling ─────────────────────────────────────────────────────

/// Linear resampling between PCM16 sample rates.
///
/// Good enough for acknowledgement clips and fallback tones; the provider
/// path never resamples.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = input[idx.min(input.len() - 1)] as f64;
        let b = input[(idx + 1).min(input.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

/// Reinterpret little-endian PCM16 bytes as samples.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Serialize samples back to little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

// ── Tone synthesis ─────────────────────────────────────────────────

/// Synthesize a quiet sine tone of the given duration.
///
/// Used when the TTS collaborator fails and the fallback planner still has
/// to occupy the speaker for a matching duration.
pub fn synth_tone(duration_ms: u64, freq_hz: f64) -> Vec<u8> {
    let sample_count = (SAMPLE_RATE as u64 * duration_ms / 1000) as usize;
    let mut samples = Vec::with_capacity(sample_count);
    let amplitude = 0.12 * i16::MAX as f64;
    for n in 0..sample_count {
        let t = n as f64 / SAMPLE_RATE as f64;
        let v = (t * freq_hz * std::f64::consts::TAU).sin() * amplitude;
        samples.push(v as i16);
    }
    samples_to_bytes(&samples)
}
