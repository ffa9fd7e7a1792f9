//! Response lanes and their arbitration.
//!
//! - `arbitrator` — chooses the current audio owner
//! - `reflex` — Lane A, pre-cached short acknowledgements
//! - `primary` — Lane B, the provider-backed response stream
//! - `fallback` — pre-approved utterances substituted when policy cancels

pub mod arbitrator;
pub mod fallback;
pub mod primary;
pub mod reflex;

use serde::Serialize;

/// Why a playback stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Ran to the natural end of the clip.
    Done,
    /// Stopped by the arbitrator or a barge-in.
    Stopped,
}

/// Audio and lifecycle output of a playback lane (reflex or fallback).
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// One 100 ms PCM16 chunk.
    Chunk(Vec<u8>),
    /// Stream finished; emitted at most once per playback.
    Done { reason: StopReason },
}

pub use arbitrator::{ArbiterAction, ArbiterEvent, LaneArbitrator, LaneState, Owner, TimerKind};
