//! Voxgate: server-side orchestration core for a realtime voice-AI gateway.
//!
//! Each connected client holds a full-duplex audio conversation with an
//! upstream realtime AI provider; this crate sits between them and does
//! the hard parts:
//!
//! - **Provider adapter** — one upstream session per client, enforcing the
//!   buffer-commit protocol that prevents the empty-buffer race
//!   (`response.create` only after `input_audio_buffer.committed`).
//! - **Lane arbitrator** — a state machine choosing the single audio owner
//!   at every instant: fast reflex acknowledgement (Lane A), the full AI
//!   response (Lane B), or a safe fallback.
//! - **Session manager + event bus** — per-session ordered pub/sub as the
//!   sole integration surface between components.
//! - **Policy engine (Lane C)** — PII → moderation → claims pipeline with
//!   an override controller that can cancel in-flight audio.
//! - **Audit trail** — append-only dual persistence (SQLite + JSONL) with
//!   FK-safe ingest and deterministic timeline replay.
//!
//! Transport framing, browser capture/playback, and TTS synthesis live
//! outside the crate and are reached through the interfaces in [`wire`],
//! [`runtime`], and [`tts`].

pub mod audio;
pub mod audit;
pub mod bus;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod lanes;
pub mod policy;
pub mod provider;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod tts;
pub mod wire;

pub use bus::{Event, EventBus, EventSource};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GatewayConfig;
pub use error::{ProviderError, StorageError};
pub use lanes::{LaneArbitrator, LaneState, Owner};
pub use policy::{Decision, PolicyDecision, PolicyEngine};
pub use provider::{OpenAiRealtimeClient, ProviderEvent, RealtimeProvider, VoiceMode};
pub use runtime::{Gateway, RuntimeHandle};
pub use session::{SessionManager, SessionState};
pub use storage::SqlStore;
pub use wire::{ClientMessage, ServerMessage};
