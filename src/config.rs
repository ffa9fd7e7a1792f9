//! Typed configuration for the voice orchestration core.
//!
//! The embedding application (CLI, service wrapper) is responsible for
//! loading these from disk or environment; the core only consumes the
//! structs. Every timing knob carries the production default so a
//! `GatewayConfig::default()` is a working configuration apart from the
//! upstream credential.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upstream realtime provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// WebSocket endpoint of the realtime API.
    pub endpoint: String,
    /// API credential sent as a bearer token.
    pub api_key: String,
    /// Model identifier appended to the endpoint query.
    pub model: String,
    /// Voice id used for synthesized output.
    pub voice: String,
    /// How long to wait for `session.created` before failing the connect.
    pub connect_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.openai.com/v1/realtime".into(),
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Lane arbitration timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratorConfig {
    /// Whether the reflex lane is armed at all.
    pub lane_a_enabled: bool,
    /// Delay between user speech end and the reflex firing.
    pub min_delay_before_reflex_ms: u64,
    /// Hard cap on reflex playback before it is stopped.
    pub max_reflex_duration_ms: u64,
    /// Minimum wall-clock gap between stopping one owner and starting another.
    pub transition_gap_ms: u64,
    /// Barge-in debounce: speech shorter than this does not preempt.
    pub preempt_threshold_ms: u64,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            lane_a_enabled: true,
            min_delay_before_reflex_ms: 100,
            max_reflex_duration_ms: 2000,
            transition_gap_ms: 10,
            preempt_threshold_ms: 300,
        }
    }
}

/// PII handling mode for the policy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiMode {
    /// Replace detected spans with `[KIND_REDACTED]` markers.
    #[default]
    Redact,
    /// Record the detection but leave the text untouched.
    Flag,
}

/// Policy engine (Lane C) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Run the PII detector at all.
    pub enable_pii_redaction: bool,
    /// Redact vs flag-only behavior.
    pub pii_redaction_mode: PiiMode,
    /// Severity at or above which a `refuse` escalates to `cancel_output`.
    pub cancel_output_threshold: u8,
    /// Evaluate streaming transcript deltas, not only finals.
    pub evaluate_deltas: bool,
    /// Moderation category names to enable, in match-priority order.
    /// Empty means the built-in default ordering.
    pub moderation_categories: Vec<String>,
    /// How often session metrics are flushed as `control.metrics`.
    pub metrics_flush_interval_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enable_pii_redaction: true,
            pii_redaction_mode: PiiMode::Redact,
            cancel_output_threshold: 4,
            evaluate_deltas: false,
            moderation_categories: Vec::new(),
            metrics_flush_interval_ms: 30_000,
        }
    }
}

/// Fallback utterance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Resolve from the triggering policy decision.
    #[default]
    Auto,
    RefusePolitely,
    AskClarifyingQuestion,
    SwitchToTextSummary,
    EscalateToHuman,
    OfferEmailOrLink,
}

/// Fallback planner settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Explicit mode override; `Auto` defers to the decision payload.
    pub mode: FallbackMode,
    /// Phrase pool per mode; empty pools fall back to a built-in safe line.
    pub phrases: Vec<String>,
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Enable WAL journal mode on open.
    pub wal_mode: bool,
    /// Directory for per-session JSONL timelines.
    pub jsonl_dir: PathBuf,
    /// Persist final transcripts (false replaces snippets with `[REDACTED]`).
    pub include_transcripts: bool,
    /// Persist streaming transcript deltas too.
    pub include_transcript_deltas: bool,
    /// Persist audio chunk events (payload bytes become base64).
    pub include_audio: bool,
    /// Persist session lifecycle events.
    pub include_session_events: bool,
    /// Persist `response.metadata` events.
    pub include_response_metadata: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: PathBuf::from("voxgate.db"),
            wal_mode: true,
            jsonl_dir: PathBuf::from("audit"),
            include_transcripts: true,
            include_transcript_deltas: false,
            include_audio: false,
            include_session_events: true,
            include_response_metadata: false,
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle minutes before a session is auto-ended with reason `timeout`.
    pub max_idle_minutes: u64,
    /// Grace period between `session.end` and in-memory removal.
    pub delete_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_minutes: 30,
            delete_grace_ms: 5_000,
        }
    }
}

/// Reflex lane (Lane A) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexConfig {
    pub enabled: bool,
    /// Acknowledgement whitelist; keys into the preloaded TTS cache.
    pub phrases: Vec<String>,
    /// Relative selection weights, parallel to `phrases`. Missing entries
    /// default to weight 1.
    pub weights: Vec<u32>,
    /// Max preloaded clips kept in the LRU cache.
    pub cache_capacity: usize,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrases: vec![
                "Mmhmm".into(),
                "Yeah".into(),
                "Okay".into(),
                "Right".into(),
                "Got it".into(),
            ],
            weights: vec![3, 2, 2, 1, 1],
            cache_capacity: 16,
        }
    }
}

/// Top-level configuration for one gateway process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub provider: ProviderConfig,
    pub arbitrator: ArbitratorConfig,
    pub policy: PolicyConfig,
    pub fallback: FallbackConfig,
    pub audit: AuditConfig,
    pub session: SessionConfig,
    pub reflex: ReflexConfig,
}
