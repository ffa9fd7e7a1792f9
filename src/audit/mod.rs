//! Audit trail adapter.
//!
//! Subscribes to the bus per its flag set and writes every accepted event
//! to the relational store and a per-session JSONL timeline. Database
//! failures are logged, never thrown; with both sinks unavailable the
//! event still lands in the process log. Ingest is FK-safe: the parent
//! session row is created before any event row.

pub mod jsonl;

use crate::bus::{event_type, Event, EventBus, EventSource, SubscriptionId};
use crate::config::AuditConfig;
use crate::storage::{AuditEventRow, SqlStore};
use base64::Engine;
use jsonl::JsonlWriter;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Event types accepted regardless of flags.
const BASE_TYPES: [&str; 4] = [
    event_type::CONTROL_AUDIT,
    event_type::CONTROL_OVERRIDE,
    event_type::CONTROL_METRICS,
    event_type::POLICY_DECISION,
];

/// Policy/control types accepted only from Lane C.
const LANE_C_ONLY: [&str; 3] = [
    event_type::POLICY_DECISION,
    event_type::CONTROL_AUDIT,
    event_type::CONTROL_METRICS,
];

pub struct AuditTrail {
    config: AuditConfig,
    bus: Arc<EventBus>,
    store: Option<Arc<SqlStore>>,
    jsonl: Option<Arc<JsonlWriter>>,
    subs: Mutex<Vec<SubscriptionId>>,
    started: AtomicBool,
}

impl AuditTrail {
    pub fn new(config: AuditConfig, bus: Arc<EventBus>, store: Option<Arc<SqlStore>>) -> Arc<Self> {
        let jsonl = if config.enabled {
            match JsonlWriter::new(&config.jsonl_dir) {
                Ok(writer) => Some(Arc::new(writer)),
                Err(e) => {
                    tracing::error!(error = %e, "JSONL writer unavailable");
                    None
                }
            }
        } else {
            None
        };

        Arc::new(Self {
            config,
            bus,
            store,
            jsonl,
            subs: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe per the flag set. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut types: Vec<&str> = BASE_TYPES.to_vec();
        if self.config.include_transcripts || self.config.include_transcript_deltas {
            types.push(event_type::TRANSCRIPT);
            types.push(event_type::USER_TRANSCRIPT);
        }
        if self.config.include_audio {
            types.push(event_type::AUDIO);
            types.push(event_type::FIRST_AUDIO_READY);
        }
        if self.config.include_session_events {
            types.push(event_type::SESSION_START);
            types.push(event_type::SESSION_END);
            types.push(event_type::SESSION_ERROR);
        }
        if self.config.include_response_metadata {
            types.push(event_type::RESPONSE_METADATA);
        }

        let mut subs = self.subs.lock();
        for ty in types {
            let weak: Weak<Self> = Arc::downgrade(self);
            let id = self.bus.on(
                ty,
                Arc::new(move |event| {
                    if let Some(trail) = weak.upgrade() {
                        trail.ingest(event);
                    }
                    Ok(())
                }),
            );
            subs.push(id);
        }
        tracing::info!(subscriptions = subs.len(), "Audit trail started");
    }

    /// Unsubscribe everything.
    pub fn stop(&self) {
        for id in self.subs.lock().drain(..) {
            self.bus.off(id);
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn ingest(&self, event: &Event) {
        // Defensive dedup: policy/control events only from Lane C.
        if LANE_C_ONLY.contains(&event.event_type.as_str()) && event.source != EventSource::LaneC {
            tracing::debug!(
                event_type = %event.event_type,
                source = event.source.as_str(),
                "Rejecting policy event from non-laneC source"
            );
            return;
        }

        // Transcript deltas only when asked for.
        let is_transcript = event.event_type == event_type::TRANSCRIPT
            || event.event_type == event_type::USER_TRANSCRIPT;
        if is_transcript {
            let is_final = event
                .payload
                .get("isFinal")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if is_final && !self.config.include_transcripts {
                return;
            }
            if !is_final && !self.config.include_transcript_deltas {
                return;
            }
        }

        let event = self.sanitize(event.clone());
        let mut persisted = false;

        if let Some(store) = &self.store {
            let row = AuditEventRow {
                event_id: event.event_id.clone(),
                session_id: event.session_id.clone(),
                event_type: event.event_type.clone(),
                source: event.source.as_str().to_string(),
                timestamp_ms: event.t_ms,
                payload: event.payload.to_string(),
            };
            match store.insert_audit_event(&row) {
                Ok(()) => persisted = true,
                Err(e) => {
                    tracing::error!(
                        session_id = %event.session_id,
                        event_type = %event.event_type,
                        error = %e,
                        "Audit DB write failed"
                    );
                }
            }
        }

        if let Some(jsonl) = &self.jsonl {
            match jsonl.append(&event) {
                Ok(()) => persisted = true,
                Err(e) => {
                    tracing::error!(
                        session_id = %event.session_id,
                        error = %e,
                        "Audit JSONL append failed"
                    );
                }
            }
            if event.event_type == event_type::SESSION_END {
                jsonl.close_session(&event.session_id);
            }
        }

        if !persisted {
            // Last resort: the process log is the audit record.
            tracing::info!(
                session_id = %event.session_id,
                event_type = %event.event_type,
                payload = %event.payload,
                "AUDIT (no sink available)"
            );
        }
    }

    /// Apply the configured sanitization to an event before persistence.
    fn sanitize(&self, mut event: Event) -> Event {
        if !self.config.include_transcripts {
            if let Some(snippet) = event.payload.get_mut("textSnippet") {
                *snippet = Value::String("[REDACTED]".into());
            }
        }

        if self.config.include_audio {
            let mut encoded_any = false;
            for key in ["data", "chunk"] {
                let Some(value) = event.payload.get(key) else {
                    continue;
                };
                if let Some(bytes) = as_byte_array(value) {
                    let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    event.payload[key] = Value::String(b64);
                    encoded_any = true;
                }
            }
            if encoded_any {
                event.payload["data_encoding"] = Value::String("base64".into());
            }
        }

        event
    }

    /// Stream the session's JSONL, filter, sort by `t_ms`.
    pub fn load_session_timeline(
        &self,
        session_id: &str,
        types: Option<&[String]>,
    ) -> anyhow::Result<Vec<Event>> {
        jsonl::load_session_timeline(&self.config.jsonl_dir, session_id, types)
    }

    /// Load and (optionally) re-emit the session's timeline.
    pub fn replay_session_timeline(
        &self,
        session_id: &str,
        emit: bool,
    ) -> anyhow::Result<Vec<Event>> {
        let bus = emit.then_some(&*self.bus);
        jsonl::replay_session_timeline(&self.config.jsonl_dir, session_id, bus)
    }
}

/// Interpret a JSON array of 0-255 numbers as bytes.
fn as_byte_array(value: &Value) -> Option<Vec<u8>> {
    let array = value.as_array()?;
    let mut bytes = Vec::with_capacity(array.len());
    for item in array {
        let n = item.as_u64()?;
        if n > 255 {
            return None;
        }
        bytes.push(n as u8);
    }
    Some(bytes)
}
