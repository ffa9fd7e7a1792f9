//! In-process event bus.
//!
//! Every observable transition in the gateway flows through here: lane
//! changes, policy decisions, transcripts, audio chunks, session lifecycle.
//! Delivery is synchronous on the emitting task; ordering is guaranteed
//! within one session and within one event type, nothing more.
//!
//! The bus is owned by the session runtime that constructs it and passed
//! explicitly to components; there is no process-global instance.

use crate::clock::SharedClock;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ── Event model ────────────────────────────────────────────────────

/// Component that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventSource {
    LaneA,
    LaneB,
    LaneC,
    Orchestrator,
    Client,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LaneA => "laneA",
            Self::LaneB => "laneB",
            Self::LaneC => "laneC",
            Self::Orchestrator => "orchestrator",
            Self::Client => "client",
        }
    }

    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s {
            "laneA" => Some(Self::LaneA),
            "laneB" => Some(Self::LaneB),
            "laneC" => Some(Self::LaneC),
            "orchestrator" => Some(Self::Orchestrator),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// Well-known event type strings.
pub mod event_type {
    pub const SESSION_START: &str = "session.start";
    pub const SESSION_END: &str = "session.end";
    pub const SESSION_ERROR: &str = "session.error";
    pub const RESPONSE_START: &str = "response_start";
    pub const RESPONSE_END: &str = "response_end";
    pub const FIRST_AUDIO_READY: &str = "first_audio_ready";
    pub const AUDIO: &str = "audio";
    pub const TRANSCRIPT: &str = "transcript";
    pub const USER_TRANSCRIPT: &str = "user_transcript";
    pub const RESPONSE_METADATA: &str = "response.metadata";
    pub const RESPONSE_COMPLETE: &str = "response_complete";
    pub const LANE_STATE_CHANGED: &str = "lane.state_changed";
    pub const LANE_OWNER_CHANGED: &str = "lane.owner_changed";
    pub const POLICY_DECISION: &str = "policy.decision";
    pub const CONTROL_AUDIT: &str = "control.audit";
    pub const CONTROL_OVERRIDE: &str = "control.override";
    pub const CONTROL_METRICS: &str = "control.metrics";
    pub const ERROR: &str = "error";
}

/// The bus's atomic unit. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub session_id: String,
    /// Monotonic epoch milliseconds, non-decreasing per session.
    pub t_ms: u64,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

impl Event {
    pub fn new(
        session_id: impl Into<String>,
        source: EventSource,
        event_type: impl Into<String>,
        payload: Value,
        clock: &SharedClock,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            t_ms: clock.now_ms(),
            source,
            event_type: event_type.into(),
            payload,
        }
    }
}

// ── Bus ────────────────────────────────────────────────────────────

/// Handler outcome is logged, never propagated to the emitter.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Opaque subscription handle for `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-process pub/sub keyed by event type and by session id.
pub struct EventBus {
    by_type: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    by_session: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    /// Last stamped timestamp per session; enforces monotonicity.
    last_ms: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_type: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            last_ms: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to one event type across all sessions.
    pub fn on(&self, event_type: &str, handler: Handler) -> SubscriptionId {
        let id = self.next_id();
        self.by_type
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a type-keyed subscription.
    pub fn off(&self, id: SubscriptionId) {
        let mut map = self.by_type.write();
        for handlers in map.values_mut() {
            handlers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Subscribe to every event of one session.
    pub fn on_session(&self, session_id: &str, handler: Handler) -> SubscriptionId {
        let id = self.next_id();
        self.by_session
            .write()
            .entry(session_id.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Drop all session-keyed handlers for a session. Called at session end
    /// so subscriber maps do not leak.
    pub fn off_session(&self, session_id: &str) {
        self.by_session.write().remove(session_id);
    }

    /// Fan an event out to type-keyed then session-keyed subscribers.
    ///
    /// The timestamp is clamped so it never goes backwards within a
    /// session. Handler lists are snapshotted before invocation, so a
    /// handler may emit further events without deadlocking.
    pub fn emit(&self, mut event: Event) {
        {
            let mut last = self.last_ms.lock();
            let entry = last.entry(event.session_id.clone()).or_insert(0);
            if event.t_ms < *entry {
                event.t_ms = *entry;
            }
            *entry = event.t_ms;
        }

        let type_handlers: Vec<Handler> = self
            .by_type
            .read()
            .get(&event.event_type)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        let session_handlers: Vec<Handler> = self
            .by_session
            .read()
            .get(&event.session_id)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in type_handlers.iter().chain(session_handlers.iter()) {
            if let Err(e) = handler(&event) {
                tracing::warn!(
                    session_id = %event.session_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event handler failed"
                );
            }
        }
    }

    /// Forget the monotonic watermark for a session (after final removal).
    pub fn forget_session(&self, session_id: &str) {
        self.last_ms.lock().remove(session_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            by_type: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            last_ms: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn test_clock() -> (Arc<ManualClock>, SharedClock) {
        let manual = ManualClock::new(1_000);
        let shared: SharedClock = manual.clone();
        (manual, shared)
    }

    fn make_event(clock: &SharedClock, session: &str, ty: &str) -> Event {
        Event::new(session, EventSource::Orchestrator, ty, json!({}), clock)
    }

    #[test]
    fn type_subscription_receives_matching_events() {
        let bus = EventBus::new();
        let (_, clock) = test_clock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        bus.on(
            "transcript",
            Arc::new(move |e| {
                seen_clone.lock().push(e.event_type.clone());
                Ok(())
            }),
        );

        bus.emit(make_event(&clock, "s1", "transcript"));
        bus.emit(make_event(&clock, "s1", "audio"));

        assert_eq!(seen.lock().as_slice(), ["transcript"]);
    }

    #[test]
    fn session_subscription_receives_all_types() {
        let bus = EventBus::new();
        let (_, clock) = test_clock();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        bus.on_session(
            "s1",
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.emit(make_event(&clock, "s1", "transcript"));
        bus.emit(make_event(&clock, "s1", "audio"));
        bus.emit(make_event(&clock, "s2", "audio"));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_removes_subscription() {
        let bus = EventBus::new();
        let (_, clock) = test_clock();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        let id = bus.on(
            "audio",
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.emit(make_event(&clock, "s1", "audio"));
        bus.off(id);
        bus.emit(make_event(&clock, "s1", "audio"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_session_drops_all_session_handlers() {
        let bus = EventBus::new();
        let (_, clock) = test_clock();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        bus.on_session(
            "s1",
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.off_session("s1");
        bus.emit(make_event(&clock, "s1", "audio"));

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_errors_are_absorbed() {
        let bus = EventBus::new();
        let (_, clock) = test_clock();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        bus.on("audio", Arc::new(|_| anyhow::bail!("handler exploded")));
        bus.on(
            "audio",
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        // Must not panic, and the second handler still runs.
        bus.emit(make_event(&clock, "s1", "audio"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timestamps_never_go_backwards_per_session() {
        let bus = EventBus::new();
        let (manual, clock) = test_clock();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let stamps_clone = Arc::clone(&stamps);

        bus.on_session(
            "s1",
            Arc::new(move |e| {
                stamps_clone.lock().push(e.t_ms);
                Ok(())
            }),
        );

        bus.emit(make_event(&clock, "s1", "a"));
        manual.advance(50);
        bus.emit(make_event(&clock, "s1", "b"));
        // Clock jumps backwards (NTP step, replay); the bus clamps.
        manual.set(500);
        bus.emit(make_event(&clock, "s1", "c"));

        let stamps = stamps.lock();
        assert_eq!(stamps.as_slice(), &[1_000, 1_050, 1_050]);
    }

    #[test]
    fn reentrant_emit_from_handler_does_not_deadlock() {
        let bus = EventBus::new();
        let (_, clock) = test_clock();
        let bus_clone = Arc::clone(&bus);
        let clock_clone = clock.clone();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);

        bus.on(
            "outer",
            Arc::new(move |e| {
                bus_clone.emit(Event::new(
                    e.session_id.clone(),
                    EventSource::Orchestrator,
                    "inner",
                    json!({}),
                    &clock_clone,
                ));
                Ok(())
            }),
        );
        bus.on(
            "inner",
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.emit(make_event(&clock, "s1", "outer"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn source_tag_strings() {
        assert_eq!(EventSource::LaneC.as_str(), "laneC");
        assert_eq!(EventSource::from_str_lossy("laneB"), Some(EventSource::LaneB));
        assert_eq!(EventSource::from_str_lossy("nope"), None);
    }
}
