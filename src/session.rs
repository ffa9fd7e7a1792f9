//! Session lifecycle management.
//!
//! Each connected client gets one session owned by exactly this process.
//! The manager arms an idle timer per session (any touch resets it), emits
//! `session.start` / `session.end` on the bus, keeps the ended record
//! around for a short grace so late cleanup can still resolve it, then
//! removes it.

use crate::bus::{event_type, Event, EventBus, EventSource};
use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::storage::SqlStore;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Coarse session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Listening,
    Responding,
    Ended,
}

/// One session record.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub state: SessionState,
    pub metadata: HashMap<String, String>,
}

struct SessionEntry {
    session: Session,
    idle_token: CancellationToken,
    /// Deadline basis for the idle watcher task.
    last_activity: Arc<Mutex<Instant>>,
}

/// Owns every session of this process.
pub struct SessionManager {
    bus: Arc<EventBus>,
    clock: SharedClock,
    config: SessionConfig,
    store: Option<Arc<SqlStore>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(
        bus: Arc<EventBus>,
        clock: SharedClock,
        config: SessionConfig,
        store: Option<Arc<SqlStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            clock,
            config,
            store,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Create a session, persist its row, emit `session.start`, arm the
    /// idle timer.
    pub fn create_session(
        self: &Arc<Self>,
        user_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Session {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_session_with_id(&id, user_id, metadata)
    }

    /// Same as [`create_session`](Self::create_session) with a caller-chosen
    /// id (the transport hands the id out before the runtime spins up).
    pub fn create_session_with_id(
        self: &Arc<Self>,
        session_id: &str,
        user_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Session {
        let id = session_id.to_string();
        let now_ms = self.clock.now_ms();
        let session = Session {
            id: id.clone(),
            user_id: user_id.clone(),
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
            state: SessionState::Idle,
            metadata,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_session(&id, user_id.as_deref()) {
                tracing::error!(session_id = %id, error = %e, "Failed to persist session row");
            }
        }

        let idle_token = CancellationToken::new();
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        self.sessions.lock().insert(
            id.clone(),
            SessionEntry {
                session: session.clone(),
                idle_token: idle_token.clone(),
                last_activity: Arc::clone(&last_activity),
            },
        );

        self.bus.emit(Event::new(
            id.clone(),
            EventSource::Orchestrator,
            event_type::SESSION_START,
            json!({ "userId": user_id }),
            &self.clock,
        ));
        tracing::info!(session_id = %id, "Session started");

        self.spawn_idle_watcher(id.clone(), idle_token, last_activity);
        session
    }

    fn spawn_idle_watcher(
        self: &Arc<Self>,
        session_id: String,
        token: CancellationToken,
        last_activity: Arc<Mutex<Instant>>,
    ) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let idle = std::time::Duration::from_secs(self.config.max_idle_minutes * 60);
        tokio::spawn(async move {
            loop {
                let deadline = *last_activity.lock() + idle;
                if Instant::now() >= deadline {
                    if let Some(manager) = manager.upgrade() {
                        tracing::info!(session_id = %session_id, "Idle timeout");
                        manager.end_session(&session_id, "timeout");
                    }
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        });
    }

    /// Reset the idle timer and update last-activity.
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.session.last_activity_ms = self.clock.now_ms();
            *entry.last_activity.lock() = Instant::now();
        }
    }

    /// Update the coarse state; also counts as activity.
    pub fn update_state(&self, session_id: &str, state: SessionState) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.session.state == SessionState::Ended {
                return;
            }
            entry.session.state = state;
            entry.session.last_activity_ms = self.clock.now_ms();
            *entry.last_activity.lock() = Instant::now();
        }
    }

    /// End a session: cancel timers, emit `session.end`, drop the bus
    /// subscriptions, schedule removal after the grace period.
    pub fn end_session(self: &Arc<Self>, session_id: &str, reason: &str) {
        let duration_ms = {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            if entry.session.state == SessionState::Ended {
                return;
            }
            entry.session.state = SessionState::Ended;
            entry.idle_token.cancel();
            self.clock.now_ms().saturating_sub(entry.session.created_at_ms)
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.end_session(session_id, reason) {
                tracing::error!(session_id = %session_id, error = %e, "Failed to persist session end");
            }
        }

        self.bus.emit(Event::new(
            session_id.to_string(),
            EventSource::Orchestrator,
            event_type::SESSION_END,
            json!({ "reason": reason, "durationMs": duration_ms }),
            &self.clock,
        ));
        self.bus.off_session(session_id);
        tracing::info!(session_id = %session_id, reason = reason, duration_ms, "Session ended");

        // Keep the record for the grace window so late cleanup can still
        // resolve the session, then drop it.
        let manager: Weak<Self> = Arc::downgrade(self);
        let session_id = session_id.to_string();
        let grace = std::time::Duration::from_millis(self.config.delete_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(manager) = manager.upgrade() {
                manager.sessions.lock().remove(&session_id);
                manager.bus.forget_session(&session_id);
                tracing::debug!(session_id = %session_id, "Session record removed");
            }
        });
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).map(|e| e.session.clone())
    }

    /// Sessions not yet ended.
    pub fn active_sessions(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .values()
            .filter(|e| e.session.state != SessionState::Ended)
            .map(|e| e.session.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn manager(idle_minutes: u64) -> (Arc<SessionManager>, Arc<EventBus>) {
        let bus = EventBus::new();
        let manager = SessionManager::new(
            Arc::clone(&bus),
            system_clock(),
            SessionConfig {
                max_idle_minutes: idle_minutes,
                delete_grace_ms: 50,
            },
            None,
        );
        (manager, bus)
    }

    #[tokio::test]
    async fn create_emits_session_start() {
        let (manager, bus) = manager(30);
        let started = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&started);
        bus.on(event_type::SESSION_START, Arc::new(move |e| {
            assert_eq!(e.source, EventSource::Orchestrator);
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let session = manager.create_session(None, HashMap::new());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(session.state, SessionState::Idle);
        assert!(manager.get(&session.id).is_some());
    }

    #[tokio::test]
    async fn end_session_emits_reason_and_unsubscribes() {
        let (manager, bus) = manager(30);
        let session = manager.create_session(None, HashMap::new());

        let ends = Arc::new(Mutex::new(Vec::new()));
        let e2 = Arc::clone(&ends);
        bus.on(event_type::SESSION_END, Arc::new(move |e| {
            e2.lock().push(e.payload.clone());
            Ok(())
        }));

        let session_events = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&session_events);
        bus.on_session(&session.id, Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        manager.end_session(&session.id, "client_request");

        let ends = ends.lock();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0]["reason"], "client_request");
        assert!(ends[0]["durationMs"].is_u64());
        // session.end itself is delivered to session handlers before
        // unsubscription.
        assert_eq!(session_events.load(Ordering::SeqCst), 1);

        assert_eq!(manager.get(&session.id).unwrap().state, SessionState::Ended);
        assert!(manager.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn double_end_is_idempotent() {
        let (manager, bus) = manager(30);
        let session = manager.create_session(None, HashMap::new());

        let ends = Arc::new(AtomicU64::new(0));
        let e = Arc::clone(&ends);
        bus.on(event_type::SESSION_END, Arc::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        manager.end_session(&session.id, "client_request");
        manager.end_session(&session.id, "timeout");
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn record_removed_after_grace() {
        let (manager, _) = manager(30);
        let session = manager.create_session(None, HashMap::new());
        manager.end_session(&session.id, "client_request");
        assert!(manager.get(&session.id).is_some());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(manager.get(&session.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_session() {
        let (manager, bus) = manager(1); // one minute
        let ends = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&ends);
        bus.on(event_type::SESSION_END, Arc::new(move |ev| {
            e.lock().push(ev.payload["reason"].clone());
            Ok(())
        }));

        let session = manager.create_session(None, HashMap::new());
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;

        assert_eq!(ends.lock().as_slice(), &[json!("timeout")]);
        assert_eq!(manager.get(&session.id).map(|s| s.state), None);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_defers_idle_timeout() {
        let (manager, _) = manager(1);
        let session = manager.create_session(None, HashMap::new());

        // Touch at 40s; the session survives past the original deadline.
        tokio::time::sleep(std::time::Duration::from_secs(40)).await;
        manager.touch(&session.id);
        tokio::time::sleep(std::time::Duration::from_secs(40)).await;
        assert_eq!(
            manager.get(&session.id).unwrap().state,
            SessionState::Idle
        );

        // And times out a full idle period after the touch.
        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        assert!(manager
            .get(&session.id)
            .map(|s| s.state == SessionState::Ended)
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn update_state_transitions() {
        let (manager, _) = manager(30);
        let session = manager.create_session(None, HashMap::new());
        manager.update_state(&session.id, SessionState::Listening);
        assert_eq!(
            manager.get(&session.id).unwrap().state,
            SessionState::Listening
        );

        manager.end_session(&session.id, "done");
        manager.update_state(&session.id, SessionState::Listening);
        assert_eq!(manager.get(&session.id).unwrap().state, SessionState::Ended);
    }

    #[tokio::test]
    async fn sessions_persist_rows_when_store_present() {
        let bus = EventBus::new();
        let store = Arc::new(SqlStore::open_in_memory().unwrap());
        let manager = SessionManager::new(
            Arc::clone(&bus),
            system_clock(),
            SessionConfig::default(),
            Some(Arc::clone(&store)),
        );

        let session = manager.create_session(None, HashMap::new());
        assert!(store.session_exists(&session.id).unwrap());
    }
}
