//! Per-session runtime.
//!
//! One task per session consumes a single stream of runtime events —
//! client messages, Lane B signals, playback chunks, timer fires — and
//! interprets the arbitrator's actions against the lanes, the provider,
//! and the wire. All session state mutation happens on this task; timers
//! are cancellable handles that feed events back into the same stream.
//!
//! ```text
//! client ─▸ ClientMessage ─┐
//! provider ─▸ LaneBEvent ──┤
//! reflex/fallback chunks ──┼─▸ event loop ─▸ arbitrator actions ─▸ wire out
//! timers ──────────────────┘
//! ```

use crate::audit::AuditTrail;
use crate::audio;
use crate::bus::{event_type, Event, EventBus, EventSource};
use crate::clock::SharedClock;
use crate::config::{FallbackMode, GatewayConfig};
use crate::context::ContextAssembler;
use crate::error::ProviderError;
use crate::lanes::arbitrator::{ArbiterAction, ArbiterEvent, LaneArbitrator, TimerKind};
use crate::lanes::fallback::FallbackPlanner;
use crate::lanes::primary::{LaneBEvent, PrimaryLane};
use crate::lanes::reflex::{PlaybackHandle, ReflexEngine};
use crate::lanes::{Owner, PlaybackEvent};
use crate::policy::{Decision, PolicyEngine};
use crate::provider::{RealtimeProvider, VoiceMode};
use crate::session::{SessionManager, SessionState};
use crate::storage::{Role, SqlStore, TranscriptEntry};
use crate::tts::TtsService;
use crate::wire::{ClientMessage, ServerMessage};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which playback lane produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackSource {
    Reflex,
    Fallback,
}

/// Everything the session loop can wake up on.
enum RuntimeEvent {
    Client(ClientMessage),
    LaneB(LaneBEvent),
    Playback(PlaybackSource, PlaybackEvent),
    Timer(TimerKind),
    MetricsTick,
    /// `session.end` observed on the bus (idle timeout or external).
    ExternalEnd,
}

/// Handle the transport layer holds for one session.
pub struct RuntimeHandle {
    pub session_id: String,
    client_tx: mpsc::Sender<ClientMessage>,
    pub server_rx: Option<mpsc::Receiver<ServerMessage>>,
}

impl RuntimeHandle {
    /// Feed one client message into the session.
    pub async fn send(&self, message: ClientMessage) -> bool {
        self.client_tx.send(message).await.is_ok()
    }

    /// Take the outgoing message stream (once).
    pub fn take_server_rx(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.server_rx.take()
    }
}

// ── Gateway façade ─────────────────────────────────────────────────

/// Shared dependencies for every session in this process.
pub struct Gateway {
    pub config: GatewayConfig,
    pub bus: Arc<EventBus>,
    pub clock: SharedClock,
    pub store: Option<Arc<SqlStore>>,
    pub manager: Arc<SessionManager>,
    pub audit: Arc<AuditTrail>,
    reflex: Arc<ReflexEngine>,
    fallback_tts: Arc<dyn TtsService>,
    assembler: Arc<ContextAssembler>,
}

impl Gateway {
    /// Wire up the shared stack: store, bus, session manager, audit trail,
    /// preloaded reflex clips.
    pub async fn new(
        config: GatewayConfig,
        clock: SharedClock,
        tts: Arc<dyn TtsService>,
        facts: Vec<String>,
    ) -> Arc<Self> {
        let bus = EventBus::new();

        let store = match SqlStore::open(&config.audit.database_path, config.audit.wal_mode) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::error!(error = %e, "Store unavailable, continuing without persistence");
                None
            }
        };

        let manager = SessionManager::new(
            Arc::clone(&bus),
            clock.clone(),
            config.session.clone(),
            store.clone(),
        );

        let audit = AuditTrail::new(config.audit.clone(), Arc::clone(&bus), store.clone());
        audit.start();

        let reflex = Arc::new(ReflexEngine::new(config.reflex.clone(), Arc::clone(&tts)).await);
        let assembler = Arc::new(ContextAssembler::new(store.clone(), facts));

        Arc::new(Self {
            config,
            bus,
            clock,
            store,
            manager,
            audit,
            reflex,
            fallback_tts: tts,
            assembler,
        })
    }

    /// Open a session over the given provider and spawn its runtime.
    pub fn open_session(
        self: &Arc<Self>,
        provider: Arc<dyn RealtimeProvider>,
        fingerprint: Option<String>,
        user_agent: String,
        voice_mode: Option<String>,
    ) -> RuntimeHandle {
        let (client_tx, client_rx) = mpsc::channel::<ClientMessage>(256);
        let (server_tx, server_rx) = mpsc::channel::<ServerMessage>(1024);

        let gateway = Arc::clone(self);
        let session_id = uuid::Uuid::new_v4().to_string();
        let sid = session_id.clone();
        tokio::spawn(async move {
            SessionRuntime::run(
                gateway,
                provider,
                sid,
                fingerprint,
                user_agent,
                voice_mode,
                client_rx,
                server_tx,
            )
            .await;
        });

        RuntimeHandle {
            session_id,
            client_tx,
            server_rx: Some(server_rx),
        }
    }
}

// ── Session runtime ────────────────────────────────────────────────

struct SessionRuntime {
    gateway: Arc<Gateway>,
    session_id: String,
    user_id: Option<String>,
    arbitrator: LaneArbitrator,
    lane_b: PrimaryLane,
    fallback: Arc<FallbackPlanner>,
    policy: Arc<PolicyEngine>,
    server_tx: mpsc::Sender<ServerMessage>,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
    timers: HashMap<TimerKind, CancellationToken>,
    reflex_handle: Option<PlaybackHandle>,
    fallback_handle: Option<PlaybackHandle>,
    /// Lane B audio received before `play_lane_b`; flushed on handoff.
    queued_b_audio: Vec<Vec<u8>>,
    /// Set while interpreting a policy cancel so `PlayFallback` knows the
    /// triggering decision.
    pending_fallback: Option<(Decision, Option<FallbackMode>)>,
    /// Accumulates assistant transcript deltas until the `.done`.
    assistant_partial: String,
    ticker_token: CancellationToken,
    ended: bool,
}

impl SessionRuntime {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        gateway: Arc<Gateway>,
        provider: Arc<dyn RealtimeProvider>,
        session_id: String,
        fingerprint: Option<String>,
        user_agent: String,
        voice_mode: Option<String>,
        client_rx: mpsc::Receiver<ClientMessage>,
        server_tx: mpsc::Sender<ServerMessage>,
    ) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RuntimeEvent>();

        // Context assembly before anything touches the provider.
        let context = match gateway.assembler.assemble(fingerprint.as_deref()) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Context assembly failed");
                let _ = server_tx
                    .send(ServerMessage::Error {
                        error: "internal error".into(),
                    })
                    .await;
                return;
            }
        };

        let user_id = context.user.as_ref().map(|u| u.id.clone());
        let mut metadata = HashMap::new();
        metadata.insert("userAgent".to_string(), user_agent);
        if let Some(fp) = &fingerprint {
            metadata.insert("fingerprint".to_string(), fp.clone());
        }
        let session = gateway
            .manager
            .create_session_with_id(&session_id, user_id.clone(), metadata);

        let _ = server_tx
            .send(ServerMessage::SessionReady {
                session_id: session.id.clone(),
            })
            .await;

        let policy = Arc::new(PolicyEngine::new(
            gateway.config.policy.clone(),
            Arc::clone(&gateway.bus),
            gateway.clock.clone(),
            session_id.clone(),
        ));
        let fallback = Arc::new(FallbackPlanner::new(
            gateway.config.fallback.clone(),
            Arc::clone(&gateway.fallback_tts),
        ));

        let mut runtime = Self {
            arbitrator: LaneArbitrator::new(gateway.config.arbitrator.clone()),
            lane_b: PrimaryLane::new(provider, session_id.clone()),
            fallback,
            policy,
            gateway: Arc::clone(&gateway),
            session_id: session_id.clone(),
            user_id,
            server_tx,
            event_tx: event_tx.clone(),
            timers: HashMap::new(),
            reflex_handle: None,
            fallback_handle: None,
            queued_b_audio: Vec::new(),
            pending_fallback: None,
            assistant_partial: String::new(),
            ticker_token: CancellationToken::new(),
            ended: false,
        };

        // Upstream connection.
        let initial_mode = voice_mode
            .as_deref()
            .map(VoiceMode::from_str_lossy)
            .unwrap_or(VoiceMode::PushToTalk);
        if let Err(e) = runtime.connect_upstream(&context.instructions_context, initial_mode).await
        {
            runtime.fail_connect(e).await;
            return;
        }

        let _ = runtime
            .server_tx
            .send(ServerMessage::ProviderReady {
                is_returning_user: context.is_returning_user,
                previous_session_count: context.previous_session_count,
            })
            .await;

        let actions = runtime
            .arbitrator
            .handle(ArbiterEvent::StartSession, gateway.clock.now_ms());
        runtime.interpret(actions).await;
        gateway
            .manager
            .update_state(&session_id, SessionState::Listening);

        // Client messages feed the event stream.
        Self::spawn_client_forwarder(client_rx, event_tx.clone());

        // session.end from anywhere (idle timeout, admin) wakes the loop.
        {
            let tx = event_tx.clone();
            let sid = session_id.clone();
            gateway.bus.on_session(
                &session_id,
                Arc::new(move |event| {
                    if event.event_type == event_type::SESSION_END && event.session_id == sid {
                        let _ = tx.send(RuntimeEvent::ExternalEnd);
                    }
                    Ok(())
                }),
            );
        }

        // Metrics flush cadence.
        runtime.spawn_metrics_ticker();

        while let Some(event) = event_rx.recv().await {
            runtime.dispatch(event).await;
            if runtime.ended {
                break;
            }
        }

        tracing::debug!(session_id = %session_id, "Session runtime terminated");
    }

    fn spawn_client_forwarder(
        mut client_rx: mpsc::Receiver<ClientMessage>,
        event_tx: mpsc::UnboundedSender<RuntimeEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(message) = client_rx.recv().await {
                if event_tx.send(RuntimeEvent::Client(message)).is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_metrics_ticker(&mut self) {
        let interval_ms = self.gateway.config.policy.metrics_flush_interval_ms;
        if interval_ms == 0 {
            return;
        }
        let token = self.ticker_token.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            interval.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(RuntimeEvent::MetricsTick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn connect_upstream(
        &mut self,
        instructions_context: &str,
        mode: VoiceMode,
    ) -> Result<(), ProviderError> {
        self.lane_b.set_conversation_context(instructions_context).await?;
        self.lane_b.set_voice_mode(mode).await?;

        let (lane_tx, mut lane_rx) = mpsc::channel::<LaneBEvent>(256);
        self.lane_b.connect(lane_tx).await?;

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = lane_rx.recv().await {
                if event_tx.send(RuntimeEvent::LaneB(event)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn fail_connect(&mut self, error: ProviderError) {
        let message = match &error {
            ProviderError::AuthenticationFailed => "authentication failed".to_string(),
            other => other.to_string(),
        };
        tracing::error!(session_id = %self.session_id, error = %message, "Upstream connect failed");
        self.emit_bus(
            EventSource::Orchestrator,
            event_type::ERROR,
            json!({ "error": message }),
        );
        let _ = self
            .server_tx
            .send(ServerMessage::Error {
                error: message.clone(),
            })
            .await;
        let _ = self.server_tx.send(ServerMessage::ConnectionFailed).await;
        self.finish("connection_failed").await;
    }

    // ── Dispatch ──────────────────────────────────────────────────

    async fn dispatch(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Client(message) => self.on_client(message).await,
            RuntimeEvent::LaneB(event) => self.on_lane_b(event).await,
            RuntimeEvent::Playback(source, event) => self.on_playback(source, event).await,
            RuntimeEvent::Timer(kind) => {
                let actions = self
                    .arbitrator
                    .handle(ArbiterEvent::TimerFired(kind), self.now());
                self.interpret(actions).await;
            }
            RuntimeEvent::MetricsTick => self.policy.flush_metrics(),
            RuntimeEvent::ExternalEnd => {
                if !self.ended {
                    // Initiated elsewhere (idle timeout); clean up locally
                    // without re-ending the session.
                    self.teardown(true).await;
                }
            }
        }
    }

    async fn on_client(&mut self, message: ClientMessage) {
        self.gateway.manager.touch(&self.session_id);
        match message {
            ClientMessage::SessionStart { .. } => {
                // Session is already running; the transport resends this
                // only by mistake.
                tracing::debug!(session_id = %self.session_id, "Duplicate session.start ignored");
            }
            ClientMessage::SessionEnd => {
                self.finish("client_request").await;
            }
            ClientMessage::SessionSetMode { voice_mode } => {
                let mode = VoiceMode::from_str_lossy(&voice_mode);
                if let Err(e) = self.lane_b.set_voice_mode(mode).await {
                    self.send_error(&e.to_string()).await;
                    return;
                }
                let _ = self
                    .server_tx
                    .send(ServerMessage::SessionModeChanged {
                        voice_mode: mode.as_str().to_string(),
                    })
                    .await;
            }
            ClientMessage::AudioChunk {
                data,
                format,
                sample_rate,
            } => {
                if sample_rate != audio::SAMPLE_RATE {
                    self.send_error("unsupported sample rate").await;
                    return;
                }
                let pcm = match audio::decode_base64(&data) {
                    Ok(pcm) => pcm,
                    Err(_) => {
                        self.send_error("malformed audio payload").await;
                        return;
                    }
                };
                // Format rejection goes back to the caller only; it is not
                // a bus event.
                if let Err(e) = self.lane_b.send_audio(&pcm, &format).await {
                    self.send_error(&e.to_string()).await;
                }
            }
            ClientMessage::AudioCommit => {
                let actions = self
                    .arbitrator
                    .handle(ArbiterEvent::UserSpeechEnded, self.now());
                self.interpret(actions).await;

                match self.lane_b.commit_audio().await {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = self.server_tx.send(ServerMessage::CommitSkipped).await;
                        let actions = self
                            .arbitrator
                            .handle(ArbiterEvent::ResetResponseInProgress, self.now());
                        self.interpret(actions).await;
                    }
                    Err(e) => self.send_error(&e.to_string()).await,
                }
            }
            ClientMessage::AudioCancel => {
                if let Err(e) = self.lane_b.clear_audio().await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "clear_audio failed");
                }
                let actions = self
                    .arbitrator
                    .handle(ArbiterEvent::ResetResponseInProgress, self.now());
                self.interpret(actions).await;
                let _ = self.server_tx.send(ServerMessage::AudioCancelAck).await;
            }
            ClientMessage::AudioStop => {
                let _ = self.server_tx.send(ServerMessage::AudioStopAck).await;
            }
            ClientMessage::UserBargeIn => {
                // Provider cancel goes out in parallel with the local stop.
                if let Err(e) = self.lane_b.cancel().await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "cancel failed");
                }
                self.queued_b_audio.clear();
                let actions = self.arbitrator.handle(ArbiterEvent::UserBargeIn, self.now());
                self.interpret(actions).await;
                let _ = self.server_tx.send(ServerMessage::UserBargeInAck).await;
            }
            ClientMessage::PlaybackEnded { timestamp } => {
                tracing::trace!(session_id = %self.session_id, timestamp, "Client playback drained");
            }
        }
    }

    async fn on_lane_b(&mut self, event: LaneBEvent) {
        match event {
            LaneBEvent::Ready => {
                tracing::debug!(session_id = %self.session_id, "Upstream session ready");
            }
            LaneBEvent::CommitConfirmed => {
                tracing::debug!(session_id = %self.session_id, "Input commit confirmed");
            }
            LaneBEvent::ResponseStart => {
                self.emit_bus(EventSource::LaneB, event_type::RESPONSE_START, json!({}));
                self.gateway
                    .manager
                    .update_state(&self.session_id, SessionState::Responding);
                let _ = self.server_tx.send(ServerMessage::ResponseStart).await;
            }
            LaneBEvent::FirstAudioReady { ttfb_ms } => {
                self.emit_bus(
                    EventSource::LaneB,
                    event_type::FIRST_AUDIO_READY,
                    json!({ "ttfbMs": ttfb_ms }),
                );
                let actions = self
                    .arbitrator
                    .handle(ArbiterEvent::LaneBFirstAudioReady, self.now());
                self.interpret(actions).await;
            }
            LaneBEvent::Audio { pcm } => {
                let b64 = audio::encode_base64(&pcm);
                self.emit_bus(
                    EventSource::LaneB,
                    event_type::AUDIO,
                    json!({ "data": b64, "bytes": pcm.len(), "data_encoding": "base64" }),
                );
                if self.arbitrator.owner() == Owner::B {
                    self.send_audio_chunk(b64).await;
                } else {
                    // B is not on the speaker yet; hold until play_lane_b.
                    self.queued_b_audio.push(pcm);
                }
            }
            LaneBEvent::Transcript { text, is_final } => {
                self.on_assistant_transcript(text, is_final).await;
            }
            LaneBEvent::UserTranscript { text, is_final } => {
                self.emit_bus(
                    EventSource::LaneB,
                    event_type::USER_TRANSCRIPT,
                    json!({ "text": text, "isFinal": is_final }),
                );
                let _ = self
                    .server_tx
                    .send(ServerMessage::UserTranscript {
                        text: text.clone(),
                        is_final,
                    })
                    .await;
                self.persist_transcript(Role::User, &text, is_final);
                if is_final {
                    let decision = self.policy.evaluate_and_emit(Role::User, &text);
                    self.apply_policy_decision(decision).await;
                }
            }
            LaneBEvent::ResponseEnd { truncated, ttfb_ms } => {
                self.emit_bus(
                    EventSource::LaneB,
                    event_type::RESPONSE_END,
                    json!({ "truncated": truncated, "ttfbMs": ttfb_ms }),
                );
                let _ = self.server_tx.send(ServerMessage::ResponseEnd).await;
                let actions = self.arbitrator.handle(ArbiterEvent::LaneBDone, self.now());
                self.interpret(actions).await;
                self.gateway
                    .manager
                    .update_state(&self.session_id, SessionState::Listening);
            }
            LaneBEvent::RateLimits { .. } => {}
            LaneBEvent::Error {
                code,
                message,
                fatal,
            } => {
                self.emit_bus(
                    EventSource::LaneB,
                    event_type::ERROR,
                    json!({ "code": code, "error": message }),
                );
                self.send_error(&message).await;
                if code == crate::provider::state::COMMIT_EMPTY_CODE {
                    // The documented race: recover to LISTENING, the user
                    // speaks again without reconnecting.
                    let actions = self
                        .arbitrator
                        .handle(ArbiterEvent::ResetResponseInProgress, self.now());
                    self.interpret(actions).await;
                } else if fatal {
                    self.finish("error").await;
                }
            }
        }
    }

    async fn on_assistant_transcript(&mut self, text: String, is_final: bool) {
        self.emit_bus(
            EventSource::LaneB,
            event_type::TRANSCRIPT,
            json!({ "text": text, "isFinal": is_final }),
        );
        let _ = self
            .server_tx
            .send(ServerMessage::Transcript {
                text: text.clone(),
                is_final,
            })
            .await;

        let full_text = if is_final {
            self.assistant_partial.clear();
            text
        } else {
            self.assistant_partial.push_str(&text);
            self.assistant_partial.clone()
        };
        self.persist_transcript(Role::Assistant, &full_text, is_final);

        if is_final || self.policy.evaluate_deltas() {
            let decision = self.policy.evaluate_and_emit(Role::Assistant, &full_text);
            self.apply_policy_decision(decision).await;
        }
    }

    async fn apply_policy_decision(&mut self, decision: crate::policy::PolicyDecision) {
        if decision.decision != Decision::CancelOutput {
            return;
        }
        // Stop the provider first so further deltas are already stale by
        // the time the fallback starts.
        if let Err(e) = self.lane_b.cancel().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "cancel failed");
        }
        self.queued_b_audio.clear();
        self.pending_fallback = Some((decision.decision, decision.fallback_mode));
        let actions = self
            .arbitrator
            .handle(ArbiterEvent::PolicyCancelOutput, self.now());
        self.interpret(actions).await;
    }

    async fn on_playback(&mut self, source: PlaybackSource, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Chunk(pcm) => {
                let expected_owner = match source {
                    PlaybackSource::Reflex => Owner::A,
                    PlaybackSource::Fallback => Owner::Fallback,
                };
                if self.arbitrator.owner() != expected_owner {
                    // Chunk raced with a stop; drop it.
                    return;
                }
                let b64 = audio::encode_base64(&pcm);
                let bus_source = match source {
                    PlaybackSource::Reflex => EventSource::LaneA,
                    PlaybackSource::Fallback => EventSource::Orchestrator,
                };
                self.emit_bus(
                    bus_source,
                    event_type::AUDIO,
                    json!({ "data": b64, "bytes": pcm.len(), "data_encoding": "base64" }),
                );
                self.send_audio_chunk(b64).await;
            }
            PlaybackEvent::Done { reason } => match source {
                PlaybackSource::Fallback => {
                    let actions = self
                        .arbitrator
                        .handle(ArbiterEvent::FallbackDone, self.now());
                    self.interpret(actions).await;
                }
                PlaybackSource::Reflex => {
                    // Natural reflex end leaves the arbitrator waiting on
                    // Lane B or the max-reflex timer.
                    tracing::trace!(
                        session_id = %self.session_id,
                        ?reason,
                        "Reflex playback finished"
                    );
                }
            },
        }
    }

    // ── Action interpreter ────────────────────────────────────────

    async fn interpret(&mut self, actions: Vec<ArbiterAction>) {
        for action in actions {
            match action {
                ArbiterAction::PlayReflex => {
                    let (tx, rx) = mpsc::channel::<PlaybackEvent>(64);
                    self.forward_playback(PlaybackSource::Reflex, rx);
                    self.reflex_handle = Some(self.gateway.reflex.start(tx));
                }
                ArbiterAction::StopReflex => {
                    if let Some(handle) = self.reflex_handle.take() {
                        handle.stop();
                    }
                }
                ArbiterAction::PlayLaneB => {
                    let queued = std::mem::take(&mut self.queued_b_audio);
                    for pcm in queued {
                        let b64 = audio::encode_base64(&pcm);
                        self.send_audio_chunk(b64).await;
                    }
                }
                ArbiterAction::StopLaneB => {
                    self.queued_b_audio.clear();
                }
                ArbiterAction::PlayFallback => {
                    let (decision, mode) = self
                        .pending_fallback
                        .take()
                        .unwrap_or((Decision::CancelOutput, None));
                    let (tx, rx) = mpsc::channel::<PlaybackEvent>(64);
                    self.forward_playback(PlaybackSource::Fallback, rx);
                    let handle = self.fallback.start(decision, mode, tx).await;
                    self.fallback_handle = Some(handle);
                }
                ArbiterAction::StopFallback => {
                    if let Some(handle) = self.fallback_handle.take() {
                        handle.stop();
                    }
                    self.fallback.stop();
                }
                ArbiterAction::ResponseComplete => {
                    self.emit_bus(
                        EventSource::Orchestrator,
                        event_type::RESPONSE_COMPLETE,
                        json!({}),
                    );
                }
                ArbiterAction::ArmTimer(kind, ms) => self.arm_timer(kind, ms),
                ArbiterAction::CancelTimer(kind) => {
                    if let Some(token) = self.timers.remove(&kind) {
                        token.cancel();
                    }
                }
                ArbiterAction::CancelAllTimers => {
                    for (_, token) in self.timers.drain() {
                        token.cancel();
                    }
                }
                ArbiterAction::StateChanged { from, to, cause } => {
                    self.emit_bus(
                        EventSource::Orchestrator,
                        event_type::LANE_STATE_CHANGED,
                        json!({ "from": from.as_str(), "to": to.as_str(), "cause": cause }),
                    );
                    let _ = self
                        .server_tx
                        .send(ServerMessage::LaneStateChanged {
                            from: from.as_str().to_string(),
                            to: to.as_str().to_string(),
                            cause: cause.to_string(),
                        })
                        .await;
                }
                ArbiterAction::OwnerChanged { from, to, cause } => {
                    self.emit_bus(
                        EventSource::Orchestrator,
                        event_type::LANE_OWNER_CHANGED,
                        json!({ "from": from.as_str(), "to": to.as_str(), "cause": cause }),
                    );
                    let _ = self
                        .server_tx
                        .send(ServerMessage::LaneOwnerChanged {
                            from: from.as_str().to_string(),
                            to: to.as_str().to_string(),
                            cause: cause.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    fn forward_playback(
        &self,
        source: PlaybackSource,
        mut rx: mpsc::Receiver<PlaybackEvent>,
    ) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event_tx.send(RuntimeEvent::Playback(source, event)).is_err() {
                    break;
                }
            }
        });
    }

    fn arm_timer(&mut self, kind: TimerKind, ms: u64) {
        if let Some(previous) = self.timers.remove(&kind) {
            previous.cancel();
        }
        let token = CancellationToken::new();
        self.timers.insert(kind, token.clone());
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                    let _ = event_tx.send(RuntimeEvent::Timer(kind));
                }
            }
        });
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn now(&self) -> u64 {
        self.gateway.clock.now_ms()
    }

    fn emit_bus(&self, source: EventSource, kind: &str, payload: serde_json::Value) {
        self.gateway.bus.emit(Event::new(
            self.session_id.clone(),
            source,
            kind,
            payload,
            &self.gateway.clock,
        ));
    }

    async fn send_audio_chunk(&self, b64: String) {
        let _ = self
            .server_tx
            .send(ServerMessage::AudioChunk {
                data: b64,
                format: "pcm".into(),
                sample_rate: audio::SAMPLE_RATE,
            })
            .await;
    }

    async fn send_error(&self, message: &str) {
        let _ = self
            .server_tx
            .send(ServerMessage::Error {
                error: message.to_string(),
            })
            .await;
    }

    fn persist_transcript(&self, role: Role, content: &str, is_final: bool) {
        let Some(store) = &self.gateway.store else {
            return;
        };
        let entry = TranscriptEntry {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            role,
            content: content.to_string(),
            confidence: 1.0,
            timestamp_ms: self.now(),
            is_final,
        };
        if let Err(e) = store.upsert_transcript(&entry) {
            tracing::error!(session_id = %self.session_id, error = %e, "Transcript write failed");
        }
    }

    /// End the session from inside the runtime.
    async fn finish(&mut self, reason: &str) {
        if self.ended {
            return;
        }
        self.teardown(false).await;
        self.gateway.manager.end_session(&self.session_id, reason);
    }

    /// Local cleanup shared by runtime-initiated and external ends.
    async fn teardown(&mut self, external: bool) {
        if self.ended {
            return;
        }
        self.ended = true;
        let actions = self.arbitrator.handle(ArbiterEvent::EndSession, self.now());
        self.interpret(actions).await;
        self.ticker_token.cancel();
        self.lane_b.disconnect().await;
        self.policy.flush_metrics();
        if let Err(e) = self
            .gateway
            .assembler
            .summarize_session(&self.session_id, self.user_id.as_deref())
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "Summarize failed");
        }
        if external {
            tracing::debug!(session_id = %self.session_id, "Runtime closed after external end");
        }
    }
}
