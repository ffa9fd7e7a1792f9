//! OpenAI Realtime WebSocket client.
//!
//! ## Protocol overview
//!
//! 1. **Connect** — WebSocket to `wss://api.openai.com/v1/realtime?model=...`
//! 2. **Setup** — send `session.update` with instructions, audio format,
//!    voice, and turn-detection mode
//! 3. **Stream** — send `input_audio_buffer.append` (Base64 PCM16 24kHz),
//!    commit on turn end, receive `response.audio.delta`
//! 4. **Close** — cancel any in-flight response, close the WebSocket
//!
//! All protocol decisions live in [`ProviderCore`]; this file is socket
//! plumbing in front of it.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::protocol::{self, ServerEvent, VoiceMode};
use super::state::{CommitGate, Effect, ProviderCore};
use super::{ProviderEvent, RealtimeProvider};
use crate::clock::SharedClock;
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Outbound message for the socket writer task.
#[derive(Debug)]
enum OutboundMessage {
    /// Raw PCM16 to append upstream (encoded to base64 by the writer).
    Audio(Vec<u8>),
    /// Pre-built protocol message.
    Json(serde_json::Value),
    Close,
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Concrete [`RealtimeProvider`] over `tokio-tungstenite`.
pub struct OpenAiRealtimeClient {
    config: ProviderConfig,
    clock: SharedClock,
    core: Arc<Mutex<ProviderCore>>,
    outbound_tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    event_rx: AsyncMutex<Option<mpsc::Receiver<ProviderEvent>>>,
    voice_mode: Mutex<VoiceMode>,
    context: Mutex<String>,
    connected: AtomicBool,
    session_id: Mutex<String>,
}

impl OpenAiRealtimeClient {
    pub fn new(config: ProviderConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            core: Arc::new(Mutex::new(ProviderCore::new())),
            outbound_tx: Mutex::new(None),
            event_rx: AsyncMutex::new(None),
            voice_mode: Mutex::new(VoiceMode::PushToTalk),
            context: Mutex::new(String::new()),
            connected: AtomicBool::new(false),
            session_id: Mutex::new(String::new()),
        }
    }

    /// Base instructions with the stored conversation context merged in.
    fn build_instructions(&self) -> String {
        let context = self.context.lock();
        if context.is_empty() {
            "You are a helpful realtime voice assistant. Keep replies brief and conversational."
                .to_string()
        } else {
            format!(
                "You are a helpful realtime voice assistant. Keep replies brief and conversational.\n\n{}",
                *context
            )
        }
    }

    fn session_update_message(&self) -> serde_json::Value {
        protocol::session_update(
            &self.build_instructions(),
            &self.config.voice,
            *self.voice_mode.lock(),
        )
    }

    async fn send_outbound(&self, msg: OutboundMessage) -> bool {
        let tx = self.outbound_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }

    // ── Socket loops ──────────────────────────────────────────────

    async fn outbound_loop(
        mut rx: mpsc::Receiver<OutboundMessage>,
        mut sink: WsSink,
        session_id: String,
    ) {
        let mut audio_chunk_count: u64 = 0;

        while let Some(msg) = rx.recv().await {
            match msg {
                OutboundMessage::Audio(pcm) => {
                    audio_chunk_count += 1;
                    if audio_chunk_count == 1 || audio_chunk_count % 50 == 0 {
                        tracing::debug!(
                            session_id = %session_id,
                            chunk = audio_chunk_count,
                            pcm_bytes = pcm.len(),
                            "Appending audio upstream"
                        );
                    }
                    let b64 = base64::engine::general_purpose::STANDARD.encode(&pcm);
                    let frame = protocol::input_audio_append(&b64);
                    if let Ok(json) = serde_json::to_string(&frame) {
                        if sink.send(WsMessage::text(json)).await.is_err() {
                            tracing::warn!(
                                session_id = %session_id,
                                "WebSocket send failed, closing outbound loop"
                            );
                            break;
                        }
                    }
                }
                OutboundMessage::Json(value) => {
                    if let Ok(json) = serde_json::to_string(&value) {
                        if sink.send(WsMessage::text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                OutboundMessage::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }

        tracing::debug!(session_id = %session_id, "Upstream outbound loop terminated");
    }

    async fn inbound_loop(
        mut source: WsSource,
        core: Arc<Mutex<ProviderCore>>,
        event_tx: mpsc::Sender<ProviderEvent>,
        outbound_tx: mpsc::Sender<OutboundMessage>,
        clock: SharedClock,
        session_id: String,
        ready_tx: oneshot::Sender<()>,
    ) {
        let mut ready_tx = Some(ready_tx);

        while let Some(msg_result) = source.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => {
                    let event = match protocol::parse_server_event(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(
                                session_id = %session_id,
                                error = %e,
                                "Dropping malformed upstream frame"
                            );
                            continue;
                        }
                    };
                    if matches!(event, ServerEvent::SessionCreated) {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    let effects = {
                        let mut core = core.lock();
                        core.on_server_event(event, clock.now_ms())
                    };
                    if !Self::run_effects(effects, &event_tx, &outbound_tx, &session_id).await {
                        return;
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(
                        session_id = %session_id,
                        close_frame = ?frame,
                        "Upstream connection closed"
                    );
                    break;
                }
                Ok(
                    WsMessage::Ping(_)
                    | WsMessage::Pong(_)
                    | WsMessage::Frame(_)
                    | WsMessage::Binary(_),
                ) => {
                    // Ping/pong handled by tungstenite; binary is unexpected.
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Upstream WebSocket error"
                    );
                    let _ = event_tx
                        .send(ProviderEvent::Error {
                            code: "websocket_error".into(),
                            message: format!("websocket error: {e}"),
                            fatal: true,
                        })
                        .await;
                    break;
                }
            }
        }

        // Flush truncation bookkeeping for a mid-response drop.
        let effects = core.lock().on_transport_closed();
        let _ = Self::run_effects(effects, &event_tx, &outbound_tx, &session_id).await;

        tracing::debug!(session_id = %session_id, "Upstream inbound loop terminated");
    }

    /// Carry out core effects. Returns false when the event receiver is gone.
    async fn run_effects(
        effects: Vec<Effect>,
        event_tx: &mpsc::Sender<ProviderEvent>,
        outbound_tx: &mpsc::Sender<OutboundMessage>,
        session_id: &str,
    ) -> bool {
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    if event_tx.send(event).await.is_err() {
                        tracing::debug!(
                            session_id = %session_id,
                            "Event receiver dropped, closing inbound loop"
                        );
                        return false;
                    }
                }
                Effect::SendResponseCreate => {
                    tracing::debug!(session_id = %session_id, "Commit confirmed, creating response");
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(protocol::response_create()))
                        .await;
                }
            }
        }
        true
    }
}

#[async_trait]
impl RealtimeProvider for OpenAiRealtimeClient {
    async fn connect(&self, session_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}?model={}", self.config.endpoint, self.config.model);
        *self.session_id.lock() = session_id.to_string();

        tracing::info!(
            session_id = %session_id,
            model = %self.config.model,
            "Connecting to upstream realtime API"
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::Unavailable(format!("bad endpoint: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.api_key)
                .parse()
                .map_err(|_| ProviderError::AuthenticationFailed)?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| ProviderError::Unavailable(format!("bad header: {e}")))?,
        );

        let connect_window = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let connect = tokio_tungstenite::connect_async(request);
        let (ws_stream, _response) = match tokio::time::timeout(connect_window, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                let msg = e.to_string();
                if msg.contains("401") || msg.contains("403") {
                    return Err(ProviderError::AuthenticationFailed);
                }
                return Err(ProviderError::Unavailable(format!("connection failed: {msg}")));
            }
            Err(_) => {
                return Err(ProviderError::Unavailable(
                    "connection failed: transport open timed out".into(),
                ));
            }
        };

        let (sink, source) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(256);
        let (event_tx, event_rx) = mpsc::channel::<ProviderEvent>(256);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        *self.outbound_tx.lock() = Some(outbound_tx.clone());
        *self.event_rx.lock().await = Some(event_rx);

        let sid_out = session_id.to_string();
        tokio::spawn(async move {
            Self::outbound_loop(outbound_rx, sink, sid_out).await;
        });

        let core = Arc::clone(&self.core);
        let clock = self.clock.clone();
        let sid_in = session_id.to_string();
        let outbound_for_inbound = outbound_tx.clone();
        tokio::spawn(async move {
            Self::inbound_loop(
                source,
                core,
                event_tx,
                outbound_for_inbound,
                clock,
                sid_in,
                ready_tx,
            )
            .await;
        });

        // Configure the session before anything else goes out.
        let update = self.session_update_message();
        let _ = outbound_tx.send(OutboundMessage::Json(update)).await;

        // Resolve only once session.created is observed.
        match tokio::time::timeout(connect_window, ready_rx).await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::SeqCst);
                tracing::info!(session_id = %session_id, "Upstream session established");
                Ok(())
            }
            _ => {
                *self.outbound_tx.lock() = None;
                Err(ProviderError::Unavailable(
                    "connection failed: session.created not received".into(),
                ))
            }
        }
    }

    async fn send_audio(&self, pcm: &[u8], format: &str) -> Result<(), ProviderError> {
        if format != "pcm" && format != "pcm16" {
            return Err(ProviderError::UnsupportedFormat(format.to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) || pcm.is_empty() {
            return Ok(());
        }
        self.core.lock().append_audio(pcm, self.clock.now_ms());
        self.send_outbound(OutboundMessage::Audio(pcm.to_vec())).await;
        Ok(())
    }

    async fn commit_audio(&self) -> Result<bool, ProviderError> {
        loop {
            let gate = self.core.lock().commit_gate(self.clock.now_ms());
            match gate {
                CommitGate::TooShort { duration_ms } => {
                    tracing::debug!(
                        session_id = %self.session_id.lock(),
                        duration_ms,
                        "Commit skipped: buffer under minimum duration"
                    );
                    return Ok(false);
                }
                CommitGate::AlreadyPending => {
                    tracing::debug!(
                        session_id = %self.session_id.lock(),
                        "Commit skipped: acknowledgement still pending"
                    );
                    return Ok(false);
                }
                CommitGate::Wait { remaining_ms } => {
                    // Let the transport flush the trailing appends.
                    tokio::time::sleep(std::time::Duration::from_millis(remaining_ms)).await;
                }
                CommitGate::Ready { vad_warning } => {
                    if vad_warning {
                        tracing::warn!(
                            session_id = %self.session_id.lock(),
                            "Committing short buffer without upstream speech detection"
                        );
                    }
                    self.send_outbound(OutboundMessage::Json(protocol::input_audio_commit()))
                        .await;
                    self.core.lock().on_commit_sent();
                    return Ok(true);
                }
            }
        }
    }

    async fn clear_audio(&self) -> Result<(), ProviderError> {
        self.core.lock().clear_input();
        self.send_outbound(OutboundMessage::Json(protocol::input_audio_clear()))
            .await;
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ProviderError> {
        self.core.lock().on_cancel();
        self.send_outbound(OutboundMessage::Json(protocol::response_cancel()))
            .await;
        Ok(())
    }

    async fn set_voice_mode(&self, mode: VoiceMode) -> Result<(), ProviderError> {
        {
            let mut current = self.voice_mode.lock();
            if *current == mode {
                return Ok(());
            }
            *current = mode;
        }
        tracing::info!(
            session_id = %self.session_id.lock(),
            mode = mode.as_str(),
            "Switching voice mode"
        );
        let update = self.session_update_message();
        self.send_outbound(OutboundMessage::Json(update)).await;
        Ok(())
    }

    async fn set_conversation_context(&self, context: &str) -> Result<(), ProviderError> {
        *self.context.lock() = context.to_string();
        Ok(())
    }

    async fn disconnect(&self) {
        if self.core.lock().responding() {
            self.core.lock().on_cancel();
            self.send_outbound(OutboundMessage::Json(protocol::response_cancel()))
                .await;
        }
        self.send_outbound(OutboundMessage::Close).await;
        *self.outbound_tx.lock() = None;
        self.connected.store(false, Ordering::SeqCst);
        self.core.lock().clear_input();
        tracing::info!(session_id = %self.session_id.lock(), "Upstream session disconnected");
    }

    async fn recv_event(&self) -> Option<ProviderEvent> {
        let mut guard = self.event_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}
