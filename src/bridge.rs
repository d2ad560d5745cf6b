//! # Protocol Bridge
//!
//! The WebSocket actor at the heart of the service. One bridge per client
//! connection; it owns the session record and splices three event sources
//! onto one single-threaded event loop:
//!
//! 1. Client WebSocket frames (control JSON + binary microphone audio)
//! 2. Provider socket events, read by a spawned task and delivered as
//!    actor messages
//! 3. Timers and watchdog signals
//!
//! Because everything lands on the actor's mailbox, session mutations never
//! race. Events from a previous provider connection are discarded by
//! comparing the `connection_id` they were issued under.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::SilenceContext;
use crate::orchestrator::{AnalysisRequest, Guidance, GuidanceAction};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::provider::{parse_event, ProviderEvent, SessionSettings, TurnDetection};
use crate::session::persistence::{SessionSnapshot, SnapshotStore};
use crate::session::registry::{BridgeRecipients, SessionEntry};
use crate::session::state::{InterviewSession, Speaker, TranscriptEntry};
use crate::session::watchdog::{FinalizeSession, TerminationReason, WatchdogWarning};
use crate::state::AppState;

/// Phrases that count as the respondent asking for the question again.
const QUESTION_REPEAT_PHRASES: &[&str] = &[
    "repeat the question",
    "repeat that",
    "say that again",
    "say it again",
    "what was the question",
    "come again",
];

/// One parsed provider event, tagged with the connection it arrived on.
#[derive(Message)]
#[rtype(result = "()")]
struct ProviderEventMsg {
    connection_id: u64,
    event: ProviderEvent,
}

/// The provider socket closed or failed.
#[derive(Message)]
#[rtype(result = "()")]
struct ProviderClosed {
    connection_id: u64,
}

/// An orchestrator analysis finished (possibly with nothing to say).
#[derive(Message)]
#[rtype(result = "()")]
struct GuidanceArrived {
    connection_id: u64,
    guidance: Option<Guidance>,
}

/// The per-connection WebSocket actor.
pub struct InterviewBridge {
    state: AppState,

    session: Option<InterviewSession>,
    entry: Option<Arc<SessionEntry>>,

    /// Snapshot to restore from, when the connection arrived with a valid
    /// resume token. Consumed in `started`.
    restored: Option<SessionSnapshot>,

    /// Outbound half of the provider socket. Frames queued here before the
    /// socket finishes connecting are flushed once it does.
    provider_tx: Option<mpsc::UnboundedSender<WsMessage>>,

    /// Interviewer audio buffered until the client reports `audio_ready`,
    /// so the opening line is not clipped.
    pending_playback: Vec<Vec<u8>>,

    /// Incremental transcript of the in-flight interviewer response.
    interviewer_transcript: String,
    /// PCM bytes of the in-flight interviewer response, for speaking time.
    response_audio_bytes: u64,

    last_client_heartbeat: Instant,
    reconnect_used: bool,

    /// Set by anything that changes durable state; drained by the persist
    /// debounce timer.
    dirty: bool,
}

impl InterviewBridge {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            session: None,
            entry: None,
            restored: None,
            provider_tx: None,
            pending_playback: Vec::new(),
            interviewer_transcript: String::new(),
            response_audio_bytes: 0,
            last_client_heartbeat: Instant::now(),
            reconnect_used: false,
            dirty: false,
        }
    }

    pub fn resuming(state: AppState, snapshot: SessionSnapshot) -> Self {
        let mut bridge = Self::new(state);
        bridge.restored = Some(snapshot);
        bridge
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, message, "Client-facing error");
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    // ---- session start / resume ---------------------------------------

    fn start_new_session(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        session_id: Option<String>,
        questions: Vec<crate::protocol::QuestionSpec>,
        additional: Vec<String>,
    ) {
        if self.session.is_some() {
            self.send_error(ctx, "session_already_started", "This connection already has a session");
            return;
        }
        if questions.is_empty() {
            self.send_error(ctx, "invalid_request", "At least one question is required");
            return;
        }

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let entry = match self.state.registry.register(&session_id) {
            Ok(entry) => entry,
            Err(e) => {
                self.send_error(ctx, "session_rejected", &e);
                ctx.close(None);
                ctx.stop();
                return;
            }
        };

        let session = InterviewSession::new(
            session_id.clone(),
            questions.into_iter().map(Into::into).collect(),
            additional,
        );
        entry.set_created_at(session.created_at);
        entry.attach(BridgeRecipients {
            warn: ctx.address().recipient(),
            finalize: ctx.address().recipient(),
        });

        info!(session_id = %session_id, "Interview session started");

        let question = session
            .current_question()
            .unwrap_or_default()
            .to_string();
        self.send(
            ctx,
            &ServerMessage::SessionStarted {
                session_id,
                question_index: session.question_index,
                question,
            },
        );

        self.session = Some(session);
        self.entry = Some(entry);
        self.dirty = true;
        self.connect_provider(ctx);
    }

    fn restore_session(&mut self, ctx: &mut ws::WebsocketContext<Self>, snapshot: SessionSnapshot) {
        let entry = match self.state.registry.register_restored(&snapshot.session_id) {
            Ok(entry) => entry,
            Err(e) => {
                self.send_error(ctx, "resume_rejected", &e);
                ctx.close(None);
                ctx.stop();
                return;
            }
        };

        let session = snapshot.restore();
        entry.set_created_at(session.created_at);
        entry.attach(BridgeRecipients {
            warn: ctx.address().recipient(),
            finalize: ctx.address().recipient(),
        });
        // Reconnection counts as activity, or the idle clock from before the
        // disconnect could terminate the session immediately.
        entry.touch_activity();

        info!(session_id = %session.session_id, "Interview session restored, awaiting resume");

        let question = session
            .current_question()
            .unwrap_or_default()
            .to_string();
        self.send(
            ctx,
            &ServerMessage::SessionResumed {
                session_id: session.session_id.clone(),
                question_index: session.question_index,
                question,
            },
        );

        self.session = Some(session);
        self.entry = Some(entry);
        self.connect_provider(ctx);
    }

    // ---- provider socket ----------------------------------------------

    /// Open the provider WebSocket. The write half is bridged through an
    /// unbounded channel so the actor can send synchronously; the read half
    /// runs in a spawned task that posts parsed events back to the mailbox.
    fn connect_provider(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let connection_id = session.connection_id;
        let session_id = session.session_id.clone();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.provider_tx = Some(tx);

        let endpoint = self.state.provider.endpoint();
        let headers = self.state.provider.auth_headers();
        let addr = ctx.address();

        tokio::spawn(async move {
            let mut request = match endpoint.clone().into_client_request() {
                Ok(request) => request,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Bad provider endpoint");
                    addr.do_send(ProviderClosed { connection_id });
                    return;
                }
            };
            for (name, value) in headers {
                match HeaderValue::from_str(&value) {
                    Ok(v) => {
                        request.headers_mut().insert(name, v);
                    }
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Bad provider auth header");
                        addr.do_send(ProviderClosed { connection_id });
                        return;
                    }
                }
            }

            let stream = match connect_async(request).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Provider connect failed");
                    addr.do_send(ProviderClosed { connection_id });
                    return;
                }
            };
            debug!(session_id = %session_id, connection_id, "Provider socket connected");

            let (mut sink, mut reader) = stream.split();

            let writer = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
            });

            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match parse_event(&text) {
                        Ok(Some(event)) => {
                            addr.do_send(ProviderEventMsg { connection_id, event });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Unparseable provider frame");
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Provider socket error");
                        break;
                    }
                }
            }

            writer.abort();
            addr.do_send(ProviderClosed { connection_id });
        });
    }

    fn send_provider(&self, value: serde_json::Value) {
        if let Some(tx) = &self.provider_tx {
            if tx.send(WsMessage::Text(value.to_string().into())).is_err() {
                warn!("Provider channel closed; frame dropped");
            }
        }
    }

    /// Build the interviewer instructions for the current question.
    fn build_instructions(session: &InterviewSession) -> String {
        let mut instructions = String::from(
            "You are a professional, warm interviewer conducting a structured \
             voice interview. Ask one question at a time, listen, and probe \
             naturally. Keep your turns short and conversational.",
        );

        if let Some(question) = session.current_question() {
            instructions.push_str("\n\nCurrent question: ");
            instructions.push_str(question);
        }
        if let Some(guidance) = session.current_question_guidance() {
            instructions.push_str("\nGuidance for this question: ");
            instructions.push_str(guidance);
        }

        instructions
    }

    /// Send the provider `session.update` with current instructions and
    /// turn-detection policy.
    fn configure_provider_session(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let config = self.state.config.read().unwrap();
        let turn_detection = if self.state.provider.supports_semantic_turn_detection() {
            TurnDetection::Semantic(session.quality.eagerness())
        } else {
            TurnDetection::ServerVad
        };
        let settings = SessionSettings {
            instructions: Self::build_instructions(session),
            voice: config.provider.voice.clone(),
            transcription_model: config.provider.transcription_model.clone(),
            transcription_language: config.provider.transcription_language.clone(),
            turn_detection,
        };
        drop(config);

        let payload = self.state.provider.build_session_config(&settings);
        self.send_provider(payload);
    }

    // ---- audio ---------------------------------------------------------

    /// Whether respondent audio may flow to the provider right now.
    ///
    /// Closed while awaiting resume so provider-side voice detection cannot
    /// trigger a response before the client has confirmed, and until the
    /// provider session is configured.
    fn audio_gate_open(session: &InterviewSession) -> bool {
        !session.awaiting_resume && !session.is_finalizing && session.session_configured
    }

    /// Whether a `response.create` may be sent right now. A response queued
    /// before the provider's `session.update` lands would speak with default
    /// instructions instead of the interview persona.
    fn can_create_response(session: &InterviewSession) -> bool {
        !session.awaiting_resume && !session.is_finalizing && session.session_configured
    }

    /// Where the silence segment ending at the current speech event started,
    /// and in what conversational context. Restored sessions carry a fresh
    /// anchor with no speaker, so their first segment still counts as
    /// initial silence without reaching back to the original creation time.
    fn silence_anchor(session: &InterviewSession) -> (chrono::DateTime<Utc>, SilenceContext) {
        match (session.last_speech_ended_at, session.last_speaker) {
            (Some(ended), Some(Speaker::Interviewer)) => (ended, SilenceContext::AfterInterviewer),
            (Some(ended), Some(Speaker::Respondent)) => (ended, SilenceContext::AfterRespondent),
            (Some(ended), None) => (ended, SilenceContext::Initial),
            (None, _) => (session.created_at, SilenceContext::Initial),
        }
    }

    /// Forward one chunk of respondent microphone audio to the provider.
    fn forward_audio(&mut self, data: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !Self::audio_gate_open(session) {
            return;
        }

        session.mark_activity();
        if let Some(entry) = &self.entry {
            entry.touch_activity();
        }

        let payload = serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64.encode(data),
        });
        self.send_provider(payload);
    }

    fn deliver_playback(&mut self, ctx: &mut ws::WebsocketContext<Self>, audio: Vec<u8>) {
        let ready = self.session.as_ref().map(|s| s.audio_ready).unwrap_or(false);
        if ready {
            ctx.binary(audio);
        } else {
            self.pending_playback.push(audio);
        }
    }

    fn flush_playback(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        for chunk in std::mem::take(&mut self.pending_playback) {
            ctx.binary(chunk);
        }
    }

    // ---- transcript / quality pipeline ---------------------------------

    /// Run one finalized respondent utterance through the whole pipeline:
    /// transcript bookkeeping, quality detectors, client notifications,
    /// eagerness adaptation and the orchestrator analysis kick-off.
    fn handle_respondent_utterance(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        text: String,
        confidence: Option<f32>,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if text.is_empty() {
            return;
        }

        let question_index = session.question_index;
        let timestamp = Utc::now();
        session.push_transcript(TranscriptEntry {
            speaker: Speaker::Respondent,
            text: text.clone(),
            timestamp,
            question_index,
            confidence,
        });
        if let Some(entry) = &self.entry {
            entry.touch_activity();
        }
        self.dirty = true;

        let session = self.session.as_mut().unwrap();

        let lowered = text.to_lowercase();
        if QUESTION_REPEAT_PHRASES.iter().any(|p| lowered.contains(p)) {
            session.quality.note_question_repeat();
        }

        let report = session.quality.observe_utterance(&text);

        self.send(
            ctx,
            &ServerMessage::Transcript {
                speaker: Speaker::Respondent,
                text: text.clone(),
                question_index,
                timestamp: timestamp.timestamp_millis() as u64,
                confidence,
            },
        );

        if !report.issues.is_empty() {
            self.send(
                ctx,
                &ServerMessage::TranscriptionQualityWarning {
                    issues: report.issues.clone(),
                    quality_score: report.score,
                },
            );
        }

        if let Some(eagerness) = report.eagerness_change {
            info!(eagerness = eagerness.as_str(), "Adjusting turn-detection eagerness");
            let session = self.session.as_mut().unwrap();
            session.metrics.record_eagerness_switch(eagerness);
            self.configure_provider_session();
        }

        if report.environment_check {
            // Synthesized locally; takes the same path as orchestrator
            // guidance so it patches the next response, not the current one.
            let session = self.session.as_mut().unwrap();
            session.deliver_guidance(Guidance {
                action: GuidanceAction::SuggestEnvironmentCheck,
                message: None,
                confidence: 1.0,
                reasoning: "quality signals crossed the environment-check threshold".to_string(),
            });
        }

        self.spawn_analysis(ctx, report.score);
        self.try_create_response(ctx);
    }

    /// Kick off an orchestrator analysis unless one is already outstanding.
    fn spawn_analysis(&mut self, ctx: &mut ws::WebsocketContext<Self>, quality_score: u8) {
        let Some(client) = self.state.orchestrator.clone() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.awaiting_analysis {
            return;
        }
        session.awaiting_analysis = true;

        let request = AnalysisRequest {
            session_id: session.session_id.clone(),
            transcript: session.transcript_window().cloned().collect(),
            current_question: session.current_question().unwrap_or_default().to_string(),
            question_index: session.question_index,
            quality_score,
        };
        let connection_id = session.connection_id;
        let addr = ctx.address();

        tokio::spawn(async move {
            let guidance = match client.request_guidance(&request).await {
                Ok(guidance) => guidance,
                Err(e) => {
                    warn!(session_id = %request.session_id, error = %e, "Orchestrator analysis failed");
                    None
                }
            };
            addr.do_send(GuidanceArrived { connection_id, guidance });
        });
    }

    // ---- response creation ---------------------------------------------

    /// Ask the guard for permission and, if granted, create a provider
    /// response, applying any pending guidance as an instruction patch.
    fn try_create_response(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = {
            let config = self.state.config.read().unwrap();
            Duration::from_secs(config.session.response_timeout_secs)
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !Self::can_create_response(session) {
            return;
        }

        let now = Instant::now();
        if session.response_stalled(now, timeout) {
            warn!(
                session_id = %session.session_id,
                response_id = ?session.current_response_id,
                "Response completion never arrived; force-clearing the guard"
            );
        }
        match session.try_begin_response(now, timeout) {
            crate::session::state::ResponseGate::Busy => {
                debug!(session_id = %session.session_id, "Response already in flight; creation skipped");
                return;
            }
            crate::session::state::ResponseGate::Ready => {}
        }

        let guidance = session.take_guidance();
        let advance = matches!(
            guidance.as_ref().map(|g| g.action),
            Some(GuidanceAction::SuggestNextQuestion)
        );

        if advance {
            if session.advance_question().is_none() {
                // Out of material: the interview is over.
                self.finalize(ctx, TerminationReason::Completed, false);
                return;
            }
            let question_index = session.question_index;
            let question = session.current_question().unwrap_or_default().to_string();
            self.send(ctx, &ServerMessage::QuestionChanged { question_index, question });
            self.dirty = true;
            self.configure_provider_session();
        }

        let mut payload = serde_json::json!({ "type": "response.create" });
        if let Some(guidance) = &guidance {
            if let Some(patch) = guidance.instruction_patch() {
                payload["response"] = serde_json::json!({
                    "instructions": format!("{}\n\n{}", Self::build_instructions(self.session.as_ref().unwrap()), patch),
                });
            }
            self.send(
                ctx,
                &ServerMessage::GuidanceApplied {
                    action: guidance.action.as_str().to_string(),
                    message: guidance.message.clone(),
                },
            );
        }
        self.send_provider(payload);
    }

    // ---- persistence / finalization ------------------------------------

    fn persist(&mut self, completed: Option<TerminationReason>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let mut snapshot = SessionSnapshot::capture(session);
        if let Some(reason) = completed {
            snapshot.completed = true;
            snapshot.termination_reason = Some(reason.as_str().to_string());
        }
        self.dirty = false;

        let is_final = completed.is_some();
        let store: Arc<SnapshotStore> = self.state.store.clone();
        tokio::spawn(async move {
            // Routine saves merge store-owned fields (resume token, completed
            // marker); the final save at termination is written as-is.
            let result = if is_final {
                store.save(&snapshot).await
            } else {
                store.save_live(snapshot).await
            };
            if let Err(e) = result {
                error!(error = %e, "Snapshot save failed");
            }
        });
    }

    /// Terminate the session exactly once: notify the client, persist the
    /// final snapshot, drop the provider socket, deregister and stop.
    ///
    /// `latched` is true when the watchdog already claimed the finalize
    /// latch before messaging us.
    fn finalize(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        reason: TerminationReason,
        latched: bool,
    ) {
        if let Some(entry) = &self.entry {
            if !latched && !entry.begin_finalize() {
                return;
            }
        }
        let Some(session) = self.session.as_mut() else {
            ctx.stop();
            return;
        };
        session.is_finalizing = true;
        let session_id = session.session_id.clone();

        info!(session_id = %session_id, reason = reason.as_str(), "Finalizing session");

        self.send(
            ctx,
            &ServerMessage::SessionComplete {
                reason: reason.as_str().to_string(),
            },
        );

        self.persist(Some(reason));
        self.provider_tx = None;
        self.state.registry.remove(&session_id);

        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some(reason.as_str().to_string()),
        }));
        ctx.stop();
    }

    fn now_millis() -> u64 {
        Utc::now().timestamp_millis() as u64
    }
}

impl Actor for InterviewBridge {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("Client WebSocket connected");

        let (heartbeat_interval, heartbeat_timeout, persist_debounce) = {
            let config = self.state.config.read().unwrap();
            (
                Duration::from_secs(config.session.heartbeat_interval_secs),
                Duration::from_secs(config.session.heartbeat_timeout_secs),
                Duration::from_secs(config.session.persist_debounce_secs),
            )
        };

        // Application heartbeat. The watchdog enforces the session-level
        // timeout; this local check just drops a dead socket so the session
        // enters its resume window instead of lingering.
        ctx.run_interval(heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_client_heartbeat) > heartbeat_timeout {
                warn!("Client heartbeat timeout, dropping connection");
                ctx.stop();
                return;
            }
            // Protocol-level ping keeps intermediaries from idling the
            // connection out; the JSON ping is the application heartbeat.
            ctx.ping(b"");
            if let Ok(json) = serde_json::to_string(&ServerMessage::Ping {
                timestamp: Self::now_millis(),
            }) {
                ctx.text(json);
            }
        });

        // Persist debounce: coalesce bursts of transcript/metric updates
        // into at most one snapshot write per interval.
        ctx.run_interval(persist_debounce, |act, _ctx| {
            if act.dirty {
                act.persist(None);
            }
        });

        if let Some(snapshot) = self.restored.take() {
            self.restore_session(ctx, snapshot);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        if entry.is_finalizing() {
            return;
        }

        // Not a termination: keep the session resumable. Persist what we
        // have and detach so the watchdog applies the resume window.
        if let Some(session) = self.session.as_ref() {
            info!(session_id = %session.session_id, "Client disconnected; session enters resume window");
        }
        self.persist(None);
        entry.detach();
        self.provider_tx = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for InterviewBridge {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::StartSession { session_id, questions, additional_questions }) => {
                    self.start_new_session(ctx, session_id, questions, additional_questions);
                }
                Ok(ClientMessage::AudioReady) => {
                    if let Some(session) = self.session.as_mut() {
                        session.audio_ready = true;
                    }
                    self.flush_playback(ctx);
                }
                Ok(ClientMessage::AudioChunk { data }) => match BASE64.decode(&data) {
                    Ok(bytes) => self.forward_audio(&bytes),
                    Err(_) => self.send_error(ctx, "invalid_audio", "audio_chunk data is not valid base64"),
                },
                Ok(ClientMessage::TextInput { text }) => {
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        return;
                    }
                    self.send_provider(serde_json::json!({
                        "type": "conversation.item.create",
                        "item": {
                            "type": "message",
                            "role": "user",
                            "content": [{"type": "input_text", "text": text}],
                        },
                    }));
                    self.handle_respondent_utterance(ctx, text, None);
                }
                Ok(ClientMessage::ResumeInterview) => {
                    let Some(session) = self.session.as_mut() else {
                        self.send_error(ctx, "no_session", "Nothing to resume");
                        return;
                    };
                    if !session.awaiting_resume {
                        return;
                    }
                    session.awaiting_resume = false;
                    session.mark_activity();
                    // The gate was closed since the restore; silence
                    // measurement starts over from the actual resume.
                    session.last_speech_ended_at = Some(Utc::now());
                    info!(session_id = %session.session_id, "Session resumed by client");

                    // Re-engage: the interviewer picks the thread back up.
                    session.deliver_guidance(Guidance {
                        action: GuidanceAction::AcknowledgePrior,
                        message: Some(
                            "The interview was interrupted and has just been resumed; briefly \
                             welcome the respondent back and restate where you left off."
                                .to_string(),
                        ),
                        confidence: 1.0,
                        reasoning: String::new(),
                    });
                    self.try_create_response(ctx);
                }
                Ok(ClientMessage::Pong { timestamp: _ }) => {
                    self.last_client_heartbeat = Instant::now();
                    if let Some(session) = self.session.as_mut() {
                        session.mark_heartbeat();
                    }
                    if let Some(entry) = &self.entry {
                        entry.touch_heartbeat();
                    }
                }
                Err(e) => {
                    self.send_error(ctx, "invalid_message", &format!("Unrecognized message: {}", e));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.forward_audio(&data);
            }
            Ok(ws::Message::Ping(payload)) => {
                ctx.pong(&payload);
                self.last_client_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_client_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Client closed the connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Client WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<ProviderEventMsg> for InterviewBridge {
    type Result = ();

    fn handle(&mut self, msg: ProviderEventMsg, ctx: &mut Self::Context) {
        // Events from a superseded provider connection are stale; drop them.
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if msg.connection_id != session.connection_id {
            debug!(
                stale = msg.connection_id,
                current = session.connection_id,
                "Dropping event from stale provider connection"
            );
            return;
        }

        match msg.event {
            ProviderEvent::SessionCreated => {
                self.configure_provider_session();
                let session = self.session.as_mut().unwrap();
                let first_configuration = !session.session_configured;
                session.session_configured = true;

                // Open the interview, unless we are holding for an explicit
                // resume confirmation.
                if first_configuration && !session.awaiting_resume {
                    self.try_create_response(ctx);
                }
            }

            ProviderEvent::TranscriptCompleted { item_id: _, transcript, confidence } => {
                {
                    let session = self.session.as_mut().unwrap();
                    session.transcript_ready_at = Some(Instant::now());
                    if let Some(stopped) = session.speech_stopped_at.take() {
                        let ms = stopped.elapsed().as_millis() as u64;
                        session.metrics.record_transcription_latency(ms);
                    }
                }
                self.handle_respondent_utterance(ctx, transcript, confidence);
            }

            ProviderEvent::ResponseCreated { response_id } => {
                // Also claims the guard for provider-initiated responses
                // (turn detection can create them without our asking).
                let timeout = {
                    let config = self.state.config.read().unwrap();
                    Duration::from_secs(config.session.response_timeout_secs)
                };
                if !session.response_in_progress() {
                    let _ = session.try_begin_response(Instant::now(), timeout);
                }
                session.current_response_id = Some(response_id);
                self.interviewer_transcript.clear();
                self.response_audio_bytes = 0;
            }

            ProviderEvent::ResponseAudioDelta { audio } => {
                self.response_audio_bytes += audio.len() as u64;
                let session = self.session.as_mut().unwrap();
                if let Some(ready) = session.transcript_ready_at.take() {
                    let ms = ready.elapsed().as_millis() as u64;
                    session.metrics.record_response_latency(ms);
                }
                self.deliver_playback(ctx, audio);
            }

            ProviderEvent::ResponseAudioTranscriptDelta { delta } => {
                self.interviewer_transcript.push_str(&delta);
            }

            ProviderEvent::ResponseDone { response_id, raw } => {
                if !session.complete_response(&response_id) {
                    warn!(
                        session_id = %session.session_id,
                        response_id = %response_id,
                        "Duplicate response completion ignored"
                    );
                    return;
                }

                if let Some(usage) = self.state.provider.parse_usage(&raw) {
                    session.metrics.tokens.add(&usage);
                }

                // PCM16 mono: two bytes per sample.
                let speaking_ms =
                    self.response_audio_bytes * 1000 / (2 * self.state.provider.sample_rate() as u64);
                session.metrics.record_interviewer_turn(speaking_ms);
                session.last_speaker = Some(Speaker::Interviewer);
                session.last_speech_ended_at = Some(Utc::now());
                session.mark_activity();
                self.dirty = true;

                let text = std::mem::take(&mut self.interviewer_transcript);
                self.response_audio_bytes = 0;
                if !text.is_empty() {
                    let session = self.session.as_mut().unwrap();
                    let question_index = session.question_index;
                    let timestamp = Utc::now();
                    session.push_transcript(TranscriptEntry {
                        speaker: Speaker::Interviewer,
                        text: text.clone(),
                        timestamp,
                        question_index,
                        confidence: None,
                    });
                    self.send(
                        ctx,
                        &ServerMessage::Transcript {
                            speaker: Speaker::Interviewer,
                            text,
                            question_index,
                            timestamp: timestamp.timestamp_millis() as u64,
                            confidence: None,
                        },
                    );
                }
            }

            ProviderEvent::SpeechStarted => {
                let now = Utc::now();
                let (start, context) = Self::silence_anchor(session);
                let question_index = session.question_index;
                session
                    .metrics
                    .record_silence(start, now, context, question_index);
                session.mark_activity();
            }

            ProviderEvent::SpeechStopped => {
                session.speech_stopped_at = Some(Instant::now());
                session.last_speech_ended_at = Some(Utc::now());
                session.last_speaker = Some(Speaker::Respondent);
            }

            ProviderEvent::Error { message } => {
                error!(session_id = %session.session_id, error_message = %message, "Provider reported an error");
                self.send_error(ctx, "provider_error", &message);
            }
        }
    }
}

impl Handler<ProviderClosed> for InterviewBridge {
    type Result = ();

    fn handle(&mut self, msg: ProviderClosed, ctx: &mut Self::Context) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if msg.connection_id != session.connection_id || session.is_finalizing {
            return;
        }

        if !self.reconnect_used {
            self.reconnect_used = true;
            warn!(session_id = %session.session_id, "Provider socket lost; reconnecting once");
            session.next_connection();
            session.session_configured = false;
            self.connect_provider(ctx);
            return;
        }

        error!(session_id = %session.session_id, "Provider socket lost again; terminating session");
        self.finalize(ctx, TerminationReason::ProviderFailure, false);
    }
}

impl Handler<GuidanceArrived> for InterviewBridge {
    type Result = ();

    fn handle(&mut self, msg: GuidanceArrived, _ctx: &mut Self::Context) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        // Always clear the outstanding flag for the current connection, but
        // never apply guidance computed against a previous connection's view.
        if msg.connection_id != session.connection_id {
            return;
        }
        session.awaiting_analysis = false;

        if let Some(guidance) = msg.guidance {
            debug!(
                session_id = %session.session_id,
                action = guidance.action.as_str(),
                confidence = guidance.confidence,
                "Guidance received"
            );
            session.deliver_guidance(guidance);
        }
    }
}

impl Handler<WatchdogWarning> for InterviewBridge {
    type Result = ();

    fn handle(&mut self, msg: WatchdogWarning, ctx: &mut Self::Context) {
        self.send(
            ctx,
            &ServerMessage::TerminationWarning {
                reason: msg.reason.as_str().to_string(),
                seconds_remaining: msg.seconds_remaining,
            },
        );
    }
}

impl Handler<FinalizeSession> for InterviewBridge {
    type Result = ();

    fn handle(&mut self, msg: FinalizeSession, ctx: &mut Self::Context) {
        // The watchdog claimed the latch before sending this.
        self.finalize(ctx, msg.reason, true);
    }
}

/// HTTP upgrade handler for `/ws/interview`.
///
/// A bare connection starts a fresh session (the client's first message is
/// `start_session`). A connection carrying `session_id` and `resume_token`
/// query parameters attempts to restore a persisted session; the token is
/// redeemed before the upgrade so an invalid one fails fast with a 401.
pub async fn interview_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<std::collections::HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(std::collections::HashMap::new()));

    let session_id = query.get("session_id").cloned();
    let resume_token = query.get("resume_token").cloned();

    let bridge = match (session_id, resume_token) {
        (Some(session_id), Some(token)) => {
            match state.store.redeem_resume_token(&session_id, &token).await {
                Ok(Some(snapshot)) => InterviewBridge::resuming(state.get_ref().clone(), snapshot),
                Ok(None) => {
                    return Err(crate::error::AppError::Unauthorized(
                        "Invalid or expired resume token".to_string(),
                    )
                    .into());
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Resume token redemption failed");
                    return Err(crate::error::AppError::Internal(
                        "Failed to load session snapshot".to_string(),
                    )
                    .into());
                }
            }
        }
        _ => {
            // Resumed sessions reuse their registry entry, so only fresh
            // connections are turned away at the door.
            if state.registry.at_capacity() {
                return Err(crate::error::AppError::SessionLimit(
                    "Maximum concurrent sessions reached".to_string(),
                )
                .into());
            }
            InterviewBridge::new(state.get_ref().clone())
        }
    };

    ws::start(bridge, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::Question;

    fn session() -> InterviewSession {
        InterviewSession::new(
            "s1".to_string(),
            vec![Question {
                text: "How did you hear about us?".to_string(),
                guidance: Some("Keep this one brief.".to_string()),
                recommended_followup_depth: 1,
            }],
            vec![],
        )
    }

    #[test]
    fn test_audio_gate_closed_until_configured() {
        let mut s = session();
        assert!(!InterviewBridge::audio_gate_open(&s));

        s.session_configured = true;
        assert!(InterviewBridge::audio_gate_open(&s));
    }

    #[test]
    fn test_audio_gate_closed_while_awaiting_resume() {
        let mut s = session();
        s.session_configured = true;
        s.awaiting_resume = true;
        assert!(!InterviewBridge::audio_gate_open(&s));

        // Explicit resume reopens the gate.
        s.awaiting_resume = false;
        assert!(InterviewBridge::audio_gate_open(&s));
    }

    #[test]
    fn test_audio_gate_closed_while_finalizing() {
        let mut s = session();
        s.session_configured = true;
        s.is_finalizing = true;
        assert!(!InterviewBridge::audio_gate_open(&s));
    }

    #[test]
    fn test_response_gated_until_provider_configured() {
        let mut s = session();
        // A response.create queued ahead of session.update would run with
        // default instructions.
        assert!(!InterviewBridge::can_create_response(&s));

        s.session_configured = true;
        assert!(InterviewBridge::can_create_response(&s));

        s.awaiting_resume = true;
        assert!(!InterviewBridge::can_create_response(&s));
    }

    #[test]
    fn test_silence_anchor_before_any_speech() {
        let s = session();
        let (start, context) = InterviewBridge::silence_anchor(&s);
        assert_eq!(start, s.created_at);
        assert_eq!(context, SilenceContext::Initial);
    }

    #[test]
    fn test_silence_anchor_follows_last_speaker() {
        let mut s = session();
        let ended = Utc::now();
        s.last_speech_ended_at = Some(ended);
        s.last_speaker = Some(Speaker::Interviewer);

        let (start, context) = InterviewBridge::silence_anchor(&s);
        assert_eq!(start, ended);
        assert_eq!(context, SilenceContext::AfterInterviewer);
    }

    #[test]
    fn test_silence_anchor_for_resumed_session() {
        let mut s = session();
        s.created_at = Utc::now() - chrono::Duration::minutes(40);
        // Restore leaves a fresh anchor and no last speaker.
        let anchor = Utc::now();
        s.last_speech_ended_at = Some(anchor);

        let (start, context) = InterviewBridge::silence_anchor(&s);
        assert_eq!(start, anchor);
        assert_eq!(context, SilenceContext::Initial);
        // Never the forty-minute-old creation time.
        assert!(Utc::now().signed_duration_since(start).num_seconds() < 5);
    }

    #[test]
    fn test_instructions_carry_question_and_guidance() {
        let s = session();
        let instructions = InterviewBridge::build_instructions(&s);
        assert!(instructions.contains("How did you hear about us?"));
        assert!(instructions.contains("Keep this one brief."));
    }

    #[test]
    fn test_question_repeat_phrases_lowercase() {
        // Matched against lowercased utterances; a phrase with uppercase
        // characters here could never match.
        for phrase in QUESTION_REPEAT_PHRASES {
            assert_eq!(*phrase, phrase.to_lowercase());
        }
    }
}
