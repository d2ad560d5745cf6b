//! # Client Wire Protocol
//!
//! Message types exchanged between the respondent's browser and the bridge
//! over the `/ws/interview` WebSocket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects, optionally with `session_id` and
//!    `resume_token` query parameters to restore a previous session
//! 2. **Start**: First message is `start_session` (or the connection was a
//!    restore, in which case the server replies with `session_resumed`)
//! 3. **Audio readiness**: Client sends `audio_ready` once its playback
//!    pipeline is up; until then the bridge queues outbound audio so the
//!    opening line is not clipped
//! 4. **Streaming**: Binary frames carry PCM16 microphone audio; `audio_chunk`
//!    is a base64 text fallback for clients that cannot send binary frames
//! 5. **Heartbeat**: Server sends `ping`, client answers `pong`
//!
//! ## Design:
//! Both directions are closed tagged enums, so an unknown message type is a
//! deserialization error we log once, not a silently ignored string branch.
//! New message types force an update here and exhaustive matches downstream.

use serde::{Deserialize, Serialize};

use crate::session::state::{Question, Speaker};

/// A question supplied by the client when starting a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub text: String,
    /// Per-question steering guidance for the interviewer model.
    #[serde(default)]
    pub guidance: Option<String>,
    /// How many follow-up probes are appropriate for this question (0-3).
    #[serde(default)]
    pub recommended_followup_depth: u8,
}

impl From<QuestionSpec> for Question {
    fn from(spec: QuestionSpec) -> Self {
        Question {
            text: spec.text,
            guidance: spec.guidance,
            recommended_followup_depth: spec.recommended_followup_depth.min(3),
        }
    }
}

/// Messages the client may send to the bridge.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a brand-new interview session.
    StartSession {
        /// Optional client-provided session ID; a UUID is generated if absent.
        session_id: Option<String>,
        /// Ordered interview script.
        questions: Vec<QuestionSpec>,
        /// Optional free-form questions appended after the scripted template.
        #[serde(default)]
        additional_questions: Vec<String>,
    },

    /// The client's audio playback pipeline is ready; queued audio may flow.
    AudioReady,

    /// Base64-encoded PCM16 audio, text-frame fallback for binary frames.
    AudioChunk { data: String },

    /// Typed answer fallback when the respondent cannot or will not speak.
    TextInput { text: String },

    /// Explicit confirmation that a restored session should go live again.
    /// Until this arrives, inbound audio is dropped so provider-side voice
    /// activity detection cannot auto-trigger a response.
    ResumeInterview,

    /// Heartbeat response to a server `ping`.
    Pong { timestamp: u64 },
}

/// Messages the bridge sends to the client.
///
/// Outbound interviewer audio is relayed as binary WebSocket frames and does
/// not appear here; everything else is JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// New session accepted and the provider socket is being configured.
    SessionStarted {
        session_id: String,
        question_index: usize,
        question: String,
    },

    /// A persisted session was restored; the bridge is awaiting
    /// `resume_interview` before any audio is forwarded.
    SessionResumed {
        session_id: String,
        question_index: usize,
        question: String,
    },

    /// A transcript entry was finalized (either speaker).
    Transcript {
        speaker: Speaker,
        text: String,
        question_index: usize,
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    /// Audio/transcription quality degraded past a threshold.
    TranscriptionQualityWarning {
        issues: Vec<String>,
        quality_score: u8,
    },

    /// The interview advanced to a new question.
    QuestionChanged {
        question_index: usize,
        question: String,
    },

    /// An orchestrator guidance item was applied to the conversation.
    GuidanceApplied {
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The session will be terminated soon unless activity resumes.
    TerminationWarning {
        reason: String,
        seconds_remaining: u64,
    },

    /// The session has ended; no further messages will be sent.
    SessionComplete { reason: String },

    /// Error information; fatal errors are followed by `session_complete`.
    Error {
        code: String,
        message: String,
    },

    /// Application-level heartbeat probe.
    Ping { timestamp: u64 },
}
