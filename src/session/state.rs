//! # Session State
//!
//! The authoritative per-session record. Owned exclusively by the bridge
//! actor — every mutation happens on the actor's event loop, which is what
//! makes the response-creation guard, guidance mailbox and quality
//! aggregator safe without further locking.
//!
//! ## Session Lifecycle:
//! 1. **Created**: first connection, questions loaded, provider connecting
//! 2. **Live**: audio flowing both ways, transcript accumulating
//! 3. **AwaitingResume**: restored from a snapshot; audio is dropped until
//!    the client explicitly resumes
//! 4. **Finalizing**: termination latched; persistence runs to completion
//! 5. **Closed**: removed from the registry

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::SessionMetrics;
use crate::orchestrator::Guidance;
use crate::quality::QualitySignals;

/// Bounded in-memory transcript window used for live analysis. The
/// unbounded log used for persistence is kept separately.
const TRANSCRIPT_WINDOW_CAPACITY: usize = 50;

/// Completion events for identifiers already in this set are duplicates and
/// get ignored.
const PROCESSED_RESPONSE_CAPACITY: usize = 64;

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Interviewer,
    Respondent,
}

/// One finalized utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub question_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// One scripted interview question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub guidance: Option<String>,
    pub recommended_followup_depth: u8,
}

/// Post-template free-form questions with their own cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdditionalQuestions {
    pub questions: Vec<String>,
    pub cursor: usize,
    pub active: bool,
}

/// Result of asking the response-creation guard for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseGate {
    /// No response in flight (or a stalled one was force-cleared); the
    /// caller may create a response and the flag is now set.
    Ready,
    /// A response is in flight and within its timeout; creation rejected.
    Busy,
}

/// The per-session record.
pub struct InterviewSession {
    pub session_id: String,

    /// Bumped on every (re)connection. Provider events, orchestrator replies
    /// and timers all carry the connection_id they were issued under; a
    /// mismatch means the event belongs to a dead socket and is dropped.
    pub connection_id: u64,

    pub question_index: usize,
    pub questions: Vec<Question>,
    pub additional: AdditionalQuestions,

    pub awaiting_resume: bool,
    pub is_finalizing: bool,
    pub session_configured: bool,
    pub audio_ready: bool,

    transcript_window: VecDeque<TranscriptEntry>,
    transcript_log: Vec<TranscriptEntry>,

    pub quality: QualitySignals,
    pub metrics: SessionMetrics,

    /// Single-slot guidance mailbox; latest wins.
    pending_guidance: Option<Guidance>,
    /// One orchestrator analysis outstanding at a time.
    pub awaiting_analysis: bool,

    response_in_progress: bool,
    response_started_at: Option<Instant>,
    pub current_response_id: Option<String>,
    processed_response_ids: VecDeque<String>,

    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,

    /// Timing anchors for the paired latency samples.
    pub speech_stopped_at: Option<Instant>,
    pub transcript_ready_at: Option<Instant>,
    /// Wall-clock anchor for silence segmentation.
    pub last_speech_ended_at: Option<DateTime<Utc>>,
    pub last_speaker: Option<Speaker>,
}

impl InterviewSession {
    pub fn new(session_id: String, questions: Vec<Question>, additional: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            connection_id: 1,
            question_index: 0,
            questions,
            additional: AdditionalQuestions {
                questions: additional,
                cursor: 0,
                active: false,
            },
            awaiting_resume: false,
            is_finalizing: false,
            session_configured: false,
            audio_ready: false,
            transcript_window: VecDeque::with_capacity(TRANSCRIPT_WINDOW_CAPACITY),
            transcript_log: Vec::new(),
            quality: QualitySignals::new(),
            metrics: SessionMetrics::new(),
            pending_guidance: None,
            awaiting_analysis: false,
            response_in_progress: false,
            response_started_at: None,
            current_response_id: None,
            processed_response_ids: VecDeque::with_capacity(PROCESSED_RESPONSE_CAPACITY),
            created_at: now,
            last_heartbeat: now,
            last_activity: now,
            disconnected_at: None,
            speech_stopped_at: None,
            transcript_ready_at: None,
            last_speech_ended_at: None,
            last_speaker: None,
        }
    }

    /// The question currently being asked, scripted or additional.
    pub fn current_question(&self) -> Option<&str> {
        if self.additional.active {
            self.additional
                .questions
                .get(self.additional.cursor)
                .map(|q| q.as_str())
        } else {
            self.questions.get(self.question_index).map(|q| q.text.as_str())
        }
    }

    /// Per-question steering guidance, only available for scripted questions.
    pub fn current_question_guidance(&self) -> Option<&str> {
        if self.additional.active {
            return None;
        }
        self.questions
            .get(self.question_index)?
            .guidance
            .as_deref()
    }

    /// Advance the cursor. Scripted questions first, then the additional
    /// phase. Returns the new current question, or `None` when the interview
    /// is out of material and should be completed.
    pub fn advance_question(&mut self) -> Option<&str> {
        if self.additional.active {
            self.additional.cursor += 1;
        } else if self.question_index + 1 < self.questions.len() {
            self.question_index += 1;
        } else if !self.additional.questions.is_empty() {
            self.additional.active = true;
            self.additional.cursor = 0;
        } else {
            return None;
        }

        self.current_question()
    }

    /// Append a transcript entry to both representations. The bounded
    /// window may prune its oldest entry; the log never does.
    pub fn push_transcript(&mut self, entry: TranscriptEntry) {
        if self.transcript_window.len() == TRANSCRIPT_WINDOW_CAPACITY {
            self.transcript_window.pop_front();
        }
        self.transcript_window.push_back(entry.clone());
        self.transcript_log.push(entry);
        self.last_activity = Utc::now();
    }

    /// Recent entries for live analysis (bounded).
    pub fn transcript_window(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.transcript_window.iter()
    }

    /// Full append-only log for persistence (unbounded).
    pub fn transcript_log(&self) -> &[TranscriptEntry] {
        &self.transcript_log
    }

    /// Replace the transcript log wholesale (snapshot restore). The live
    /// window is rebuilt from the tail of the log.
    pub fn restore_transcript(&mut self, log: Vec<TranscriptEntry>) {
        self.transcript_window.clear();
        let tail_start = log.len().saturating_sub(TRANSCRIPT_WINDOW_CAPACITY);
        for entry in &log[tail_start..] {
            self.transcript_window.push_back(entry.clone());
        }
        self.transcript_log = log;
    }

    /// Ask permission to create a provider response.
    ///
    /// At most one response may be in flight. A response that has been in
    /// flight longer than `timeout` is considered stalled — its completion
    /// event is never coming — and the flag is force-cleared so the session
    /// does not wedge permanently. The caller logs that anomaly.
    pub fn try_begin_response(&mut self, now: Instant, timeout: Duration) -> ResponseGate {
        if self.response_in_progress {
            match self.response_started_at {
                Some(started) if now.duration_since(started) >= timeout => {
                    // Stalled: fall through and claim the slot.
                    self.current_response_id = None;
                }
                _ => return ResponseGate::Busy,
            }
        }

        self.response_in_progress = true;
        self.response_started_at = Some(now);
        ResponseGate::Ready
    }

    /// Whether a response was in flight past its timeout (for logging the
    /// force-clear as an anomaly before calling [`Self::try_begin_response`]).
    pub fn response_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.response_in_progress
            && self
                .response_started_at
                .map(|s| now.duration_since(s) >= timeout)
                .unwrap_or(false)
    }

    pub fn response_in_progress(&self) -> bool {
        self.response_in_progress
    }

    /// Handle a response-completed event. Returns false for duplicate or
    /// already-processed identifiers (protocol anomaly: log and ignore).
    pub fn complete_response(&mut self, response_id: &str) -> bool {
        if self.processed_response_ids.iter().any(|id| id == response_id) {
            return false;
        }

        if self.processed_response_ids.len() == PROCESSED_RESPONSE_CAPACITY {
            self.processed_response_ids.pop_front();
        }
        self.processed_response_ids.push_back(response_id.to_string());

        self.response_in_progress = false;
        self.response_started_at = None;
        self.current_response_id = None;
        self.last_activity = Utc::now();
        true
    }

    /// Store an orchestrator guidance item. Single slot: a newer item
    /// replaces an unconsumed older one (latest wins).
    pub fn deliver_guidance(&mut self, guidance: Guidance) {
        self.pending_guidance = Some(guidance);
    }

    /// Consume the pending guidance for the next response creation.
    pub fn take_guidance(&mut self) -> Option<Guidance> {
        self.pending_guidance.take()
    }

    pub fn has_pending_guidance(&self) -> bool {
        self.pending_guidance.is_some()
    }

    pub fn mark_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn mark_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Bump the connection identifier, invalidating every event handler,
    /// timer and orchestrator reply issued under the previous connection.
    /// An analysis outstanding against the old connection will be dropped on
    /// arrival, so the outstanding flag is cleared here. The response guard
    /// is released for the same reason: a completion for a response created
    /// on the old socket can never arrive on the new one.
    pub fn next_connection(&mut self) -> u64 {
        self.connection_id += 1;
        self.disconnected_at = None;
        self.awaiting_analysis = false;
        self.response_in_progress = false;
        self.response_started_at = None;
        self.current_response_id = None;
        self.connection_id
    }
}

/// Serializable interview progress, shared by snapshots and REST inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionProgress {
    pub question_index: usize,
    pub total_questions: usize,
    pub additional_active: bool,
    pub additional_cursor: usize,
}

impl InterviewSession {
    pub fn progress(&self) -> QuestionProgress {
        QuestionProgress {
            question_index: self.question_index,
            total_questions: self.questions.len(),
            additional_active: self.additional.active,
            additional_cursor: self.additional.cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(text: &str) -> Question {
        Question {
            text: text.to_string(),
            guidance: None,
            recommended_followup_depth: 1,
        }
    }

    fn session_with(scripted: usize, additional: usize) -> InterviewSession {
        let questions = (0..scripted).map(|i| question(&format!("Q{}", i))).collect();
        let extra = (0..additional).map(|i| format!("A{}", i)).collect();
        InterviewSession::new("s1".to_string(), questions, extra)
    }

    fn entry(text: &str) -> TranscriptEntry {
        TranscriptEntry {
            speaker: Speaker::Respondent,
            text: text.to_string(),
            timestamp: Utc::now(),
            question_index: 0,
            confidence: None,
        }
    }

    #[test]
    fn test_question_cursor_through_additional_phase() {
        let mut session = session_with(2, 2);
        assert_eq!(session.current_question(), Some("Q0"));
        assert_eq!(session.advance_question(), Some("Q1"));
        assert_eq!(session.advance_question(), Some("A0"));
        assert!(session.additional.active);
        assert_eq!(session.advance_question(), Some("A1"));
        assert_eq!(session.advance_question(), None);
    }

    #[test]
    fn test_no_additional_phase() {
        let mut session = session_with(1, 0);
        assert_eq!(session.advance_question(), None);
    }

    #[test]
    fn test_response_guard_exclusive() {
        let mut session = session_with(1, 0);
        let now = Instant::now();
        let timeout = Duration::from_secs(30);

        assert_eq!(session.try_begin_response(now, timeout), ResponseGate::Ready);
        // Second attempt while in flight is rejected.
        assert_eq!(session.try_begin_response(now, timeout), ResponseGate::Busy);
        assert!(session.response_in_progress());
    }

    #[test]
    fn test_response_guard_timeout_force_clears() {
        let mut session = session_with(1, 0);
        let start = Instant::now();
        let timeout = Duration::from_secs(30);

        assert_eq!(session.try_begin_response(start, timeout), ResponseGate::Ready);

        // A response.done that never arrives must not wedge the session.
        let later = start + Duration::from_secs(31);
        assert!(session.response_stalled(later, timeout));
        assert_eq!(session.try_begin_response(later, timeout), ResponseGate::Ready);
    }

    #[test]
    fn test_duplicate_completion_ignored() {
        let mut session = session_with(1, 0);
        let now = Instant::now();
        session.try_begin_response(now, Duration::from_secs(30));

        assert!(session.complete_response("resp_1"));
        assert!(!session.response_in_progress());
        // Duplicate event for the same identifier.
        assert!(!session.complete_response("resp_1"));
    }

    #[test]
    fn test_processed_set_bounded() {
        let mut session = session_with(1, 0);
        for i in 0..PROCESSED_RESPONSE_CAPACITY + 10 {
            session.complete_response(&format!("resp_{}", i));
        }
        // The oldest identifiers have been evicted, so a very old duplicate
        // would be accepted again — the bound trades that for bounded memory.
        assert!(session.processed_response_ids.len() <= PROCESSED_RESPONSE_CAPACITY);
        assert!(session.complete_response("resp_0"));
    }

    #[test]
    fn test_transcript_window_bounded_log_unbounded() {
        let mut session = session_with(1, 0);
        for i in 0..TRANSCRIPT_WINDOW_CAPACITY + 25 {
            session.push_transcript(entry(&format!("utterance {}", i)));
        }

        assert_eq!(session.transcript_window().count(), TRANSCRIPT_WINDOW_CAPACITY);
        assert_eq!(session.transcript_log().len(), TRANSCRIPT_WINDOW_CAPACITY + 25);

        // Window holds the most recent entries.
        let first_in_window = session.transcript_window().next().unwrap();
        assert_eq!(first_in_window.text, "utterance 25");
    }

    #[test]
    fn test_guidance_mailbox_latest_wins() {
        use crate::orchestrator::{Guidance, GuidanceAction};

        let mut session = session_with(1, 0);
        session.deliver_guidance(Guidance {
            action: GuidanceAction::ProbeFollowup,
            message: None,
            confidence: 0.5,
            reasoning: String::new(),
        });
        session.deliver_guidance(Guidance {
            action: GuidanceAction::SuggestNextQuestion,
            message: None,
            confidence: 0.9,
            reasoning: String::new(),
        });

        let taken = session.take_guidance().unwrap();
        assert_eq!(taken.action, GuidanceAction::SuggestNextQuestion);
        assert!(session.take_guidance().is_none());
    }

    #[test]
    fn test_reconnect_releases_response_guard() {
        let mut session = session_with(1, 0);
        let now = Instant::now();
        let timeout = Duration::from_secs(30);
        assert_eq!(session.try_begin_response(now, timeout), ResponseGate::Ready);

        session.next_connection();

        // The in-flight response died with the old socket; the next creation
        // must not have to wait out the stall timeout.
        assert!(!session.response_in_progress());
        assert_eq!(session.try_begin_response(now, timeout), ResponseGate::Ready);
    }

    #[test]
    fn test_connection_id_bumps() {
        let mut session = session_with(1, 0);
        assert_eq!(session.connection_id, 1);
        session.disconnected_at = Some(Utc::now());
        assert_eq!(session.next_connection(), 2);
        assert!(session.disconnected_at.is_none());
    }
}
