//! # Per-Session Metrics Tracker
//!
//! Accumulates everything we want to know about one interview after the
//! fact: token usage split by modality, paired latency samples, interviewer
//! speaking time, silence segments and turn-detection eagerness switches.
//!
//! ## Silence accounting:
//! Two structures by design. A capped detail log keeps the N most recent
//! segments for inspection; an uncapped running accumulator (count, total
//! duration, per-context breakdown, duration array for percentiles) keeps
//! the statistics accurate even after the detail log has been pruned.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{Eagerness, TokenCounts};

/// Most recent silence segments kept for inspection.
const SILENCE_LOG_CAPACITY: usize = 100;

/// Segments shorter than this are discarded as noise, not silence.
pub const MIN_SILENCE_MS: u64 = 1500;

/// Token usage split by modality and direction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_text: u64,
    pub input_audio: u64,
    pub output_text: u64,
    pub output_audio: u64,
}

impl TokenUsage {
    pub fn add(&mut self, counts: &TokenCounts) {
        self.input_text += counts.input_text;
        self.input_audio += counts.input_audio;
        self.output_text += counts.output_text;
        self.output_audio += counts.output_audio;
    }

    pub fn total(&self) -> u64 {
        self.input_text + self.input_audio + self.output_text + self.output_audio
    }
}

/// Who spoke immediately before a silence segment began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SilenceContext {
    /// Session start; nobody has spoken yet.
    Initial,
    AfterInterviewer,
    AfterRespondent,
}

/// One recorded silence segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceSegment {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub context: SilenceContext,
    pub question_index: usize,
}

/// Uncapped running silence statistics, decoupled from the detail log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SilenceStats {
    pub count: u64,
    pub total_ms: u64,
    pub initial_count: u64,
    pub after_interviewer_count: u64,
    pub after_respondent_count: u64,
    /// All durations ever recorded; sorted on demand for percentiles.
    durations_ms: Vec<u64>,
}

impl SilenceStats {
    fn record(&mut self, duration_ms: u64, context: SilenceContext) {
        self.count += 1;
        self.total_ms += duration_ms;
        match context {
            SilenceContext::Initial => self.initial_count += 1,
            SilenceContext::AfterInterviewer => self.after_interviewer_count += 1,
            SilenceContext::AfterRespondent => self.after_respondent_count += 1,
        }
        self.durations_ms.push(duration_ms);
    }

    /// Percentile over all recorded durations (nearest-rank).
    pub fn percentile_ms(&self, p: f64) -> Option<u64> {
        if self.durations_ms.is_empty() {
            return None;
        }
        let mut sorted = self.durations_ms.clone();
        sorted.sort_unstable();

        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = rank.max(1).min(sorted.len()) - 1;
        Some(sorted[index])
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// One turn-detection eagerness switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EagernessSwitch {
    pub at: DateTime<Utc>,
    pub to: Eagerness,
}

/// Everything accumulated for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub tokens: TokenUsage,

    /// Speech-end → transcription-ready, per utterance.
    transcription_latency_ms: Vec<u64>,
    /// Transcription-ready → first interviewer audio byte, per response.
    response_latency_ms: Vec<u64>,

    pub interviewer_speaking_ms: u64,
    pub interviewer_turns: u32,

    silence_log: VecDeque<SilenceSegment>,
    pub silence: SilenceStats,

    pub eagerness_switches: Vec<EagernessSwitch>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transcription_latency(&mut self, ms: u64) {
        self.transcription_latency_ms.push(ms);
    }

    pub fn record_response_latency(&mut self, ms: u64) {
        self.response_latency_ms.push(ms);
    }

    pub fn record_interviewer_turn(&mut self, speaking_ms: u64) {
        self.interviewer_turns += 1;
        self.interviewer_speaking_ms += speaking_ms;
    }

    pub fn record_eagerness_switch(&mut self, to: Eagerness) {
        self.eagerness_switches.push(EagernessSwitch { at: Utc::now(), to });
    }

    /// Record one silence segment. Returns false if the segment was below
    /// the minimum duration floor and discarded.
    pub fn record_silence(
        &mut self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        context: SilenceContext,
        question_index: usize,
    ) -> bool {
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        if duration_ms < MIN_SILENCE_MS {
            return false;
        }

        self.silence.record(duration_ms, context);

        if self.silence_log.len() == SILENCE_LOG_CAPACITY {
            self.silence_log.pop_front();
        }
        self.silence_log.push_back(SilenceSegment {
            started_at,
            ended_at,
            duration_ms,
            context,
            question_index,
        });

        true
    }

    pub fn recent_silence_segments(&self) -> impl Iterator<Item = &SilenceSegment> {
        self.silence_log.iter()
    }

    pub fn mean_transcription_latency_ms(&self) -> f64 {
        mean(&self.transcription_latency_ms)
    }

    pub fn mean_response_latency_ms(&self) -> f64 {
        mean(&self.response_latency_ms)
    }

    /// JSON summary for the REST inspection endpoint and the final snapshot.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "tokens": {
                "input_text": self.tokens.input_text,
                "input_audio": self.tokens.input_audio,
                "output_text": self.tokens.output_text,
                "output_audio": self.tokens.output_audio,
                "total": self.tokens.total()
            },
            "latency": {
                "transcription_samples": self.transcription_latency_ms.len(),
                "transcription_mean_ms": self.mean_transcription_latency_ms(),
                "response_samples": self.response_latency_ms.len(),
                "response_mean_ms": self.mean_response_latency_ms()
            },
            "interviewer": {
                "turns": self.interviewer_turns,
                "speaking_ms": self.interviewer_speaking_ms
            },
            "silence": {
                "count": self.silence.count,
                "total_ms": self.silence.total_ms,
                "mean_ms": self.silence.mean_ms(),
                "p50_ms": self.silence.percentile_ms(50.0),
                "p90_ms": self.silence.percentile_ms(90.0),
                "initial": self.silence.initial_count,
                "after_interviewer": self.silence.after_interviewer_count,
                "after_respondent": self.silence.after_respondent_count
            },
            "eagerness_switches": self.eagerness_switches.len()
        })
    }
}

fn mean(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seg(metrics: &mut SessionMetrics, ms: i64, context: SilenceContext) -> bool {
        let start = Utc::now();
        metrics.record_silence(start, start + Duration::milliseconds(ms), context, 0)
    }

    #[test]
    fn test_short_silence_discarded() {
        let mut metrics = SessionMetrics::new();
        assert!(!seg(&mut metrics, 800, SilenceContext::Initial));
        assert_eq!(metrics.silence.count, 0);
        assert_eq!(metrics.recent_silence_segments().count(), 0);
    }

    #[test]
    fn test_silence_contexts_counted() {
        let mut metrics = SessionMetrics::new();
        assert!(seg(&mut metrics, 2000, SilenceContext::Initial));
        assert!(seg(&mut metrics, 3000, SilenceContext::AfterInterviewer));
        assert!(seg(&mut metrics, 4000, SilenceContext::AfterInterviewer));
        assert!(seg(&mut metrics, 5000, SilenceContext::AfterRespondent));

        assert_eq!(metrics.silence.count, 4);
        assert_eq!(metrics.silence.initial_count, 1);
        assert_eq!(metrics.silence.after_interviewer_count, 2);
        assert_eq!(metrics.silence.after_respondent_count, 1);
        assert_eq!(metrics.silence.total_ms, 14_000);
    }

    #[test]
    fn test_stats_survive_log_pruning() {
        let mut metrics = SessionMetrics::new();
        for _ in 0..SILENCE_LOG_CAPACITY + 50 {
            seg(&mut metrics, 2000, SilenceContext::AfterInterviewer);
        }

        // Detail log is capped; the accumulator is not.
        assert_eq!(metrics.recent_silence_segments().count(), SILENCE_LOG_CAPACITY);
        assert_eq!(metrics.silence.count, (SILENCE_LOG_CAPACITY + 50) as u64);
        assert_eq!(metrics.silence.percentile_ms(50.0), Some(2000));
    }

    #[test]
    fn test_percentiles() {
        let mut metrics = SessionMetrics::new();
        for ms in [2000i64, 3000, 4000, 5000, 6000, 7000, 8000, 9000, 10_000, 11_000] {
            seg(&mut metrics, ms, SilenceContext::AfterRespondent);
        }

        assert_eq!(metrics.silence.percentile_ms(50.0), Some(6000));
        assert_eq!(metrics.silence.percentile_ms(90.0), Some(10_000));
        assert_eq!(metrics.silence.percentile_ms(100.0), Some(11_000));
    }

    #[test]
    fn test_percentile_empty() {
        let metrics = SessionMetrics::new();
        assert_eq!(metrics.silence.percentile_ms(50.0), None);
    }

    #[test]
    fn test_token_accumulation() {
        let mut metrics = SessionMetrics::new();
        metrics.tokens.add(&TokenCounts {
            input_text: 10,
            input_audio: 200,
            output_text: 5,
            output_audio: 150,
        });
        metrics.tokens.add(&TokenCounts {
            input_text: 1,
            input_audio: 2,
            output_text: 3,
            output_audio: 4,
        });

        assert_eq!(metrics.tokens.input_audio, 202);
        assert_eq!(metrics.tokens.total(), 375);
    }

    #[test]
    fn test_latency_means() {
        let mut metrics = SessionMetrics::new();
        metrics.record_transcription_latency(100);
        metrics.record_transcription_latency(300);
        assert!((metrics.mean_transcription_latency_ms() - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.mean_response_latency_ms(), 0.0);
    }
}
