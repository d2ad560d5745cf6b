//! # Quality Signal Aggregator
//!
//! Per-session state fed by the stateless detectors. Keeps rolling counters,
//! a fixed-capacity sliding window of recent utterance flags, the 0-100
//! quality score, the environment-check trigger policy and the turn-detection
//! eagerness adaptation.
//!
//! ## Invariants:
//! - The sliding window never exceeds [`WINDOW_CAPACITY`] entries (FIFO).
//! - Counters are monotonically non-decreasing, except the short-utterance
//!   streak which resets on any utterance of [`SHORT_UTTERANCE_WORDS`]+ words.
//! - The environment check fires at most once per
//!   [`ENVIRONMENT_CHECK_COOLDOWN`] utterances.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::Eagerness;

use super::detectors::{detect_foreign_language, detect_incoherence, detect_repeated_word_glitch};

/// Capacity of the recent-utterance flag window.
pub const WINDOW_CAPACITY: usize = 5;

/// Minimum word count for an utterance not to count as "short".
pub const SHORT_UTTERANCE_WORDS: usize = 3;

/// Utterances that must pass after an environment check before another one
/// may fire.
pub const ENVIRONMENT_CHECK_COOLDOWN: u32 = 5;

/// Consecutive clean short utterances before listening eagerness is lowered.
const EAGERNESS_LOWER_STREAK: u32 = 4;

/// Consecutive good utterances before default eagerness is restored.
const EAGERNESS_RESTORE_STREAK: u32 = 10;

/// Boolean issue flags for one utterance, stored in the sliding window so
/// "any issue in the last K utterances" never has to be re-derived from the
/// raw counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UtteranceFlags {
    pub foreign_language: bool,
    pub incoherent: bool,
    pub repeated_word: bool,
    pub short: bool,
}

impl UtteranceFlags {
    fn any_issue(&self) -> bool {
        self.foreign_language || self.incoherent || self.repeated_word
    }
}

/// What the aggregator concluded about one utterance.
#[derive(Debug, Clone)]
pub struct UtteranceReport {
    pub flags: UtteranceFlags,
    /// Human-readable issue tags for the client quality warning.
    pub issues: Vec<String>,
    /// Quality score after this utterance (0-100).
    pub score: u8,
    /// The environment-check policy fired on this utterance.
    pub environment_check: bool,
    /// The eagerness adaptation wants a provider turn-detection update.
    pub eagerness_change: Option<Eagerness>,
}

/// Per-session quality signal state. Serialized whole into the session
/// snapshot so counters survive a resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySignals {
    foreign_language_count: u32,
    incoherent_count: u32,
    repeated_word_count: u32,
    question_repeat_count: u32,
    short_utterance_streak: u32,

    window: VecDeque<UtteranceFlags>,

    environment_check_triggered: bool,
    environment_check_at: Option<DateTime<Utc>>,
    utterances_since_trigger: u32,

    good_utterance_streak: u32,
    eagerness: Eagerness,
}

impl Default for QualitySignals {
    fn default() -> Self {
        Self {
            foreign_language_count: 0,
            incoherent_count: 0,
            repeated_word_count: 0,
            question_repeat_count: 0,
            short_utterance_streak: 0,
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            environment_check_triggered: false,
            environment_check_at: None,
            utterances_since_trigger: 0,
            good_utterance_streak: 0,
            eagerness: Eagerness::Auto,
        }
    }
}

impl QualitySignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one finalized respondent utterance through the detectors and
    /// update all aggregate state.
    pub fn observe_utterance(&mut self, text: &str) -> UtteranceReport {
        let foreign = detect_foreign_language(text);
        let incoherent = detect_incoherence(text);
        let repeated = detect_repeated_word_glitch(text);

        let word_count = text.split_whitespace().count();
        let short = word_count < SHORT_UTTERANCE_WORDS;

        let flags = UtteranceFlags {
            foreign_language: foreign.detected,
            incoherent: incoherent.detected,
            repeated_word: repeated.detected,
            short,
        };

        if foreign.detected {
            self.foreign_language_count += 1;
        }
        if incoherent.detected {
            self.incoherent_count += 1;
        }
        if repeated.detected {
            self.repeated_word_count += 1;
        }
        if short {
            self.short_utterance_streak += 1;
        } else {
            self.short_utterance_streak = 0;
        }

        if self.environment_check_triggered {
            self.utterances_since_trigger = self.utterances_since_trigger.saturating_add(1);
        }

        self.push_window(flags);

        let mut issues = Vec::new();
        if foreign.detected {
            issues.push("foreign_language".to_string());
        }
        if incoherent.detected {
            issues.push("incoherent_phrase".to_string());
        }
        if repeated.detected {
            let word = repeated.repeated_word.as_deref().unwrap_or("?");
            issues.push(format!("repeated_word:{}x{}", word, repeated.repeat_count));
        }

        let environment_check = self.maybe_trigger_environment_check();
        let eagerness_change = self.adapt_eagerness(&flags, word_count);

        UtteranceReport {
            flags,
            issues,
            score: self.score(),
            environment_check,
            eagerness_change,
        }
    }

    /// The interviewer repeated a question (same question index answered
    /// again); a high repeat count suggests the respondent cannot hear well.
    pub fn note_question_repeat(&mut self) {
        self.question_repeat_count += 1;
    }

    /// Compute the 0-100 quality score from the current counters.
    ///
    /// Starting from 100: up to 60 off for foreign language, up to 30 for
    /// incoherence, 15 + 5 per excess repeat for question repeats at 3+,
    /// 5 per excess for a short-utterance streak above 2, up to 45 for
    /// repeated-word glitches. Floored at 0.
    pub fn score(&self) -> u8 {
        let mut penalty: u32 = 0;

        penalty += (self.foreign_language_count * 20).min(60);
        penalty += (self.incoherent_count * 10).min(30);

        if self.question_repeat_count >= 3 {
            penalty += 15 + 5 * (self.question_repeat_count - 3);
        }

        if self.short_utterance_streak > 2 {
            penalty += 5 * (self.short_utterance_streak - 2);
        }

        penalty += (self.repeated_word_count * 15).min(45);

        100u32.saturating_sub(penalty) as u8
    }

    /// True if any non-short issue flag is set in the sliding window.
    pub fn recent_issue_in_window(&self) -> bool {
        self.window.iter().any(|f| f.any_issue())
    }

    pub fn short_utterance_streak(&self) -> u32 {
        self.short_utterance_streak
    }

    pub fn question_repeat_count(&self) -> u32 {
        self.question_repeat_count
    }

    pub fn eagerness(&self) -> Eagerness {
        self.eagerness
    }

    #[cfg(test)]
    pub(crate) fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Reset adaptation state on session resume. Counters and the trigger
    /// history survive; eagerness and streaks restart because the restored
    /// respondent's environment may have changed.
    pub fn reset_for_resume(&mut self) {
        self.eagerness = Eagerness::Auto;
        self.good_utterance_streak = 0;
        self.short_utterance_streak = 0;
        self.window.clear();
    }

    fn push_window(&mut self, flags: UtteranceFlags) {
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(flags);
    }

    /// Environment-check trigger policy: fire if any foreign-language
    /// utterance occurred, or at least two of {short streak >= 3, question
    /// repeats >= 3, incoherent count >= 2} hold — but never twice within
    /// the cooldown window.
    fn maybe_trigger_environment_check(&mut self) -> bool {
        if self.environment_check_triggered
            && self.utterances_since_trigger < ENVIRONMENT_CHECK_COOLDOWN
        {
            return false;
        }

        let foreign = self.foreign_language_count >= 1;
        let secondary = [
            self.short_utterance_streak >= 3,
            self.question_repeat_count >= 3,
            self.incoherent_count >= 2,
        ]
        .iter()
        .filter(|&&c| c)
        .count();

        if foreign || secondary >= 2 {
            self.environment_check_triggered = true;
            self.environment_check_at = Some(Utc::now());
            self.utterances_since_trigger = 0;
            true
        } else {
            false
        }
    }

    /// Turn-detection eagerness adaptation.
    ///
    /// If short utterances dominate (4+ in a row) with no other issue in the
    /// recent window, the provider is probably cutting the respondent off:
    /// lower the eagerness. Restore the default after 10 consecutive good
    /// utterances (3+ words, no recent issues, streak back at zero).
    fn adapt_eagerness(&mut self, flags: &UtteranceFlags, word_count: usize) -> Option<Eagerness> {
        let good = word_count >= SHORT_UTTERANCE_WORDS
            && !flags.any_issue()
            && !self.recent_issue_in_window()
            && self.short_utterance_streak == 0;

        if good {
            self.good_utterance_streak += 1;
        } else {
            self.good_utterance_streak = 0;
        }

        if self.eagerness == Eagerness::Auto
            && self.short_utterance_streak >= EAGERNESS_LOWER_STREAK
            && !self.recent_issue_in_window()
        {
            self.eagerness = Eagerness::Low;
            return Some(Eagerness::Low);
        }

        if self.eagerness == Eagerness::Low && self.good_utterance_streak >= EAGERNESS_RESTORE_STREAK {
            self.eagerness = Eagerness::Auto;
            return Some(Eagerness::Auto);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_UTTERANCE: &str = "I usually take the train to work every morning.";

    #[test]
    fn test_fresh_session_scores_100() {
        let signals = QualitySignals::new();
        assert_eq!(signals.score(), 100);
    }

    #[test]
    fn test_score_non_increasing_with_issues() {
        let mut signals = QualitySignals::new();
        let mut last_score = signals.score();

        for _ in 0..4 {
            let report = signals.observe_utterance("c'est très bien");
            assert!(report.score <= last_score, "score must not increase as issues accumulate");
            last_score = report.score;
        }

        // Foreign-language penalty is capped at 60.
        assert_eq!(signals.score(), 100 - 60);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let mut signals = QualitySignals::new();
        for _ in 0..10 {
            signals.observe_utterance("สวัสดี");
            signals.observe_utterance("la la la la la la");
            signals.note_question_repeat();
        }
        assert_eq!(signals.score(), 0);
    }

    #[test]
    fn test_window_capped_fifo() {
        let mut signals = QualitySignals::new();
        // First utterance has an issue, the rest are clean.
        signals.observe_utterance("สวัสดี");
        assert!(signals.recent_issue_in_window());

        for _ in 0..WINDOW_CAPACITY {
            signals.observe_utterance(GOOD_UTTERANCE);
            assert!(signals.window_len() <= WINDOW_CAPACITY);
        }

        // The flagged entry has been evicted (oldest first).
        assert!(!signals.recent_issue_in_window());
    }

    #[test]
    fn test_short_streak_resets() {
        let mut signals = QualitySignals::new();
        signals.observe_utterance("yes");
        signals.observe_utterance("maybe");
        assert_eq!(signals.short_utterance_streak(), 2);

        signals.observe_utterance(GOOD_UTTERANCE);
        assert_eq!(signals.short_utterance_streak(), 0);
    }

    #[test]
    fn test_environment_check_on_foreign_language() {
        let mut signals = QualitySignals::new();
        let report = signals.observe_utterance("สวัสดีครับ");
        assert!(report.environment_check);
    }

    #[test]
    fn test_environment_check_needs_two_secondary_conditions() {
        let mut signals = QualitySignals::new();

        // Two incoherent utterances alone: only one condition true.
        signals.observe_utterance("la la la la");
        let report = signals.observe_utterance("na na na na");
        assert!(!report.environment_check);

        // Question repeats push a second condition over its threshold.
        signals.note_question_repeat();
        signals.note_question_repeat();
        signals.note_question_repeat();
        let report = signals.observe_utterance(GOOD_UTTERANCE);
        assert!(report.environment_check);
    }

    #[test]
    fn test_environment_check_cooldown() {
        let mut signals = QualitySignals::new();

        let report = signals.observe_utterance("สวัสดี");
        assert!(report.environment_check);

        // Still qualifying on every utterance, but inside the cooldown.
        let mut fired = 0;
        for _ in 0..ENVIRONMENT_CHECK_COOLDOWN - 1 {
            if signals.observe_utterance("สวัสดี").environment_check {
                fired += 1;
            }
        }
        assert_eq!(fired, 0, "no trigger inside the cooldown window");

        // Cooldown elapsed: it may fire again.
        let report = signals.observe_utterance("สวัสดี");
        assert!(report.environment_check);
    }

    #[test]
    fn test_eagerness_lowered_on_clean_short_streak() {
        let mut signals = QualitySignals::new();

        let mut change = None;
        for _ in 0..EAGERNESS_LOWER_STREAK {
            change = signals.observe_utterance("sure").eagerness_change;
        }
        assert_eq!(change, Some(Eagerness::Low));
        assert_eq!(signals.eagerness(), Eagerness::Low);
    }

    #[test]
    fn test_eagerness_not_lowered_when_other_issues_present() {
        let mut signals = QualitySignals::new();
        signals.observe_utterance("la la la la"); // incoherent, lands in window

        // While the incoherent entry is still inside the window, a short
        // streak alone must not lower eagerness.
        for _ in 0..EAGERNESS_LOWER_STREAK {
            let report = signals.observe_utterance("ok");
            assert!(report.eagerness_change.is_none(), "timing fix only applies to clean audio");
        }
    }

    #[test]
    fn test_eagerness_restored_after_good_run() {
        let mut signals = QualitySignals::new();
        for _ in 0..EAGERNESS_LOWER_STREAK {
            signals.observe_utterance("sure");
        }
        assert_eq!(signals.eagerness(), Eagerness::Low);

        let mut restored = None;
        for _ in 0..EAGERNESS_RESTORE_STREAK + WINDOW_CAPACITY as u32 {
            if let Some(change) = signals.observe_utterance(GOOD_UTTERANCE).eagerness_change {
                restored = Some(change);
            }
        }
        assert_eq!(restored, Some(Eagerness::Auto));
        assert_eq!(signals.eagerness(), Eagerness::Auto);
    }

    #[test]
    fn test_resume_resets_adaptation_only() {
        let mut signals = QualitySignals::new();
        signals.observe_utterance("สวัสดี");
        for _ in 0..EAGERNESS_LOWER_STREAK + WINDOW_CAPACITY as u32 {
            signals.observe_utterance("ok");
        }

        let score_before = signals.score();
        signals.reset_for_resume();

        assert_eq!(signals.eagerness(), Eagerness::Auto);
        assert_eq!(signals.short_utterance_streak(), 0);
        // Counters survive: the score reflects history, minus streak penalty.
        assert!(signals.score() >= score_before);
        assert!(signals.score() < 100);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut signals = QualitySignals::new();
        signals.observe_utterance("c'est très bien");
        signals.note_question_repeat();

        let json = serde_json::to_string(&signals).unwrap();
        let restored: QualitySignals = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.score(), signals.score());
        assert_eq!(restored.question_repeat_count(), 1);
    }
}
