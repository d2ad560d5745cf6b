//! # Transcription Quality Monitoring
//!
//! Heuristics over respondent utterances that distinguish "bad audio
//! environment" from "normal conversation". Split in two layers:
//!
//! - `detectors`: pure, stateless per-utterance checks (script detection,
//!   incoherence, repeated-word glitches). Each returns a confidence score.
//! - `signals`: the stateful per-session aggregator that turns detector
//!   output into rolling counters, a sliding window of recent flags, a
//!   0-100 quality score, an environment-check trigger policy and a
//!   turn-detection eagerness recommendation.

pub mod detectors;
pub mod signals;

pub use signals::{QualitySignals, UtteranceReport};
