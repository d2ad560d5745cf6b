//! # Stateless Utterance Detectors
//!
//! Pure per-utterance checks. Each takes one finalized transcript utterance
//! and returns a detection result with a confidence score; no detector keeps
//! state between calls, which keeps them trivially testable. The stateful
//! aggregation lives in [`super::signals`].

/// Result of a single boolean detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionResult {
    pub detected: bool,
    pub confidence: f32,
}

impl DetectionResult {
    pub const NONE: DetectionResult = DetectionResult { detected: false, confidence: 0.0 };

    fn hit(confidence: f32) -> Self {
        Self { detected: true, confidence }
    }
}

/// Result of the repeated-word glitch detector.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatedWordResult {
    pub detected: bool,
    pub repeated_word: Option<String>,
    pub repeat_count: usize,
}

/// Minimum consecutive identical tokens that indicate a transport/codec
/// glitch. Natural emphasis ("no no no") rarely exceeds 2-3 repeats.
const GLITCH_REPEAT_THRESHOLD: usize = 4;

/// Function words common to a handful of Romance/Germanic languages but not
/// used in English. Matched as whole normalized tokens.
const FOREIGN_FUNCTION_WORDS: &[&str] = &[
    // French
    "c'est", "très", "merci", "oui", "bonjour", "n'est", "beaucoup",
    // Spanish
    "está", "gracias", "hola", "señor", "usted", "también",
    // German
    "ich", "nicht", "danke", "und", "aber", "genau",
    // Italian / Portuguese
    "grazie", "perché", "obrigado", "você",
];

/// English function words that signal a cut-off thought when an utterance
/// ends on one of them, and incoherence when one is the entire utterance.
const DANGLING_FUNCTION_WORDS: &[&str] = &[
    "the", "a", "an", "of", "to", "in", "on", "at", "and", "but", "or", "with", "for",
];

/// Fragments that show up in garbled transcriptions but not in real answers.
const NONSENSE_FRAGMENTS: &[&str] = &[
    "la la la", "na na na", "da da da", "buh buh", "duh duh", "mm mm mm",
];

/// Strip leading/trailing punctuation and lowercase a token. Interior
/// apostrophes are kept so "c'est" and "that's" survive normalization.
pub fn normalize_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
        .to_lowercase()
}

fn normalized_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(normalize_token)
        .filter(|w| !w.is_empty())
        .collect()
}

/// Detect speech in a language other than the interview language.
///
/// Two tiers:
/// - Any character in a non-Latin Unicode script range is an immediate,
///   unambiguous signal (confidence 1.0) — the transcription model has
///   locked onto the wrong language entirely.
/// - Romance/Germanic languages share the Latin script, so they are caught
///   by function-word matches instead (confidence 0.8).
pub fn detect_foreign_language(text: &str) -> DetectionResult {
    for c in text.chars() {
        let code = c as u32;
        let non_latin = matches!(code,
            0x0370..=0x03FF   // Greek
            | 0x0400..=0x04FF // Cyrillic
            | 0x0590..=0x05FF // Hebrew
            | 0x0600..=0x06FF // Arabic
            | 0x0900..=0x097F // Devanagari
            | 0x0E00..=0x0E7F // Thai
            | 0x1100..=0x11FF // Hangul Jamo
            | 0x3040..=0x30FF // Hiragana + Katakana
            | 0x4E00..=0x9FFF // CJK Unified Ideographs
            | 0xAC00..=0xD7AF // Hangul Syllables
        );
        if non_latin {
            return DetectionResult::hit(1.0);
        }
    }

    let words = normalized_words(text);
    let hits = words
        .iter()
        .filter(|w| FOREIGN_FUNCTION_WORDS.contains(&w.as_str()))
        .count();

    if hits > 0 {
        DetectionResult::hit(0.8)
    } else {
        DetectionResult::NONE
    }
}

/// Detect an utterance that is not coherent speech.
///
/// Checks, strongest first: empty utterance, known nonsense fragments,
/// a run of 5+ identical characters, two words glued without a space
/// (interior case boundary), a bare article/preposition as the entire
/// utterance, and a very short utterance ending on a dangling function word.
pub fn detect_incoherence(text: &str) -> DetectionResult {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DetectionResult::hit(1.0);
    }

    let lowered = trimmed.to_lowercase();
    if NONSENSE_FRAGMENTS.iter().any(|f| lowered.contains(f)) {
        return DetectionResult::hit(0.9);
    }

    if has_repeated_char_run(trimmed, 5) {
        return DetectionResult::hit(0.85);
    }

    if has_glued_words(trimmed) {
        return DetectionResult::hit(0.7);
    }

    let words = normalized_words(trimmed);
    if words.len() == 1 && DANGLING_FUNCTION_WORDS.contains(&words[0].as_str()) {
        return DetectionResult::hit(0.9);
    }

    if words.len() <= 3 {
        if let Some(last) = words.last() {
            if words.len() > 1 && DANGLING_FUNCTION_WORDS.contains(&last.as_str()) {
                return DetectionResult::hit(0.6);
            }
        }
    }

    DetectionResult::NONE
}

/// Detect a transport/codec glitch where one word repeats 4+ times in a row.
///
/// Tokens are normalized (punctuation stripped, lowercased) before the scan,
/// so "we, we, We we we" still counts as a run of five.
pub fn detect_repeated_word_glitch(text: &str) -> RepeatedWordResult {
    let words = normalized_words(text);

    let mut best_word: Option<String> = None;
    let mut best_run = 0usize;
    let mut run = 0usize;
    let mut prev: Option<&str> = None;

    for word in &words {
        if prev == Some(word.as_str()) {
            run += 1;
        } else {
            run = 1;
            prev = Some(word.as_str());
        }
        if run > best_run {
            best_run = run;
            best_word = Some(word.clone());
        }
    }

    if best_run >= GLITCH_REPEAT_THRESHOLD {
        RepeatedWordResult {
            detected: true,
            repeated_word: best_word,
            repeat_count: best_run,
        }
    } else {
        RepeatedWordResult {
            detected: false,
            repeated_word: None,
            repeat_count: 0,
        }
    }
}

fn has_repeated_char_run(text: &str, threshold: usize) -> bool {
    let mut run = 0usize;
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if Some(c) == prev {
            run += 1;
            if run >= threshold {
                return true;
            }
        } else {
            run = 1;
            prev = Some(c);
        }
    }
    false
}

/// A lowercase letter immediately followed by an uppercase one inside a
/// token ("okayThanks") indicates two words were concatenated during
/// transcription assembly.
fn has_glued_words(text: &str) -> bool {
    for token in text.split_whitespace() {
        let chars: Vec<char> = token.chars().collect();
        // Tokens that start uppercase are likely proper nouns ("McDonald").
        if chars.first().map(|c| c.is_uppercase()).unwrap_or(false) {
            continue;
        }
        for pair in chars.windows(2) {
            if pair[0].is_lowercase() && pair[0].is_alphabetic() && pair[1].is_uppercase() {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thai_script_is_strong_signal() {
        let result = detect_foreign_language("สวัสดีครับ");
        assert!(result.detected);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_french_function_words() {
        let result = detect_foreign_language("c'est très bien");
        assert!(result.detected);
        assert!((result.confidence - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_english_not_flagged() {
        let result = detect_foreign_language("that's great, thanks");
        assert!(!result.detected);
    }

    #[test]
    fn test_cyrillic_and_cjk() {
        assert_eq!(detect_foreign_language("привет").confidence, 1.0);
        assert_eq!(detect_foreign_language("你好").confidence, 1.0);
    }

    #[test]
    fn test_repeated_word_glitch() {
        let result = detect_repeated_word_glitch("we we we we we are happy");
        assert!(result.detected);
        assert_eq!(result.repeated_word.as_deref(), Some("we"));
        assert_eq!(result.repeat_count, 5);
    }

    #[test]
    fn test_natural_emphasis_not_a_glitch() {
        let result = detect_repeated_word_glitch("yes yes I agree");
        assert!(!result.detected);
        assert!(result.repeated_word.is_none());
    }

    #[test]
    fn test_repeat_scan_normalizes_punctuation() {
        let result = detect_repeated_word_glitch("No, no. No! no");
        assert!(result.detected);
        assert_eq!(result.repeated_word.as_deref(), Some("no"));
        assert_eq!(result.repeat_count, 4);
    }

    #[test]
    fn test_empty_utterance_incoherent() {
        let result = detect_incoherence("   ");
        assert!(result.detected);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_bare_article_incoherent() {
        assert!(detect_incoherence("the").detected);
        assert!(detect_incoherence("of").detected);
    }

    #[test]
    fn test_repeated_characters_incoherent() {
        assert!(detect_incoherence("aaaaahhh yes").detected);
        assert!(!detect_incoherence("aaah sure").detected);
    }

    #[test]
    fn test_glued_words_incoherent() {
        assert!(detect_incoherence("okayThanks for asking").detected);
    }

    #[test]
    fn test_dangling_function_word_ending() {
        assert!(detect_incoherence("I went to").detected);
        // Longer utterances ending on a function word are cut-offs the
        // conversation recovers from naturally; leave them alone.
        assert!(!detect_incoherence("I was going to tell you about the").detected);
    }

    #[test]
    fn test_nonsense_fragment_table() {
        assert!(detect_incoherence("la la la la").detected);
    }

    #[test]
    fn test_ordinary_answer_is_coherent() {
        let result = detect_incoherence("I usually walk the dog before work.");
        assert!(!result.detected);
    }
}
