//! # Realtime Provider Abstraction
//!
//! Normalizes realtime speech APIs behind one interface so the protocol
//! bridge never branches on provider identity. A provider knows how to:
//! - build the session-config payload sent once at connect
//! - produce its endpoint URL and auth headers
//! - extract token usage from its response-completed events
//! - report its audio sample rate and feature support
//!
//! Adding a provider means implementing [`RealtimeProvider`] and extending
//! [`create_provider`]; the bridge does not change.
//!
//! Event parsing is shared: the supported providers speak the same realtime
//! event schema (Azure hosts the OpenAI realtime API), so inbound wire events
//! are mapped to the closed [`ProviderEvent`] enum in one place.

pub mod azure;
pub mod openai;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::AppError;

/// Token usage extracted from a response-completed event, split by modality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_text: u64,
    pub input_audio: u64,
    pub output_text: u64,
    pub output_audio: u64,
}

/// How eagerly the provider's turn detection ends the respondent's turn.
///
/// `Low` waits longer before deciding the respondent is done; used when the
/// quality aggregator concludes short utterances are a timing problem rather
/// than an audio problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eagerness {
    Low,
    Auto,
}

impl Eagerness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Eagerness::Low => "low",
            Eagerness::Auto => "auto",
        }
    }
}

/// Turn-detection policy requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDetection {
    /// Plain energy-based server VAD.
    ServerVad,
    /// Semantic end-of-turn detection with adjustable eagerness.
    Semantic(Eagerness),
}

/// Everything needed to build a provider session-config payload.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    pub transcription_language: String,
    pub turn_detection: TurnDetection,
}

/// The contract every concrete realtime provider implements.
pub trait RealtimeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// WebSocket endpoint URL, including model/deployment selection.
    fn endpoint(&self) -> String;

    /// Auth headers for the socket upgrade request.
    fn auth_headers(&self) -> Vec<(&'static str, String)>;

    /// Build the `session.update` payload sent right after connect (and again
    /// whenever instructions or turn-detection policy change mid-session).
    ///
    /// Providers that do not support the requested turn-detection mode fall
    /// back to the closest mode they do support.
    fn build_session_config(&self, settings: &SessionSettings) -> Value;

    /// Extract token usage from a raw response-completed event, if present.
    fn parse_usage(&self, event: &Value) -> Option<TokenCounts>;

    /// PCM sample rate of inbound and outbound audio.
    fn sample_rate(&self) -> u32;

    fn supports_semantic_turn_detection(&self) -> bool;

    fn supports_noise_reduction(&self) -> bool;
}

/// Construct the configured provider.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn RealtimeProvider>, AppError> {
    match config.kind.as_str() {
        "openai" => Ok(Arc::new(openai::OpenAiRealtime::new(config))),
        "azure" => Ok(Arc::new(azure::AzureRealtime::new(config))),
        other => Err(AppError::ConfigError(format!("Unknown provider kind: '{}'", other))),
    }
}

/// Inbound provider events the bridge reacts to, as a closed enum.
///
/// Event types the bridge has no use for (rate limits, item lifecycle noise)
/// are dropped during parsing rather than surfaced as a string branch.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The provider accepted the connection; session config may be sent.
    SessionCreated,

    /// Input-audio transcription finished for one respondent utterance.
    TranscriptCompleted {
        item_id: String,
        transcript: String,
        confidence: Option<f32>,
    },

    /// A model response started; carries the response identifier used to
    /// match the eventual completion event.
    ResponseCreated { response_id: String },

    /// Decoded PCM16 audio chunk of the interviewer's speech.
    ResponseAudioDelta { audio: Vec<u8> },

    /// Incremental transcript of what the interviewer is saying.
    ResponseAudioTranscriptDelta { delta: String },

    /// A model response finished; raw event retained for usage parsing.
    ResponseDone { response_id: String, raw: Value },

    /// Provider VAD detected the respondent started speaking.
    SpeechStarted,

    /// Provider VAD detected the respondent stopped speaking.
    SpeechStopped,

    /// Provider-reported error.
    Error { message: String },
}

/// Parse one provider text frame into a [`ProviderEvent`].
///
/// Returns `Ok(None)` for well-formed events the bridge does not care about.
pub fn parse_event(text: &str) -> Result<Option<ProviderEvent>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let event = match event_type {
        "session.created" => Some(ProviderEvent::SessionCreated),

        "conversation.item.input_audio_transcription.completed" => {
            let item_id = value
                .get("item_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let transcript = value
                .get("transcript")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            // Whisper-style logprobs arrive on some models; average them into
            // a rough 0..1 confidence when present.
            let confidence = value
                .get("logprobs")
                .and_then(|v| v.as_array())
                .filter(|lp| !lp.is_empty())
                .map(|lp| {
                    let sum: f64 = lp
                        .iter()
                        .filter_map(|e| e.get("logprob").and_then(|l| l.as_f64()))
                        .sum();
                    (sum / lp.len() as f64).exp() as f32
                });
            Some(ProviderEvent::TranscriptCompleted { item_id, transcript, confidence })
        }

        "response.created" => {
            let response_id = value
                .get("response")
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ProviderEvent::ResponseCreated { response_id })
        }

        "response.audio.delta" => {
            let b64 = value.get("delta").and_then(|v| v.as_str()).unwrap_or_default();
            let audio = BASE64.decode(b64).unwrap_or_default();
            Some(ProviderEvent::ResponseAudioDelta { audio })
        }

        "response.audio_transcript.delta" => {
            let delta = value
                .get("delta")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ProviderEvent::ResponseAudioTranscriptDelta { delta })
        }

        "response.done" => {
            let response_id = value
                .get("response")
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ProviderEvent::ResponseDone { response_id, raw: value })
        }

        "input_audio_buffer.speech_started" => Some(ProviderEvent::SpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(ProviderEvent::SpeechStopped),

        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown provider error")
                .to_string();
            Some(ProviderEvent::Error { message })
        }

        _ => None,
    };

    Ok(event)
}

/// Shared usage extraction for providers speaking the OpenAI realtime schema.
pub(crate) fn parse_openai_usage(event: &Value) -> Option<TokenCounts> {
    let usage = event.get("response")?.get("usage")?;
    let input = usage.get("input_token_details")?;
    let output = usage.get("output_token_details")?;

    Some(TokenCounts {
        input_text: input.get("text_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        input_audio: input.get("audio_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_text: output.get("text_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_audio: output.get("audio_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}
