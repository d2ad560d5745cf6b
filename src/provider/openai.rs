//! # OpenAI Realtime Provider
//!
//! Speaks the OpenAI realtime API over WebSocket: bearer-token auth, model
//! selected via query parameter, PCM16 audio at 24 kHz, semantic turn
//! detection and input noise reduction available.

use serde_json::{json, Value};

use crate::config::ProviderConfig;

use super::{parse_openai_usage, RealtimeProvider, SessionSettings, TokenCounts, TurnDetection};

pub struct OpenAiRealtime {
    api_key: String,
    model: String,
}

impl OpenAiRealtime {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.realtime_model.clone(),
        }
    }
}

impl RealtimeProvider for OpenAiRealtime {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn endpoint(&self) -> String {
        format!("wss://api.openai.com/v1/realtime?model={}", self.model)
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("OpenAI-Beta", "realtime=v1".to_string()),
        ]
    }

    fn build_session_config(&self, settings: &SessionSettings) -> Value {
        let turn_detection = match settings.turn_detection {
            TurnDetection::ServerVad => json!({
                "type": "server_vad",
                "threshold": 0.5,
                "prefix_padding_ms": 300,
                "silence_duration_ms": 500
            }),
            TurnDetection::Semantic(eagerness) => json!({
                "type": "semantic_vad",
                "eagerness": eagerness.as_str()
            }),
        };

        json!({
            "type": "session.update",
            "session": {
                "modalities": ["audio", "text"],
                "instructions": settings.instructions,
                "voice": settings.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": {
                    "model": settings.transcription_model,
                    "language": settings.transcription_language
                },
                "input_audio_noise_reduction": {
                    "type": "near_field"
                },
                "turn_detection": turn_detection
            }
        })
    }

    fn parse_usage(&self, event: &Value) -> Option<TokenCounts> {
        parse_openai_usage(event)
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn supports_semantic_turn_detection(&self) -> bool {
        true
    }

    fn supports_noise_reduction(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Eagerness;

    fn test_provider() -> OpenAiRealtime {
        OpenAiRealtime {
            api_key: "sk-test".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
        }
    }

    fn test_settings(turn_detection: TurnDetection) -> SessionSettings {
        SessionSettings {
            instructions: "You are an interviewer.".to_string(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            transcription_language: "en".to_string(),
            turn_detection,
        }
    }

    #[test]
    fn test_endpoint_includes_model() {
        let p = test_provider();
        assert!(p.endpoint().contains("model=gpt-4o-realtime-preview"));
    }

    #[test]
    fn test_semantic_turn_detection_config() {
        let p = test_provider();
        let config = p.build_session_config(&test_settings(TurnDetection::Semantic(Eagerness::Low)));

        assert_eq!(config["type"], "session.update");
        assert_eq!(config["session"]["turn_detection"]["type"], "semantic_vad");
        assert_eq!(config["session"]["turn_detection"]["eagerness"], "low");
        assert_eq!(config["session"]["input_audio_transcription"]["model"], "whisper-1");
    }

    #[test]
    fn test_server_vad_config() {
        let p = test_provider();
        let config = p.build_session_config(&test_settings(TurnDetection::ServerVad));
        assert_eq!(config["session"]["turn_detection"]["type"], "server_vad");
    }
}
