//! # Azure OpenAI Realtime Provider
//!
//! Same wire event schema as the OpenAI realtime API, but hosted behind an
//! Azure resource: `api-key` header auth, deployment selected via query
//! parameters, and a reduced feature set (no semantic turn detection, no
//! input noise reduction on the deployed api-version).

use serde_json::{json, Value};

use crate::config::ProviderConfig;

use super::{parse_openai_usage, RealtimeProvider, SessionSettings, TokenCounts, TurnDetection};

const API_VERSION: &str = "2024-10-01-preview";

pub struct AzureRealtime {
    api_key: String,
    endpoint: String,
    deployment: String,
}

impl AzureRealtime {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            endpoint: config.azure_endpoint.trim_end_matches('/').to_string(),
            deployment: config.azure_deployment.clone(),
        }
    }
}

impl RealtimeProvider for AzureRealtime {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn endpoint(&self) -> String {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .unwrap_or(&self.endpoint);
        format!(
            "wss://{}/openai/realtime?api-version={}&deployment={}",
            host, API_VERSION, self.deployment
        )
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![("api-key", self.api_key.clone())]
    }

    fn build_session_config(&self, settings: &SessionSettings) -> Value {
        // Semantic VAD is not available on this api-version; any requested
        // eagerness degrades to server VAD with a longer silence window.
        let silence_ms = match settings.turn_detection {
            TurnDetection::ServerVad | TurnDetection::Semantic(super::Eagerness::Auto) => 500,
            TurnDetection::Semantic(super::Eagerness::Low) => 900,
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
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": 0.5,
                    "prefix_padding_ms": 300,
                    "silence_duration_ms": silence_ms
                }
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
        false
    }

    fn supports_noise_reduction(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Eagerness;

    fn test_provider() -> AzureRealtime {
        AzureRealtime {
            api_key: "azure-key".to_string(),
            endpoint: "https://example.openai.azure.com".to_string(),
            deployment: "realtime-deploy".to_string(),
        }
    }

    #[test]
    fn test_endpoint_shape() {
        let p = test_provider();
        let url = p.endpoint();
        assert!(url.starts_with("wss://example.openai.azure.com/openai/realtime"));
        assert!(url.contains("deployment=realtime-deploy"));
        assert!(url.contains("api-version="));
    }

    #[test]
    fn test_api_key_header() {
        let p = test_provider();
        let headers = p.auth_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "api-key");
    }

    #[test]
    fn test_semantic_degrades_to_server_vad() {
        let p = test_provider();
        let settings = SessionSettings {
            instructions: "interview".to_string(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            transcription_language: "en".to_string(),
            turn_detection: TurnDetection::Semantic(Eagerness::Low),
        };
        let config = p.build_session_config(&settings);
        assert_eq!(config["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(config["session"]["turn_detection"]["silence_duration_ms"], 900);
        assert!(config["session"].get("input_audio_noise_reduction").is_none());
    }
}
