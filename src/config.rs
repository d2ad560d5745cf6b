//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SESSION_IDLETIMEOUTSECS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Secrets:
//! Provider API keys and the orchestrator URL are read from the environment
//! (loaded via dotenv in main) and are never written back to disk.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, provider, session,
/// orchestrator, persistence) makes it easier to understand and maintain
/// as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub session: SessionConfig,
    pub orchestrator: OrchestratorConfig,
    pub persistence: PersistenceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Realtime speech provider configuration.
///
/// ## Fields:
/// - `kind`: Which provider backend to use ("openai" or "azure")
/// - `api_key`: Provider credential, normally supplied via OPENAI_API_KEY
/// - `realtime_model`: Realtime model name (e.g. "gpt-4o-realtime-preview")
/// - `transcription_model`: Input transcription model (e.g. "whisper-1")
/// - `voice`: Synthesized interviewer voice
/// - `azure_endpoint` / `azure_deployment`: Only used when `kind = "azure"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: String,
    pub api_key: String,
    pub realtime_model: String,
    pub transcription_model: String,
    pub transcription_language: String,
    pub voice: String,
    pub azure_endpoint: String,
    pub azure_deployment: String,
}

/// Session lifecycle and hygiene configuration.
///
/// ## Timeout semantics:
/// - `heartbeat_timeout_secs`: No application heartbeat for this long terminates
///   the session; a warning is sent at 75% of the window.
/// - `idle_timeout_secs`: No transcript/audio activity at all for this long
///   terminates the session even if heartbeats keep arriving.
/// - `max_age_secs`: Absolute cap on session lifetime.
/// - `resume_window_secs`: How long a disconnected session is kept restorable
///   before the watchdog finalizes it.
/// - `response_timeout_secs`: How long a provider response may stay in flight
///   before the response-creation guard force-clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_age_secs: u64,
    pub resume_window_secs: u64,
    pub response_timeout_secs: u64,
    pub persist_debounce_secs: u64,
    pub watchdog_interval_secs: u64,
    pub resume_token_ttl_secs: u64,
}

/// Orchestrator (interview analysis service) configuration.
///
/// An empty `url` disables orchestrator analysis entirely; the interview
/// still runs, it just receives no steering guidance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub url: String,
    pub request_timeout_secs: u64,
}

/// Session snapshot persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory where per-session snapshot files are written.
    pub dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                kind: "openai".to_string(),
                api_key: String::new(),
                realtime_model: "gpt-4o-realtime-preview".to_string(),
                transcription_model: "whisper-1".to_string(),
                transcription_language: "en".to_string(),
                voice: "alloy".to_string(),
                azure_endpoint: String::new(),
                azure_deployment: String::new(),
            },
            session: SessionConfig {
                max_concurrent_sessions: 50,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 120,
                idle_timeout_secs: 600,
                max_age_secs: 5400,
                resume_window_secs: 300,
                response_timeout_secs: 30,
                persist_debounce_secs: 2,
                watchdog_interval_secs: 15,
                resume_token_ttl_secs: 900,
            },
            orchestrator: OrchestratorConfig {
                url: String::new(),
                request_timeout_secs: 20,
            },
            persistence: PersistenceConfig {
                dir: "sessions".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and provider credentials
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_PROVIDER_KIND=azure`: Switch to the Azure realtime provider
    /// - `OPENAI_API_KEY=sk-...`: Provider credential (preferred over config file)
    /// - `ORCHESTRATOR_URL=http://...`: Enable orchestrator analysis
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Special environment variables used by deployment platforms and
        // for secrets that must not live in config.toml.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("provider.api_key", key)?;
        }

        if let Ok(url) = env::var("ORCHESTRATOR_URL") {
            settings = settings.set_override("orchestrator.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limits and timeout windows are non-zero and ordered
    ///   (the heartbeat interval must fit inside the timeout window,
    ///   otherwise every session would be terminated between heartbeats)
    /// - The provider kind is one we know how to construct
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs >= self.session.heartbeat_timeout_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat interval ({}s) must be shorter than the heartbeat timeout ({}s)",
                self.session.heartbeat_interval_secs,
                self.session.heartbeat_timeout_secs
            ));
        }

        if self.session.response_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Response timeout must be greater than 0"));
        }

        if self.session.watchdog_interval_secs == 0 {
            return Err(anyhow::anyhow!("Watchdog interval must be greater than 0"));
        }

        match self.provider.kind.as_str() {
            "openai" => {}
            "azure" => {
                if self.provider.azure_endpoint.is_empty() || self.provider.azure_deployment.is_empty() {
                    return Err(anyhow::anyhow!(
                        "Azure provider requires azure_endpoint and azure_deployment"
                    ));
                }
            }
            other => {
                return Err(anyhow::anyhow!("Unknown provider kind: '{}'", other));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example
    /// `{"session": {"idle_timeout_secs": 900}}` updates just the idle timeout.
    /// Provider credentials are deliberately not updatable at runtime.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(session) = partial.get("session") {
            if let Some(v) = session.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.session.max_concurrent_sessions = v as usize;
            }
            if let Some(v) = session.get("heartbeat_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.heartbeat_timeout_secs = v;
            }
            if let Some(v) = session.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.idle_timeout_secs = v;
            }
            if let Some(v) = session.get("max_age_secs").and_then(|v| v.as_u64()) {
                self.session.max_age_secs = v;
            }
            if let Some(v) = session.get("resume_window_secs").and_then(|v| v.as_u64()) {
                self.session.resume_window_secs = v;
            }
            if let Some(v) = session.get("response_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.response_timeout_secs = v;
            }
        }

        if let Some(orchestrator) = partial.get("orchestrator") {
            if let Some(url) = orchestrator.get("url").and_then(|v| v.as_str()) {
                self.orchestrator.url = url.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.provider.kind, "openai");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_window_ordering() {
        let mut config = AppConfig::default();
        config.session.heartbeat_interval_secs = 120;
        config.session.heartbeat_timeout_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_azure_requires_endpoint() {
        let mut config = AppConfig::default();
        config.provider.kind = "azure".to_string();
        assert!(config.validate().is_err());

        config.provider.azure_endpoint = "https://example.openai.azure.com".to_string();
        config.provider.azure_deployment = "realtime".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"idle_timeout_secs": 900}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.session.idle_timeout_secs, 900);
        // Other fields should remain unchanged
        assert_eq!(config.session.max_age_secs, 5400);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
