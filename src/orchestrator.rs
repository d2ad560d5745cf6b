//! # Orchestrator Integration
//!
//! The orchestrator is an external analysis service: it consumes transcript
//! snapshots and returns zero-or-one guidance item, asynchronously. The
//! bridge's contract with it is deliberately thin:
//!
//! - at most one analysis request outstanding per session
//! - the live turn is never blocked waiting for a reply
//! - replies tagged with a stale `connection_id` are dropped, not applied
//!
//! Guidance actions form a closed vocabulary the bridge turns into provider
//! instruction patches, never free text injected verbatim.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::session::state::TranscriptEntry;

/// Closed vocabulary of orchestrator directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceAction {
    AcknowledgePrior,
    ProbeFollowup,
    SuggestNextQuestion,
    SuggestEnvironmentCheck,
    ConfirmUnderstanding,
    None,
}

impl GuidanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuidanceAction::AcknowledgePrior => "acknowledge_prior",
            GuidanceAction::ProbeFollowup => "probe_followup",
            GuidanceAction::SuggestNextQuestion => "suggest_next_question",
            GuidanceAction::SuggestEnvironmentCheck => "suggest_environment_check",
            GuidanceAction::ConfirmUnderstanding => "confirm_understanding",
            GuidanceAction::None => "none",
        }
    }
}

/// A steering directive produced by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guidance {
    pub action: GuidanceAction,
    #[serde(default)]
    pub message: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
}

impl Guidance {
    /// Translate the action into an instruction patch for the provider.
    ///
    /// The patch is appended to the instructions of the *next* response
    /// creation; it never interrupts a response already in flight. Returns
    /// `None` for actions that need no instruction change.
    pub fn instruction_patch(&self) -> Option<String> {
        let base = match self.action {
            GuidanceAction::AcknowledgePrior => {
                "Briefly acknowledge something specific the respondent said earlier before continuing."
            }
            GuidanceAction::ProbeFollowup => {
                "Ask one focused follow-up question that digs deeper into the respondent's last answer."
            }
            GuidanceAction::SuggestNextQuestion => {
                "Wrap up the current topic naturally and move on to the next scripted question."
            }
            GuidanceAction::SuggestEnvironmentCheck => {
                "Politely ask the respondent to check their microphone and surroundings; \
                 their audio has been hard to understand."
            }
            GuidanceAction::ConfirmUnderstanding => {
                "Restate the respondent's key point in one sentence and ask whether you understood correctly."
            }
            GuidanceAction::None => return Option::None,
        };

        match &self.message {
            Some(msg) if !msg.is_empty() => Some(format!("{} Context from analysis: {}", base, msg)),
            _ => Some(base.to_string()),
        }
    }
}

/// Request body sent to the orchestrator.
#[derive(Debug, Serialize)]
pub struct AnalysisRequest {
    pub session_id: String,
    pub transcript: Vec<TranscriptEntry>,
    pub current_question: String,
    pub question_index: usize,
    pub quality_score: u8,
}

/// Response body: zero-or-one guidance item.
#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    guidance: Option<Guidance>,
}

/// Thin HTTP client for the orchestrator service.
pub struct OrchestratorClient {
    client: reqwest::Client,
    url: String,
}

impl OrchestratorClient {
    /// Returns `None` when no orchestrator URL is configured; the interview
    /// then runs without steering guidance.
    pub fn from_config(config: &OrchestratorConfig) -> Option<Self> {
        if config.url.is_empty() {
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .ok()?;

        Some(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Send one analysis request. Errors are returned to the caller, which
    /// logs and drops them — a failed analysis must never affect the live
    /// turn.
    pub async fn request_guidance(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Option<Guidance>, reqwest::Error> {
        debug!(
            session_id = %request.session_id,
            quality_score = request.quality_score,
            "Requesting orchestrator analysis"
        );

        let response: AnalysisResponse = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // A "none" action is equivalent to no guidance at all.
        Ok(response
            .guidance
            .filter(|g| g.action != GuidanceAction::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guidance_deserialization() {
        let json = r#"{
            "action": "probe_followup",
            "message": "The respondent hinted at a scheduling conflict.",
            "confidence": 0.82,
            "reasoning": "Answer was vague on the conflict details."
        }"#;

        let guidance: Guidance = serde_json::from_str(json).unwrap();
        assert_eq!(guidance.action, GuidanceAction::ProbeFollowup);
        assert!(guidance.instruction_patch().unwrap().contains("scheduling conflict"));
    }

    #[test]
    fn test_none_action_has_no_patch() {
        let guidance = Guidance {
            action: GuidanceAction::None,
            message: None,
            confidence: 1.0,
            reasoning: String::new(),
        };
        assert!(guidance.instruction_patch().is_none());
    }

    #[test]
    fn test_environment_check_patch() {
        let guidance = Guidance {
            action: GuidanceAction::SuggestEnvironmentCheck,
            message: None,
            confidence: 0.9,
            reasoning: "three incoherent utterances".to_string(),
        };
        let patch = guidance.instruction_patch().unwrap();
        assert!(patch.contains("microphone"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let json = r#"{"action": "fire_the_respondent", "confidence": 1.0}"#;
        assert!(serde_json::from_str::<Guidance>(json).is_err());
    }

    #[test]
    fn test_client_disabled_without_url() {
        let config = OrchestratorConfig {
            url: String::new(),
            request_timeout_secs: 10,
        };
        assert!(OrchestratorClient::from_config(&config).is_none());
    }
}
