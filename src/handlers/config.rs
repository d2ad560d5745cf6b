//! Runtime configuration endpoints.
//!
//! The provider API key is never echoed back; the config response is safe to
//! expose to an operator dashboard.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::{error::AppError, state::AppState};

fn config_view(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "provider": {
            "kind": config.provider.kind,
            "realtime_model": config.provider.realtime_model,
            "transcription_model": config.provider.transcription_model,
            "transcription_language": config.provider.transcription_language,
            "voice": config.provider.voice
        },
        "session": {
            "max_concurrent_sessions": config.session.max_concurrent_sessions,
            "heartbeat_interval_secs": config.session.heartbeat_interval_secs,
            "heartbeat_timeout_secs": config.session.heartbeat_timeout_secs,
            "idle_timeout_secs": config.session.idle_timeout_secs,
            "max_age_secs": config.session.max_age_secs,
            "resume_window_secs": config.session.resume_window_secs,
            "response_timeout_secs": config.session.response_timeout_secs
        },
        "orchestrator": {
            "enabled": !config.orchestrator.url.is_empty(),
            "request_timeout_secs": config.orchestrator.request_timeout_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state
        .config
        .read()
        .map_err(|_| AppError::Internal("Config lock poisoned".to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut config = state
        .config
        .write()
        .map_err(|_| AppError::Internal("Config lock poisoned".to_string()))?;
    config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&config)
    })))
}
