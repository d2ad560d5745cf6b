//! Session inspection and resume-token endpoints.
//!
//! Live session internals belong to the bridge actor; what these endpoints
//! expose is the registry's lifecycle view plus the latest persisted
//! snapshot, which the bridge refreshes on a short debounce.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::{error::AppError, state::AppState};

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut sessions = Vec::new();
    for session_id in state.registry.session_ids() {
        if let Some(entry) = state.registry.get(&session_id) {
            let clock = entry.clock();
            sessions.push(json!({
                "session_id": session_id,
                "created_at": clock.created_at.to_rfc3339(),
                "last_activity": clock.last_activity.to_rfc3339(),
                "connected": clock.disconnected_at.is_none(),
                "finalizing": entry.is_finalizing()
            }));
        }
    }

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_count": sessions.len(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    let entry = state.registry.get(&session_id);
    let snapshot = state
        .store
        .load(&session_id)
        .await
        .map_err(|e| AppError::Internal(format!("Snapshot read failed: {}", e)))?;

    if entry.is_none() && snapshot.is_none() {
        return Err(AppError::NotFound(format!("Session '{}' not found", session_id)));
    }

    let lifecycle = entry.map(|entry| {
        let clock = entry.clock();
        json!({
            "created_at": clock.created_at.to_rfc3339(),
            "last_heartbeat": clock.last_heartbeat.to_rfc3339(),
            "last_activity": clock.last_activity.to_rfc3339(),
            "disconnected_at": clock.disconnected_at.map(|t| t.to_rfc3339()),
            "finalizing": entry.is_finalizing()
        })
    });

    let persisted = snapshot.map(|snapshot| {
        json!({
            "saved_at": snapshot.saved_at.to_rfc3339(),
            "completed": snapshot.completed,
            "termination_reason": snapshot.termination_reason,
            "question_index": snapshot.question_index,
            "total_questions": snapshot.questions.len(),
            "additional_active": snapshot.additional.active,
            "transcript_entries": snapshot.transcript_log.len(),
            "quality_score": snapshot.quality.score(),
            "metrics": snapshot.metrics.summary()
        })
    });

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "live": lifecycle,
        "persisted": persisted
    })))
}

/// Issue a single-use resume token for a persisted, incomplete session.
///
/// The plaintext token appears only in this response; the snapshot stores
/// its hash. Clients pass it back as the `resume_token` query parameter on
/// the next WebSocket connection.
pub async fn issue_resume_token(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    let ttl_secs = {
        let config = state
            .config
            .read()
            .map_err(|_| AppError::Internal("Config lock poisoned".to_string()))?;
        config.session.resume_token_ttl_secs
    };

    let token = state
        .store
        .issue_resume_token(&session_id, ttl_secs)
        .await
        .map_err(|e| AppError::Internal(format!("Token issue failed: {}", e)))?;

    match token {
        Some(token) => Ok(HttpResponse::Ok().json(json!({
            "session_id": session_id,
            "resume_token": token,
            "expires_in_secs": ttl_secs
        }))),
        None => Err(AppError::NotFound(format!(
            "Session '{}' is not resumable",
            session_id
        ))),
    }
}
