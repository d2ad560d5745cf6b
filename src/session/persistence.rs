//! # Snapshot Persistence
//!
//! Sessions are persisted as one JSON file per session so an interrupted
//! interview can be resumed. Writes go through a temp-file-then-rename so a
//! crash mid-write never leaves a truncated snapshot behind.
//!
//! ## Resume tokens:
//! Resuming requires a single-use, time-boxed token. Only the SHA-256 hash
//! of the token is stored in the snapshot; the plaintext exists once, in the
//! HTTP response that issued it. Validation clears the hash, so a token can
//! never be replayed.
//!
//! The token fields and the `completed` marker are owned by the store, not
//! by the live session: routine saves go through [`SnapshotStore::save_live`],
//! which carries them over from the file on disk, and all read-modify-write
//! operations are serialized behind one lock.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::metrics::SessionMetrics;
use crate::quality::QualitySignals;
use crate::session::state::{AdditionalQuestions, InterviewSession, Question, TranscriptEntry};

/// Everything needed to rebuild a session after a disconnect or restart.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub question_index: usize,
    pub questions: Vec<Question>,
    pub additional: AdditionalQuestions,
    pub transcript_log: Vec<TranscriptEntry>,
    pub quality: QualitySignals,
    pub metrics: SessionMetrics,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub completed: bool,
    #[serde(default)]
    pub termination_reason: Option<String>,

    /// SHA-256 hex of the active resume token, if one has been issued and
    /// not yet consumed.
    #[serde(default)]
    pub resume_token_hash: Option<String>,
    #[serde(default)]
    pub resume_token_expires_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn capture(session: &InterviewSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            question_index: session.question_index,
            questions: session.questions.clone(),
            additional: session.additional.clone(),
            transcript_log: session.transcript_log().to_vec(),
            quality: session.quality.clone(),
            metrics: session.metrics.clone(),
            created_at: session.created_at,
            saved_at: Utc::now(),
            completed: false,
            termination_reason: None,
            resume_token_hash: None,
            resume_token_expires_at: None,
        }
    }

    /// Rebuild a live session from this snapshot. The session comes back in
    /// the awaiting-resume state: audio is gated until the client confirms.
    pub fn restore(&self) -> InterviewSession {
        let mut session = InterviewSession::new(
            self.session_id.clone(),
            self.questions.clone(),
            self.additional.questions.clone(),
        );
        session.question_index = self.question_index;
        session.additional = self.additional.clone();
        session.restore_transcript(self.transcript_log.clone());
        session.quality = self.quality.clone();
        session.quality.reset_for_resume();
        session.metrics = self.metrics.clone();
        session.awaiting_resume = true;
        session.created_at = self.created_at;
        // Fresh silence anchor. Without it the first speech event after a
        // resume measures silence from the original creation time, which may
        // be half an hour in the past.
        session.last_speech_ended_at = Some(Utc::now());
        session
    }
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// File-backed snapshot store, one JSON file per session.
pub struct SnapshotStore {
    dir: PathBuf,
    /// Serializes every load-modify-save sequence. Saves are spawned from
    /// the bridge and from HTTP handlers concurrently; without this lock two
    /// interleaved writes could lose a token or resurrect a completed session.
    write_lock: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create the snapshot directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create snapshot directory {:?}", self.dir))
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session IDs are UUIDs from our own protocol layer, but sanitize
        // anyway so a hostile ID cannot escape the snapshot directory.
        let safe: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Raw atomic write (temp file, then rename). Callers hold `write_lock`.
    async fn write(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.session_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write snapshot temp file {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to rename snapshot into place {:?}", path))?;

        debug!(session_id = %snapshot.session_id, "Snapshot persisted");
        Ok(())
    }

    /// Persist a snapshot as-is. Used for the initial save and for the
    /// final snapshot written at termination, which is authoritative.
    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(snapshot).await
    }

    /// Persist a routine mid-interview snapshot, carrying over the fields the
    /// store owns: an issued-but-unconsumed resume token, and the `completed`
    /// marker. A completed session is never reopened by a late save, and a
    /// debounced save that races a token issuance keeps the token.
    pub async fn save_live(&self, mut snapshot: SessionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.load(&snapshot.session_id).await? {
            if existing.completed {
                debug!(
                    session_id = %snapshot.session_id,
                    "Session already completed on disk; live save dropped"
                );
                return Ok(());
            }
            snapshot.resume_token_hash = existing.resume_token_hash;
            snapshot.resume_token_expires_at = existing.resume_token_expires_at;
        }

        self.write(&snapshot).await
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read snapshot {:?}", path))
            }
        };

        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("Snapshot {:?} is corrupt", path))?;
        Ok(Some(snapshot))
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete snapshot {:?}", path)),
        }
    }

    /// Issue a fresh resume token for a stored session. Returns the
    /// plaintext token; only its hash lands on disk. Replaces any previously
    /// issued token.
    pub async fn issue_resume_token(
        &self,
        session_id: &str,
        ttl_secs: u64,
    ) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut snapshot) = self.load(session_id).await? else {
            return Ok(None);
        };

        if snapshot.completed {
            return Ok(None);
        }

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex_encode(&raw);

        snapshot.resume_token_hash = Some(hash_token(&token));
        snapshot.resume_token_expires_at = Some(Utc::now() + Duration::seconds(ttl_secs as i64));
        self.write(&snapshot).await?;

        Ok(Some(token))
    }

    /// Validate a resume token and, on success, consume it. Returns the
    /// snapshot the session should be restored from.
    ///
    /// Consumption is unconditional on success: the hash is cleared before
    /// the snapshot is returned, so the same token presented twice fails the
    /// second time even if the first resume never completed.
    pub async fn redeem_resume_token(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<Option<SessionSnapshot>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut snapshot) = self.load(session_id).await? else {
            return Ok(None);
        };

        if snapshot.completed {
            return Ok(None);
        }

        let Some(stored_hash) = snapshot.resume_token_hash.as_deref() else {
            warn!(session_id, "Resume attempted with no token issued");
            return Ok(None);
        };

        let expired = snapshot
            .resume_token_expires_at
            .map(|t| Utc::now() > t)
            .unwrap_or(true);
        if expired {
            warn!(session_id, "Resume token expired");
            return Ok(None);
        }

        if stored_hash != hash_token(token) {
            warn!(session_id, "Resume token mismatch");
            return Ok(None);
        }

        // Single use: burn the token before handing the snapshot back.
        snapshot.resume_token_hash = None;
        snapshot.resume_token_expires_at = None;
        self.write(&snapshot).await?;

        Ok(Some(snapshot))
    }

    /// Mark a stored session as completed (orphan finalization: the owning
    /// connection is gone, so the watchdog closes the snapshot directly).
    pub async fn mark_completed(&self, session_id: &str, reason: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let Some(mut snapshot) = self.load(session_id).await? else {
            return Ok(());
        };

        snapshot.completed = true;
        snapshot.termination_reason = Some(reason.to_string());
        snapshot.resume_token_hash = None;
        snapshot.resume_token_expires_at = None;
        snapshot.saved_at = Utc::now();
        self.write(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::Speaker;

    fn temp_store(name: &str) -> SnapshotStore {
        let dir = std::env::temp_dir().join(format!(
            "live-interview-{}-{}",
            name,
            uuid::Uuid::new_v4()
        ));
        SnapshotStore::new(dir)
    }

    fn sample_session(id: &str) -> InterviewSession {
        let questions = vec![Question {
            text: "Tell me about your current role.".to_string(),
            guidance: None,
            recommended_followup_depth: 1,
        }];
        let mut session = InterviewSession::new(id.to_string(), questions, vec![]);
        session.push_transcript(TranscriptEntry {
            speaker: Speaker::Respondent,
            text: "I manage a small warehouse team.".to_string(),
            timestamp: Utc::now(),
            question_index: 0,
            confidence: Some(0.95),
        });
        session
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = temp_store("roundtrip");
        store.ensure_dir().await.unwrap();

        let session = sample_session("s1");
        let snapshot = SessionSnapshot::capture(&session);
        store.save(&snapshot).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.transcript_log.len(), 1);
        assert!(!loaded.completed);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = temp_store("missing");
        store.ensure_dir().await.unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_gates_audio() {
        let store = temp_store("restore");
        store.ensure_dir().await.unwrap();

        let session = sample_session("s1");
        let snapshot = SessionSnapshot::capture(&session);
        store.save(&snapshot).await.unwrap();

        let restored = store.load("s1").await.unwrap().unwrap().restore();
        assert!(restored.awaiting_resume);
        assert_eq!(restored.transcript_log().len(), 1);
        assert_eq!(restored.created_at, session.created_at);
    }

    #[test]
    fn test_restore_sets_fresh_silence_anchor() {
        let mut session = sample_session("s1");
        session.created_at = Utc::now() - Duration::minutes(45);

        let restored = SessionSnapshot::capture(&session).restore();

        // Measuring the first post-resume silence from the original creation
        // time would record a forty-five minute segment.
        let anchor = restored.last_speech_ended_at.unwrap();
        assert!(Utc::now().signed_duration_since(anchor).num_seconds() < 5);
        assert!(restored.last_speaker.is_none());
    }

    #[tokio::test]
    async fn test_routine_save_preserves_issued_token() {
        let store = temp_store("token-preserved");
        store.ensure_dir().await.unwrap();

        let session = sample_session("s1");
        store.save(&SessionSnapshot::capture(&session)).await.unwrap();
        let token = store.issue_resume_token("s1", 900).await.unwrap().unwrap();

        // A debounced mid-interview save lands after the token was issued.
        store.save_live(SessionSnapshot::capture(&session)).await.unwrap();

        assert!(store
            .redeem_resume_token("s1", &token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_late_live_save_cannot_reopen_completed_session() {
        let store = temp_store("no-reopen");
        store.ensure_dir().await.unwrap();

        let session = sample_session("s1");
        store.save(&SessionSnapshot::capture(&session)).await.unwrap();
        store.mark_completed("s1", "idle_timeout").await.unwrap();

        // A straggling debounced save must not clear the completed marker.
        store.save_live(SessionSnapshot::capture(&session)).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert!(loaded.completed);
        assert_eq!(loaded.termination_reason.as_deref(), Some("idle_timeout"));
        assert!(store.issue_resume_token("s1", 900).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_token_single_use() {
        let store = temp_store("token");
        store.ensure_dir().await.unwrap();

        let snapshot = SessionSnapshot::capture(&sample_session("s1"));
        store.save(&snapshot).await.unwrap();

        let token = store.issue_resume_token("s1", 900).await.unwrap().unwrap();

        // First redemption succeeds and burns the token.
        assert!(store
            .redeem_resume_token("s1", &token)
            .await
            .unwrap()
            .is_some());
        // Second redemption of the same token fails.
        assert!(store
            .redeem_resume_token("s1", &token)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_resume_token_wrong_value_rejected() {
        let store = temp_store("wrong-token");
        store.ensure_dir().await.unwrap();

        let snapshot = SessionSnapshot::capture(&sample_session("s1"));
        store.save(&snapshot).await.unwrap();

        let token = store.issue_resume_token("s1", 900).await.unwrap().unwrap();
        assert!(store
            .redeem_resume_token("s1", "not-the-token")
            .await
            .unwrap()
            .is_none());
        // The real token still works after a failed guess.
        assert!(store
            .redeem_resume_token("s1", &token)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_resume_token_expired_rejected() {
        let store = temp_store("expired");
        store.ensure_dir().await.unwrap();

        let snapshot = SessionSnapshot::capture(&sample_session("s1"));
        store.save(&snapshot).await.unwrap();

        let token = store.issue_resume_token("s1", 0).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store
            .redeem_resume_token("s1", &token)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_completed_session_not_resumable() {
        let store = temp_store("completed");
        store.ensure_dir().await.unwrap();

        let snapshot = SessionSnapshot::capture(&sample_session("s1"));
        store.save(&snapshot).await.unwrap();
        store.mark_completed("s1", "idle_timeout").await.unwrap();

        assert!(store.issue_resume_token("s1", 900).await.unwrap().is_none());
        let loaded = store.load("s1").await.unwrap().unwrap();
        assert!(loaded.completed);
        assert_eq!(loaded.termination_reason.as_deref(), Some("idle_timeout"));
    }

    #[test]
    fn test_hostile_session_id_sanitized() {
        let store = temp_store("sanitize");
        let path = store.path_for("../../etc/passwd");
        assert!(path.to_string_lossy().ends_with("etcpasswd.json"));
        assert!(path.starts_with(&store.dir));
    }
}
