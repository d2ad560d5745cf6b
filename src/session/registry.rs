//! # Session Registry
//!
//! Process-wide map of live sessions. The registry deliberately does not own
//! session internals — the bridge actor does. What it holds per session is:
//!
//! - a **clock**: the timestamps the watchdog needs, updated by the bridge
//! - the **finalize latch**: an atomic ensuring that, no matter how many
//!   termination triggers race (watchdog, disconnect, explicit completion),
//!   finalization executes exactly once
//! - **recipients**: actor addresses the watchdog uses to request warnings
//!   and finalization, never mutating session state directly

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use actix::Recipient;
use chrono::{DateTime, Utc};

use super::watchdog::{FinalizeSession, WatchdogWarning};

/// Timestamps the watchdog reads. A copy of what the session record holds,
/// maintained by the bridge so the watchdog never has to touch the actor.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl SessionClock {
    fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_heartbeat: now,
            last_activity: now,
            disconnected_at: None,
        }
    }
}

/// Actor endpoints the watchdog may signal.
pub struct BridgeRecipients {
    pub warn: Recipient<WatchdogWarning>,
    pub finalize: Recipient<FinalizeSession>,
}

/// One registered session.
pub struct SessionEntry {
    pub session_id: String,
    clock: RwLock<SessionClock>,
    finalize_latch: AtomicBool,
    warned: AtomicBool,
    recipients: RwLock<Option<BridgeRecipients>>,
}

impl SessionEntry {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            clock: RwLock::new(SessionClock::now()),
            finalize_latch: AtomicBool::new(false),
            warned: AtomicBool::new(false),
            recipients: RwLock::new(None),
        }
    }

    pub fn clock(&self) -> SessionClock {
        *self.clock.read().unwrap()
    }

    pub fn touch_heartbeat(&self) {
        let mut clock = self.clock.write().unwrap();
        clock.last_heartbeat = Utc::now();
        // Heartbeat recovery clears a previously issued warning.
        drop(clock);
        self.warned.store(false, Ordering::SeqCst);
    }

    pub fn touch_activity(&self) {
        let mut clock = self.clock.write().unwrap();
        let now = Utc::now();
        clock.last_activity = now;
        clock.last_heartbeat = now;
    }

    pub fn set_created_at(&self, created_at: DateTime<Utc>) {
        self.clock.write().unwrap().created_at = created_at;
    }

    pub fn mark_disconnected(&self) {
        self.clock.write().unwrap().disconnected_at = Some(Utc::now());
    }

    pub fn mark_reconnected(&self) {
        let mut clock = self.clock.write().unwrap();
        clock.disconnected_at = None;
        clock.last_heartbeat = Utc::now();
    }

    /// Claim the right to finalize. Exactly one caller ever gets `true`.
    pub fn begin_finalize(&self) -> bool {
        !self.finalize_latch.swap(true, Ordering::SeqCst)
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalize_latch.load(Ordering::SeqCst)
    }

    /// Mark warned; returns true if this caller flipped it (send the warning
    /// once, not on every sweep).
    pub fn mark_warned(&self) -> bool {
        !self.warned.swap(true, Ordering::SeqCst)
    }

    pub fn attach(&self, recipients: BridgeRecipients) {
        *self.recipients.write().unwrap() = Some(recipients);
        self.mark_reconnected();
    }

    /// Drop the actor endpoints on disconnect. The entry stays registered so
    /// the session can be resumed until the watchdog decides otherwise.
    pub fn detach(&self) {
        *self.recipients.write().unwrap() = None;
        self.mark_disconnected();
    }

    pub fn send_warning(&self, warning: WatchdogWarning) {
        if let Some(recipients) = self.recipients.read().unwrap().as_ref() {
            recipients.warn.do_send(warning);
        }
    }

    /// Request finalization from the owning bridge. Returns false when no
    /// bridge is attached (disconnected session) — the caller then runs the
    /// orphan finalization path itself.
    pub fn request_finalize(&self, message: FinalizeSession) -> bool {
        match self.recipients.read().unwrap().as_ref() {
            Some(recipients) => {
                recipients.finalize.do_send(message);
                true
            }
            None => false,
        }
    }
}

/// Registry of all live sessions.
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Arc<SessionEntry>>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    /// Register a new session, enforcing the concurrent-session limit.
    pub fn register(&self, session_id: &str) -> Result<Arc<SessionEntry>, String> {
        let mut entries = self.entries.write().unwrap();

        if entries.len() >= self.max_concurrent_sessions {
            return Err(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            ));
        }

        if entries.contains_key(session_id) {
            return Err(format!("Session ID '{}' already exists", session_id));
        }

        let entry = Arc::new(SessionEntry::new(session_id.to_string()));
        entries.insert(session_id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Fetch-or-recreate an entry for a session restored from persistence.
    pub fn register_restored(&self, session_id: &str) -> Result<Arc<SessionEntry>, String> {
        if let Some(existing) = self.get(session_id) {
            if existing.is_finalizing() {
                return Err(format!("Session '{}' is finalizing", session_id));
            }
            return Ok(existing);
        }
        self.register(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.entries.read().unwrap().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.entries.write().unwrap().remove(session_id).is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether a fresh session would be rejected right now. Used to fail the
    /// WebSocket upgrade early; [`Self::register`] remains the authoritative
    /// check.
    pub fn at_capacity(&self) -> bool {
        self.entries.read().unwrap().len() >= self.max_concurrent_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_enforces_limit() {
        let registry = SessionRegistry::new(2);
        assert!(registry.register("a").is_ok());
        assert!(registry.register("b").is_ok());
        assert!(registry.register("c").is_err());

        registry.remove("a");
        assert!(registry.register("c").is_ok());
    }

    #[test]
    fn test_at_capacity_tracks_registrations() {
        let registry = SessionRegistry::new(1);
        assert!(!registry.at_capacity());

        registry.register("a").unwrap();
        assert!(registry.at_capacity());

        registry.remove("a");
        assert!(!registry.at_capacity());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SessionRegistry::new(10);
        assert!(registry.register("a").is_ok());
        assert!(registry.register("a").is_err());
    }

    #[test]
    fn test_finalize_latch_exactly_once() {
        let entry = SessionEntry::new("s".to_string());
        assert!(entry.begin_finalize());
        assert!(!entry.begin_finalize());
        assert!(entry.is_finalizing());
    }

    #[test]
    fn test_finalize_latch_under_contention() {
        use std::sync::atomic::AtomicU32;

        let entry = Arc::new(SessionEntry::new("s".to_string()));
        let winners = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = entry.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if entry.begin_finalize() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_heartbeat_clears_warning() {
        let entry = SessionEntry::new("s".to_string());
        assert!(entry.mark_warned());
        assert!(!entry.mark_warned());

        entry.touch_heartbeat();
        assert!(entry.mark_warned());
    }

    #[test]
    fn test_restored_registration_reuses_entry() {
        let registry = SessionRegistry::new(10);
        let first = registry.register("a").unwrap();
        first.detach();

        let second = registry.register_restored("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_restored_registration_rejects_finalizing() {
        let registry = SessionRegistry::new(10);
        let entry = registry.register("a").unwrap();
        entry.begin_finalize();
        assert!(registry.register_restored("a").is_err());
    }
}
