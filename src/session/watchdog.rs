//! # Session Watchdog
//!
//! A single background task that sweeps the registry on an interval and
//! enforces the session hygiene rules:
//!
//! - missed application heartbeats (warning at 75% of the window, then
//!   termination)
//! - idle timeout (no transcript or audio activity)
//! - absolute maximum session age
//! - disconnected sessions whose resume window has lapsed
//!
//! The watchdog never mutates session state. It reads each entry's clock,
//! decides, and asks the owning bridge actor to act. If no bridge is
//! attached (the client disconnected), it finalizes the snapshot itself.

use std::sync::Arc;
use std::time::Duration;

use actix::Message;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::session::persistence::SnapshotStore;
use crate::session::registry::{SessionClock, SessionRegistry};

/// Why a session was (or is about to be) terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    HeartbeatTimeout,
    IdleTimeout,
    MaxAgeExceeded,
    ResumeWindowExpired,
    ClientDisconnect,
    ProviderFailure,
    Completed,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::HeartbeatTimeout => "heartbeat_timeout",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::MaxAgeExceeded => "max_age_exceeded",
            TerminationReason::ResumeWindowExpired => "resume_window_expired",
            TerminationReason::ClientDisconnect => "client_disconnect",
            TerminationReason::ProviderFailure => "provider_failure",
            TerminationReason::Completed => "completed",
        }
    }
}

/// Sent to a bridge when its session is approaching termination.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct WatchdogWarning {
    pub reason: TerminationReason,
    pub seconds_remaining: u64,
}

/// Sent to a bridge when its session must terminate now.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct FinalizeSession {
    pub reason: TerminationReason,
}

/// Decision for one session in one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    None,
    Warn {
        reason: TerminationReason,
        seconds_remaining: u64,
    },
    Terminate(TerminationReason),
}

/// Pure decision function, separated from the sweep loop for testability.
pub fn evaluate(
    clock: &SessionClock,
    config: &SessionConfig,
    now: chrono::DateTime<Utc>,
) -> SweepAction {
    let age_secs = (now - clock.created_at).num_seconds().max(0) as u64;
    if age_secs >= config.max_age_secs {
        return SweepAction::Terminate(TerminationReason::MaxAgeExceeded);
    }

    // Disconnected sessions are judged only by the resume window; they send
    // no heartbeats and produce no activity by definition.
    if let Some(disconnected_at) = clock.disconnected_at {
        let down_secs = (now - disconnected_at).num_seconds().max(0) as u64;
        if down_secs >= config.resume_window_secs {
            return SweepAction::Terminate(TerminationReason::ResumeWindowExpired);
        }
        return SweepAction::None;
    }

    let idle_secs = (now - clock.last_activity).num_seconds().max(0) as u64;
    if idle_secs >= config.idle_timeout_secs {
        return SweepAction::Terminate(TerminationReason::IdleTimeout);
    }

    let heartbeat_secs = (now - clock.last_heartbeat).num_seconds().max(0) as u64;
    if heartbeat_secs >= config.heartbeat_timeout_secs {
        return SweepAction::Terminate(TerminationReason::HeartbeatTimeout);
    }

    // Warn once 75% of the heartbeat window has elapsed.
    let warn_threshold = config.heartbeat_timeout_secs * 3 / 4;
    if heartbeat_secs >= warn_threshold {
        return SweepAction::Warn {
            reason: TerminationReason::HeartbeatTimeout,
            seconds_remaining: config.heartbeat_timeout_secs - heartbeat_secs,
        };
    }

    SweepAction::None
}

/// Run one sweep over every registered session.
pub async fn sweep(registry: &SessionRegistry, store: &SnapshotStore, config: &SessionConfig) {
    let now = Utc::now();

    for session_id in registry.session_ids() {
        let Some(entry) = registry.get(&session_id) else {
            continue;
        };
        if entry.is_finalizing() {
            continue;
        }

        match evaluate(&entry.clock(), config, now) {
            SweepAction::None => {}
            SweepAction::Warn {
                reason,
                seconds_remaining,
            } => {
                if entry.mark_warned() {
                    warn!(
                        session_id = %session_id,
                        reason = reason.as_str(),
                        seconds_remaining,
                        "Session approaching termination"
                    );
                    entry.send_warning(WatchdogWarning {
                        reason,
                        seconds_remaining,
                    });
                }
            }
            SweepAction::Terminate(reason) => {
                if !entry.begin_finalize() {
                    continue;
                }
                info!(
                    session_id = %session_id,
                    reason = reason.as_str(),
                    "Watchdog terminating session"
                );

                if !entry.request_finalize(FinalizeSession { reason }) {
                    // No bridge attached: close the snapshot ourselves.
                    if let Err(e) = store.mark_completed(&session_id, reason.as_str()).await {
                        warn!(session_id = %session_id, error = %e, "Orphan finalization failed");
                    }
                    registry.remove(&session_id);
                }
            }
        }
    }
}

/// Spawn the watchdog loop. Runs for the life of the process.
pub fn spawn_watchdog(
    registry: Arc<SessionRegistry>,
    store: Arc<SnapshotStore>,
    config: Arc<std::sync::RwLock<crate::config::AppConfig>>,
) {
    tokio::spawn(async move {
        loop {
            let (interval_secs, session_config) = {
                let cfg = config.read().unwrap();
                (cfg.session.watchdog_interval_secs, cfg.session.clone())
            };

            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            sweep(&registry, &store, &session_config).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn config() -> SessionConfig {
        SessionConfig {
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
        }
    }

    fn clock_at(now: chrono::DateTime<Utc>) -> SessionClock {
        SessionClock {
            created_at: now,
            last_heartbeat: now,
            last_activity: now,
            disconnected_at: None,
        }
    }

    #[test]
    fn test_healthy_session_untouched() {
        let now = Utc::now();
        let clock = clock_at(now);
        assert_eq!(evaluate(&clock, &config(), now), SweepAction::None);
    }

    #[test]
    fn test_warning_at_75_percent() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        // 90s since last heartbeat with a 120s window: warn, 30s left.
        clock.last_heartbeat = now - ChronoDuration::seconds(90);
        assert_eq!(
            evaluate(&clock, &config(), now),
            SweepAction::Warn {
                reason: TerminationReason::HeartbeatTimeout,
                seconds_remaining: 30
            }
        );
    }

    #[test]
    fn test_no_warning_before_threshold() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        clock.last_heartbeat = now - ChronoDuration::seconds(89);
        assert_eq!(evaluate(&clock, &config(), now), SweepAction::None);
    }

    #[test]
    fn test_heartbeat_timeout_terminates() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        clock.last_heartbeat = now - ChronoDuration::seconds(120);
        assert_eq!(
            evaluate(&clock, &config(), now),
            SweepAction::Terminate(TerminationReason::HeartbeatTimeout)
        );
    }

    #[test]
    fn test_idle_timeout_beats_heartbeat_warning() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        // Heartbeats keep arriving but nothing has actually happened.
        clock.last_activity = now - ChronoDuration::seconds(700);
        assert_eq!(
            evaluate(&clock, &config(), now),
            SweepAction::Terminate(TerminationReason::IdleTimeout)
        );
    }

    #[test]
    fn test_max_age_wins_over_everything() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        clock.created_at = now - ChronoDuration::seconds(5400);
        clock.disconnected_at = Some(now);
        assert_eq!(
            evaluate(&clock, &config(), now),
            SweepAction::Terminate(TerminationReason::MaxAgeExceeded)
        );
    }

    #[test]
    fn test_disconnected_within_resume_window_kept() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        // A disconnected session gets no heartbeats; that alone must not
        // terminate it while the resume window is open.
        clock.last_heartbeat = now - ChronoDuration::seconds(200);
        clock.disconnected_at = Some(now - ChronoDuration::seconds(200));
        assert_eq!(evaluate(&clock, &config(), now), SweepAction::None);
    }

    #[test]
    fn test_resume_window_expiry_terminates() {
        let now = Utc::now();
        let mut clock = clock_at(now);
        clock.disconnected_at = Some(now - ChronoDuration::seconds(300));
        assert_eq!(
            evaluate(&clock, &config(), now),
            SweepAction::Terminate(TerminationReason::ResumeWindowExpired)
        );
    }

    #[tokio::test]
    async fn test_sweep_orphan_finalization() {
        let registry = SessionRegistry::new(10);
        let store = SnapshotStore::new(
            std::env::temp_dir().join(format!("live-interview-sweep-{}", uuid::Uuid::new_v4())),
        );
        store.ensure_dir().await.unwrap();

        // Register a session, detach it, and age its disconnect past the
        // resume window.
        let entry = registry.register("s1").unwrap();
        entry.detach();
        entry.set_created_at(Utc::now() - ChronoDuration::seconds(6000));

        sweep(&registry, &store, &config()).await;

        // Orphan terminated and removed from the registry, exactly once.
        assert!(registry.get("s1").is_none());
        assert!(entry.is_finalizing());
    }

    #[tokio::test]
    async fn test_sweep_skips_finalizing_sessions() {
        let registry = SessionRegistry::new(10);
        let store = SnapshotStore::new(
            std::env::temp_dir().join(format!("live-interview-sweep2-{}", uuid::Uuid::new_v4())),
        );
        store.ensure_dir().await.unwrap();

        let entry = registry.register("s1").unwrap();
        entry.set_created_at(Utc::now() - ChronoDuration::seconds(6000));
        assert!(entry.begin_finalize());

        sweep(&registry, &store, &config()).await;

        // Already finalizing elsewhere: the sweep must not remove it.
        assert!(registry.get("s1").is_some());
    }
}
