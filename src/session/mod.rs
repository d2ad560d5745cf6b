//! # Session Lifecycle
//!
//! Everything that outlives a single WebSocket frame: the authoritative
//! per-session record, the process-wide registry the watchdog sweeps,
//! snapshot persistence with resume tokens, and the watchdog itself.

pub mod persistence;
pub mod registry;
pub mod state;
pub mod watchdog;
