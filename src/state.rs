//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and WebSocket bridge. The
//! mutable pieces (config, request metrics) sit behind `Arc<RwLock<T>>`;
//! the immutable pieces (provider, snapshot store, registry) are plain
//! `Arc`s with interior synchronization of their own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::AppConfig;
use crate::orchestrator::OrchestratorClient;
use crate::provider::RealtimeProvider;
use crate::session::persistence::SnapshotStore;
use crate::session::registry::SessionRegistry;

/// The main application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime via the API).
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by the metrics middleware.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started, for uptime reporting.
    pub start_time: Instant,

    /// All live interview sessions.
    pub registry: Arc<SessionRegistry>,

    /// Session snapshot persistence.
    pub store: Arc<SnapshotStore>,

    /// The configured realtime speech provider.
    pub provider: Arc<dyn RealtimeProvider>,

    /// Orchestrator analysis client; `None` when no URL is configured.
    pub orchestrator: Option<Arc<OrchestratorClient>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: Arc<SessionRegistry>,
        store: Arc<SnapshotStore>,
        provider: Arc<dyn RealtimeProvider>,
        orchestrator: Option<Arc<OrchestratorClient>>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            store,
            provider,
            orchestrator,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Process-level HTTP metrics collected across all requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start.
    pub request_count: u64,

    /// Total number of error responses since server start.
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppMetrics {
    /// Record one completed request for an endpoint.
    pub fn record_request(&mut self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.request_count += 1;
        if is_error {
            self.error_count += 1;
        }

        let metric = self.endpoint_metrics.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }
}
