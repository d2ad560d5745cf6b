//! Health and process-metrics endpoints, for load balancers and operators.

use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

use crate::state::AppState;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let (host, port, max_sessions) = {
        let config = state.config.read().unwrap();
        (
            config.server.host.clone(),
            config.server.port,
            config.session.max_concurrent_sessions,
        )
    };
    let (request_count, error_count) = {
        let metrics = state.metrics.read().unwrap();
        (metrics.request_count, metrics.error_count)
    };
    let active_sessions = state.registry.active_count();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": "live-interview-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": host,
            "port": port
        },
        "provider": {
            "name": state.provider.name(),
            "sample_rate": state.provider.sample_rate(),
            "semantic_turn_detection": state.provider.supports_semantic_turn_detection()
        },
        "sessions": {
            "active": active_sessions,
            "max": max_sessions
        },
        "metrics": {
            "total_requests": request_count,
            "total_errors": error_count,
            "error_rate": if request_count > 0 {
                error_count as f64 / request_count as f64
            } else {
                0.0
            }
        },
        "orchestrator_enabled": state.orchestrator.is_some(),
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let uptime_seconds = state.uptime_seconds();

    let (request_count, error_count, endpoint_stats) = {
        let metrics = state.metrics.read().unwrap();
        let mut endpoints = Vec::new();
        for (endpoint, metric) in metrics.endpoint_metrics.iter() {
            let average_duration_ms = if metric.request_count > 0 {
                metric.total_duration_ms as f64 / metric.request_count as f64
            } else {
                0.0
            };
            endpoints.push(json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "average_duration_ms": average_duration_ms,
                "total_duration_ms": metric.total_duration_ms
            }));
        }
        (metrics.request_count, metrics.error_count, endpoints)
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": request_count,
            "total_errors": error_count,
            "error_rate": if request_count > 0 {
                error_count as f64 / request_count as f64
            } else {
                0.0
            },
            "active_sessions": state.registry.active_count(),
            "requests_per_second": if uptime_seconds > 0 {
                request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({ "available": false, "pid": pid })
}
