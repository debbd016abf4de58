//! # Operational Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness and session load
//! - `GET /api/v1/metrics`: HTTP and connection counters
//! - `GET /api/v1/config`: effective relay configuration, without secrets
//!
//! None of these touch a session; they only read [`AppState`].

use crate::config::AppConfig;
use crate::state::{AppState, RelayMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "provider": state.provider.name(),
        "sessions": session_load(config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "connections": {
            "active_sessions": metrics.active_sessions,
            "total_connections": metrics.total_connections,
            "rejected_connections": metrics.rejected_connections
        },
        "endpoints": endpoint_stats
    }))
}

/// The whole configuration is safe to show: credentials only ever arrive per
/// session and are never stored here.
pub async fn relay_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.as_ref()
    }))
}

fn session_load(config: &AppConfig, metrics: &RelayMetrics) -> serde_json::Value {
    let max_sessions = config.relay.max_concurrent_sessions;
    let usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "full"
    } else if usage > 0.8 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "active": metrics.active_sessions,
        "max": max_sessions,
        "usage_percent": (usage * 100.0).round()
    })
}
