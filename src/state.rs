//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every connection actor.
//!
//! ## What lives here:
//! - **config**: the effective configuration, fixed at start-up
//! - **provider**: the one recognition provider all sessions draw handles from
//! - **metrics**: request counters and live session accounting
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread and actor holds a cheap reference
//! - **RwLock**: the metrics endpoint reads while middleware and actors write
//!
//! A poisoned lock only means another thread panicked mid-update of a counter,
//! so the guard is recovered instead of propagating the panic.

use crate::config::AppConfig;
use crate::provider::RecognitionProvider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// State shared across all handlers and connections.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub provider: Arc<dyn RecognitionProvider>,
    pub metrics: Arc<RwLock<RelayMetrics>>,
    pub start_time: Instant,
}

/// Counters collected since start-up.
///
/// ## Why these metrics matter:
/// - **active_sessions**: live WebSocket sessions, also used for admission control
/// - **total_connections**: every upgrade that was admitted
/// - **rejected_connections**: upgrades refused because the relay was full
/// - **endpoint_metrics**: per-route HTTP statistics
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for one route, keyed as `"GET /health"`.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, provider: Arc<dyn RecognitionProvider>) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, RelayMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, RelayMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record one finished request for `endpoint`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session slot.
    ///
    /// Check and increment happen under one write lock, so two upgrades racing for
    /// the last slot cannot both get it. Returns `false` (and counts the rejection)
    /// when the relay is full.
    pub fn try_admit_session(&self) -> bool {
        let max = self.config.relay.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions >= max {
            metrics.rejected_connections += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.total_connections += 1;
        true
    }

    /// Give back a slot taken by [`AppState::try_admit_session`].
    pub fn release_session(&self) {
        let mut metrics = self.write_metrics();
        // Underflow would mean a release without an admit.
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.read_metrics().active_sessions
    }

    /// Copy of the current metrics so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl RelayMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
