use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Aggregate server counters, incremented concurrently from connection
/// handlers and workers and read by the stats reporting path.
pub struct ServerStats {
    started_at: DateTime<Utc>,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a double close must never wrap the gauge.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(1)
            });
    }

    pub fn request_accepted(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_recorded(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Value {
        let uptime = Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1_000.0;

        json!({
            "start_time": self.started_at.to_rfc3339(),
            "uptime_seconds": uptime,
            "total_connections": self.total_connections.load(Ordering::Relaxed),
            "active_connections": self.active_connections.load(Ordering::Relaxed),
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
        })
    }
}
