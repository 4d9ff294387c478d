//! Server metrics for observability
//!
//! Counters are bumped by the transport and the ticker; `/metrics` and
//! `/health` serve snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Worker metrics
    /// Producers started since server start
    pub workers_started: AtomicU64,
    /// Producers that have exited
    pub workers_stopped: AtomicU64,

    // Message metrics
    /// Frames received from clients (ignored by the hub)
    pub messages_received: AtomicU64,
    /// Frames written to clients
    pub messages_sent: AtomicU64,
    /// Broadcast deliveries that failed
    pub messages_dropped: AtomicU64,

    // Error metrics
    /// WebSocket read/write errors
    pub websocket_errors: AtomicU64,

    started_at: Option<(Instant, DateTime<Utc>)>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Some((Instant::now(), Utc::now())),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Worker tracking
    pub fn worker_started(&self) {
        self.workers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.workers_stopped.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.started_at
            .map(|(t, _)| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.workers_started.load(Ordering::Relaxed);
        let stopped = self.workers_stopped.load(Ordering::Relaxed);
        MetricsSnapshot {
            started_at: self.started_at.map(|(_, at)| at),
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            workers: WorkerMetrics {
                active: started.saturating_sub(stopped),
                started,
                stopped,
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Counts a producer as started when created and as stopped when dropped.
///
/// Owned by the producer future, so the stop is recorded on a clean return,
/// a panic, or an abort after the grace window alike.
#[derive(Debug)]
pub struct WorkerGuard {
    metrics: Arc<ServerMetrics>,
}

impl WorkerGuard {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        metrics.worker_started();
        Self { metrics }
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.metrics.worker_stopped();
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub workers: WorkerMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub active: u64,
    pub started: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub groups: usize,
    pub workers: usize,
    pub connections: u64,
    pub uptime_secs: u64,
}
