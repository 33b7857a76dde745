use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the authenticated request pipeline
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Requests handed to the pipeline
    requests_total: AtomicU64,

    /// Requests replayed with a refreshed token
    replays: AtomicU64,

    /// Refreshes entered as leader
    refreshes_started: AtomicU64,

    /// Refresh calls actually sent to the identity endpoint
    refresh_calls: AtomicU64,

    /// Refreshes that ended in session invalidation
    refresh_failures: AtomicU64,

    /// Callers that parked behind an in-flight refresh
    queued_waiters: AtomicU64,

    /// 401s on already-retried requests
    auth_expired: AtomicU64,

    /// Terminal errors keyed by kind
    errors_by_kind: DashMap<String, AtomicU64>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub replays: u64,
    pub refreshes_started: u64,
    pub refresh_calls: u64,
    pub refresh_failures: u64,
    pub queued_waiters: u64,
    pub auth_expired: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_started(&self) {
        self.refreshes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_call(&self) {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued_waiters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_expired(&self) {
        self.auth_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal error
    pub fn record_error(&self, kind: &str) {
        self.errors_by_kind
            .entry(kind.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
            refresh_calls: self.refresh_calls.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            queued_waiters: self.queued_waiters.load(Ordering::Relaxed),
            auth_expired: self.auth_expired.load(Ordering::Relaxed),
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}
