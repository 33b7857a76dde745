// Single-flight coordination for token refresh

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::error::ApiError;
use crate::metrics::PipelineMetrics;

/// Outcome handed to queued callers: the new access token or the failure text
type Outcome = Result<String, String>;

/// Token a settled refresh replaced, and the token it produced
#[derive(Clone)]
struct Rotation {
    replaced: String,
    produced: String,
}

#[derive(Default)]
struct GateState {
    refreshing: bool,
    queue: VecDeque<oneshot::Sender<Outcome>>,
    last_rotation: Option<Rotation>,
}

/// In-flight flag plus the queue of callers waiting on it
///
/// The flag is checked and set under one lock with no await point in
/// between, so at most one refresh runs at a time even on a multi-threaded
/// runtime. Nothing but in-memory state is touched while the lock is held.
#[derive(Default)]
pub struct RefreshGate {
    state: Mutex<GateState>,
    metrics: Option<Arc<PipelineMetrics>>,
}

enum Entry<'a> {
    Leader(LeaderGuard<'a>),
    Waiter(oneshot::Receiver<Outcome>),
    Rotated(String),
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate that counts queued callers in `metrics`
    pub fn with_metrics(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            state: Mutex::default(),
            metrics: Some(metrics),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a refresh is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    /// Number of callers parked behind the current refresh
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Forget the last rotation, e.g. after the session was replaced
    pub fn reset(&self) {
        self.lock().last_rotation = None;
    }

    fn enter(&self, stale_token: Option<&str>) -> Entry<'_> {
        let mut state = self.lock();

        if state.refreshing {
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            if let Some(metrics) = &self.metrics {
                metrics.record_queued();
            }
            return Entry::Waiter(rx);
        }

        // A refresh for this very token already settled before we got here
        if let (Some(stale), Some(rotation)) = (stale_token, &state.last_rotation) {
            if rotation.replaced == stale {
                return Entry::Rotated(rotation.produced.clone());
            }
        }

        state.refreshing = true;
        Entry::Leader(LeaderGuard {
            gate: self,
            replaced: stale_token.map(str::to_string),
            settled: false,
        })
    }

    /// Obtain a fresh access token, running `refresh` only if no other
    /// caller is already doing so
    ///
    /// `stale_token` is the token the rejected request carried. When the
    /// last settled refresh replaced exactly that token, its result is
    /// returned without refreshing again. Queued callers are released in
    /// arrival order once the leader settles.
    pub async fn run<F, Fut>(&self, stale_token: Option<&str>, refresh: F) -> Result<String, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ApiError>>,
    {
        match self.enter(stale_token) {
            Entry::Rotated(token) => {
                tracing::debug!("Token already rotated by an earlier refresh");
                Ok(token)
            }
            Entry::Waiter(rx) => {
                tracing::debug!("Refresh already in flight, waiting for it to settle");
                match rx.await {
                    Ok(Ok(token)) => Ok(token),
                    Ok(Err(message)) => Err(ApiError::SessionExpired(message)),
                    Err(_) => Err(ApiError::SessionExpired(
                        "Token refresh was abandoned".to_string(),
                    )),
                }
            }
            Entry::Leader(mut guard) => {
                let result = refresh().await;
                guard.settle(match &result {
                    Ok(token) => Ok(token.clone()),
                    Err(ApiError::SessionExpired(message)) => Err(message.clone()),
                    Err(e) => Err(e.to_string()),
                });
                result
            }
        }
    }
}

/// Held by the caller performing the refresh
///
/// Dropping it without settling (cancellation, panic) still clears the flag
/// and rejects every waiter.
struct LeaderGuard<'a> {
    gate: &'a RefreshGate,
    replaced: Option<String>,
    settled: bool,
}

impl LeaderGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        if self.settled {
            return;
        }
        self.settled = true;

        let waiters = {
            let mut state = self.gate.lock();
            state.refreshing = false;
            state.last_rotation = match (&outcome, self.replaced.take()) {
                (Ok(produced), Some(replaced)) => Some(Rotation {
                    replaced,
                    produced: produced.clone(),
                }),
                _ => None,
            };
            std::mem::take(&mut state.queue)
        };

        if !waiters.is_empty() {
            tracing::debug!(
                waiters = waiters.len(),
                success = outcome.is_ok(),
                "Releasing queued requests"
            );
        }

        for waiter in waiters {
            // A dropped receiver means that caller went away; nothing to do
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Token refresh interrupted before completion");
            self.settle(Err("Token refresh was interrupted".to_string()));
        }
    }
}
