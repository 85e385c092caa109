//! Tracks handler calls in flight and warns about ones that run too long.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct ActiveCall {
    label: String,
    started: Instant,
}

#[derive(Default)]
pub struct ActiveCalls {
    calls: Mutex<HashMap<u64, ActiveCall>>,
    next_id: AtomicU64,
}

/// Removes its call from the tracker when dropped.
pub struct CallGuard {
    calls: Arc<ActiveCalls>,
    id: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.calls.calls.lock().remove(&self.id);
    }
}

impl ActiveCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(self: &Arc<Self>, label: impl Into<String>) -> CallGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().insert(
            id,
            ActiveCall {
                label: label.into(),
                started: Instant::now(),
            },
        );
        CallGuard {
            calls: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls running for longer than `threshold` at `now`, longest first.
    pub fn overdue_at(&self, now: Instant, threshold: Duration) -> Vec<(String, Duration)> {
        let mut overdue: Vec<(String, Duration)> = self
            .calls
            .lock()
            .values()
            .map(|c| (c.label.clone(), now.saturating_duration_since(c.started)))
            .filter(|(_, elapsed)| *elapsed > threshold)
            .collect();
        overdue.sort_by(|a, b| b.1.cmp(&a.1));
        overdue
    }

    /// Logs a warning per overdue call and returns how many there were.
    pub fn check_at(&self, now: Instant, threshold: Duration) -> usize {
        let overdue = self.overdue_at(now, threshold);
        for (label, elapsed) in &overdue {
            warn!("'{label}' has been running for {}s", elapsed.as_secs());
        }
        overdue.len()
    }
}

pub fn spawn_watchdog(
    calls: Arc<ActiveCalls>,
    every: Duration,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    calls.check_at(Instant::now(), threshold);
                }
            }
        }
        debug!("call watchdog stopped");
    })
}
