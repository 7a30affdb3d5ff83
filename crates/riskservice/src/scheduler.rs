//! Keyed debouncing of recalculation triggers.
//!
//! [`FunctionDelayer::delay`] arms a timer per key. Further calls for a key whose timer has
//! not fired push the deadline back and discard their task, so a burst of triggers runs the
//! first task once, one debounce period after the last trigger. The key is released before
//! the task runs; a trigger arriving while the task executes starts a fresh timer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// Result of a [`FunctionDelayer::delay`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayOutcome {
    /// A new timer was armed and the task will run when it fires.
    Scheduled,
    /// A timer was already pending; its deadline moved and the new task was dropped.
    Extended,
    /// Shutdown has begun and no new work is accepted.
    Rejected,
}

impl DelayOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            DelayOutcome::Scheduled => "scheduled",
            DelayOutcome::Extended => "extended",
            DelayOutcome::Rejected => "rejected",
        }
    }
}

/// An external request to recalculate one patient's scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalesceRequest {
    pub patient_id: String,
    pub source: String,
    pub as_of: DateTime<Utc>,
    pub arrived_at: DateTime<Utc>,
}

impl CoalesceRequest {
    pub fn new(
        patient_id: impl Into<String>,
        source: impl Into<String>,
        as_of: Option<DateTime<Utc>>,
    ) -> Self {
        let arrived_at = Utc::now();
        Self {
            patient_id: patient_id.into(),
            source: source.into(),
            as_of: as_of.unwrap_or(arrived_at),
            arrived_at,
        }
    }

    /// Debounce slot shared by every request for the same patient and upstream source.
    pub fn key(&self) -> String {
        format!("{}@{}", self.patient_id, self.source)
    }
}

/// Per-key debouncer running delayed tasks on the tokio runtime.
#[derive(Clone)]
pub struct FunctionDelayer {
    inner: Arc<Inner>,
}

struct Inner {
    duration: Duration,
    deadlines: Mutex<HashMap<String, Instant>>,
    // Written only while `deadlines` is locked; `delay` reads it under the same lock.
    accepting: AtomicBool,
    flush: watch::Sender<bool>,
    // Armed timers plus tasks still running. Increments happen under the `deadlines` lock so
    // shutdown never observes zero while a slot is being armed; decrements take no lock.
    in_flight: watch::Sender<usize>,
}

impl FunctionDelayer {
    pub fn new(duration: Duration) -> Self {
        let (flush, _) = watch::channel(false);
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                duration,
                deadlines: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                flush,
                in_flight,
            }),
        }
    }

    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    /// Debounce `task` under `key`. Must be called from within a tokio runtime.
    pub fn delay<F>(&self, key: impl Into<String>, task: F) -> DelayOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut deadlines = self.inner.deadlines();
        if !self.inner.accepting.load(Ordering::Acquire) {
            return DelayOutcome::Rejected;
        }

        let deadline = Instant::now() + self.inner.duration;

        if let Some(pending) = deadlines.get_mut(&key) {
            *pending = deadline;
            debug!(%key, "debounce timer extended");
            return DelayOutcome::Extended;
        }

        deadlines.insert(key.clone(), deadline);
        let guard = InFlight::enter(Arc::clone(&self.inner));
        tokio::spawn(run_slot(Arc::clone(&self.inner), key, task, guard));
        DelayOutcome::Scheduled
    }

    /// Keys whose timers have not fired yet.
    pub fn pending(&self) -> usize {
        self.inner.deadlines().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting work, give pending timers up to `grace` to fire on their own, then fire
    /// the rest immediately. Returns once every task has finished.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let _deadlines = self.inner.deadlines();
            self.inner.accepting.store(false, Ordering::Release);
        }
        let mut in_flight = self.inner.in_flight.subscribe();

        if timeout(grace, idle(&mut in_flight)).await.is_ok() {
            return;
        }

        warn!(
            pending = self.pending(),
            "shutdown grace elapsed, firing remaining debounce timers"
        );
        self.inner.flush.send_replace(true);
        idle(&mut in_flight).await;
    }
}

impl Inner {
    fn deadlines(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_slot<F>(inner: Arc<Inner>, key: String, task: F, _guard: InFlight)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut flush = inner.flush.subscribe();

    loop {
        let Some(deadline) = inner.deadlines().get(&key).copied() else {
            break;
        };

        tokio::select! {
            _ = sleep_until(deadline) => {
                let mut deadlines = inner.deadlines();
                let due = deadlines
                    .get(&key)
                    .map_or(true, |current| *current <= Instant::now());
                if due {
                    deadlines.remove(&key);
                    break;
                }
            }
            _ = forced(&mut flush) => {
                inner.deadlines().remove(&key);
                break;
            }
        }
    }

    task.await;
}

async fn idle(in_flight: &mut watch::Receiver<usize>) {
    let _ = in_flight.wait_for(|count| *count == 0).await;
}

async fn forced(flush: &mut watch::Receiver<bool>) {
    let _ = flush.wait_for(|forced| *forced).await;
}

// Decrements the in-flight count when the slot's task completes or unwinds.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: Arc<Inner>) -> Self {
        inner.in_flight.send_modify(|count| *count += 1);
        Self(inner)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|count| *count -= 1);
    }
}
