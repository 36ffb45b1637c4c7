use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Operation {
    name: String,
    started: Instant,
    timeout: Duration,
    token: CancellationToken,
    warned: bool,
}

/// Snapshot of a watched operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveOperation {
    pub id: u64,
    pub name: String,
    pub age: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    ops: HashMap<u64, Operation>,
}

/// Cancels operations that outlive their deadline.
///
/// A background task wakes every tick, warns once an operation is past half
/// of its timeout, and cancels its token once the timeout is exceeded.
#[derive(Debug, Clone)]
pub struct Watchdog {
    state: Arc<Mutex<State>>,
    stop: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Watchdog {
    /// Start the watchdog with the default 5 s tick.
    #[must_use]
    pub fn start() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    #[must_use]
    pub fn with_tick(tick: Duration) -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            let stop = stop.clone();
            async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = interval.tick() => check(&state),
                    }
                }
                tracing::debug!("Watchdog stopped");
            }
        });

        Self {
            state,
            stop,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Watch an operation; `token` is cancelled if it overruns `timeout`.
    pub fn register(&self, name: &str, timeout: Duration, token: CancellationToken) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_id += 1;
        let id = state.next_id;
        state.ops.insert(
            id,
            Operation {
                name: name.to_string(),
                started: Instant::now(),
                timeout,
                token,
                warned: false,
            },
        );
        tracing::debug!(op_id = id, operation = name, timeout_secs = timeout.as_secs(), "Watching operation");
        id
    }

    /// Stop watching `id`.
    pub fn complete(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(op) = state.ops.remove(&id) {
            tracing::debug!(
                op_id = id,
                operation = %op.name,
                elapsed_secs = op.started.elapsed().as_secs_f64(),
                "Operation finished"
            );
        }
    }

    /// Currently watched operations, oldest first.
    pub fn active(&self) -> Vec<ActiveOperation> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ops: Vec<ActiveOperation> = state
            .ops
            .iter()
            .map(|(id, op)| ActiveOperation {
                id: *id,
                name: op.name.clone(),
                age: op.started.elapsed(),
                timeout: op.timeout,
            })
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Stop the background task.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn check(state: &Mutex<State>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let mut expired = Vec::new();

    for (id, op) in &mut state.ops {
        let age = op.started.elapsed();
        if age > op.timeout {
            tracing::error!(
                op_id = *id,
                operation = %op.name,
                age_secs = age.as_secs(),
                timeout_secs = op.timeout.as_secs(),
                "Operation exceeded its timeout, cancelling"
            );
            op.token.cancel();
            expired.push(*id);
        } else if !op.warned && age > op.timeout / 2 {
            op.warned = true;
            tracing::warn!(
                op_id = *id,
                operation = %op.name,
                age_secs = age.as_secs(),
                timeout_secs = op.timeout.as_secs(),
                "Operation is running long"
            );
        }
    }

    for id in expired {
        state.ops.remove(&id);
    }
}
