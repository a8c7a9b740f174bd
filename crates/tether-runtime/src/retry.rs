//! Retry with staged backoff, cancellable handles and a shared registry.
//!
//! A [`RetryPolicy`] is a list of stages. Each stage contributes a number of
//! retries and the delay slept before each of them; the last stage may be
//! unbounded. `RetryPolicy::new().then(3, 1s).forever(5s)` retries quickly
//! three times and then settles into a steady five second cadence.
//!
//! [`RetryTask::execute`] spawns the loop on the tokio runtime and returns a
//! [`RetryHandle`]. Every spawned task is tracked by a [`RetryRegistry`] so
//! that shutdown can cancel all of them at once.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stage {
    /// Number of retries in this stage. `None` never runs out.
    count: Option<u32>,
    delay: Duration,
}

/// Sequence of backoff delays, built from stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    stages: Vec<Stage>,
}

impl RetryPolicy {
    /// An empty policy: the first failure is final.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `count` retries, each preceded by `delay`.
    pub fn then(self, count: u32, delay: Duration) -> Self {
        self.stage(Some(count), delay)
    }

    /// Appends an unbounded stage. Stages after it are never reached.
    pub fn forever(self, delay: Duration) -> Self {
        self.stage(None, delay)
    }

    /// Appends a stage; `None` means unbounded.
    pub fn stage(mut self, count: Option<u32>, delay: Duration) -> Self {
        self.stages.push(Stage { count, delay });
        self
    }

    /// The successive delays this policy yields.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + '_ {
        self.stages.iter().flat_map(|stage| {
            let count = stage.count.map_or(usize::MAX, |c| c as usize);
            std::iter::repeat(stage.delay).take(count)
        })
    }

    /// Total attempts allowed (first try included), or `None` if unbounded.
    pub fn max_attempts(&self) -> Option<u32> {
        self.stages
            .iter()
            .try_fold(1u32, |acc, stage| stage.count.map(|c| acc.saturating_add(c)))
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a retry task stopped without a result.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The task was cancelled through its handle or by registry shutdown.
    #[error("retry cancelled")]
    Cancelled,

    /// The operation failed with an error the task does not retry.
    #[error("non-retryable failure: {0}")]
    Aborted(E),

    /// The policy ran out of delays.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The operation's last error, if one was recorded.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Aborted(e) | Self::Exhausted { last: e, .. } => Some(e),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Terminal-transition hooks. Exactly one fires per executed task.
pub trait RetryListener<T, E>: Send + Sync {
    fn completed(&self, _value: &T) {}
    fn failed(&self, _error: &RetryError<E>) {}
    fn canceled(&self) {}
}

impl<T, E> RetryListener<T, E> for () {}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    tasks: HashMap<u64, Arc<watch::Sender<bool>>>,
    shut_down: bool,
}

/// Tracks in-flight retry tasks so they can be cancelled together.
#[derive(Default)]
pub struct RetryRegistry {
    state: Mutex<RegistryState>,
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, cancel: &Arc<watch::Sender<bool>>) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shut_down {
            cancel.send_replace(true);
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(id, Arc::clone(cancel));
        Some(id)
    }

    fn deregister(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tasks.remove(&id);
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shut_down
    }

    /// Cancels every in-flight task. Tasks executed afterwards are cancelled
    /// before their first attempt.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shut_down = true;
            state.tasks.drain().map(|(_, cancel)| cancel).collect()
        };
        info!(count = tasks.len(), "Cancelling in-flight retry tasks");
        for cancel in tasks {
            cancel.send_replace(true);
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// A retry configuration ready to run operations failing with `E`.
pub struct RetryTask<E> {
    policy: RetryPolicy,
    retry_if: Option<RetryPredicate<E>>,
}

impl<E> Clone for RetryTask<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            retry_if: self.retry_if.clone(),
        }
    }
}

impl<E> RetryTask<E>
where
    E: Debug + Send + 'static,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_if: None,
        }
    }

    /// Only retry errors matching `predicate`. Without one, every error is
    /// retried until the policy runs out.
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Spawns the retry loop for `operation`, tracked by `registry`.
    pub fn execute<T, F, Fut, L>(
        &self,
        registry: &Arc<RetryRegistry>,
        operation: F,
        listener: L,
    ) -> RetryHandle<T, E>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        L: RetryListener<T, E> + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let cancel = Arc::new(tx);
        let id = registry.register(&cancel);
        let registry = Arc::clone(registry);
        let task = self.clone();

        let join = tokio::spawn(async move {
            let result = task.run_loop(operation, rx).await;
            if let Some(id) = id {
                registry.deregister(id);
            }
            match &result {
                Ok(value) => listener.completed(value),
                Err(RetryError::Cancelled) => listener.canceled(),
                Err(e) => listener.failed(e),
            }
            result
        });

        RetryHandle { cancel, join }
    }

    /// Runs the retry loop on the current task, outside any registry.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (_tx, rx) = watch::channel(false);
        self.run_loop(operation, rx).await
    }

    async fn run_loop<T, F, Fut>(
        &self,
        mut operation: F,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delays = self.policy.delays();
        let mut attempts = 0u32;

        loop {
            if *cancel.borrow() {
                debug!(attempts, "retry cancelled");
                return Err(RetryError::Cancelled);
            }
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(RetryError::Cancelled),
                outcome = operation() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(
                            attempt = attempts,
                            "retry succeeded after {} previous failures",
                            attempts - 1
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(retry_if) = &self.retry_if {
                if !retry_if(&err) {
                    debug!(attempt = attempts, "error is not retryable, giving up: {:?}", err);
                    return Err(RetryError::Aborted(err));
                }
            }

            let Some(delay) = delays.next() else {
                warn!(attempt = attempts, "all retry attempts exhausted: {:?}", err);
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            };

            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after error: {:?}",
                err
            );

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Resolves once cancellation is requested. If every sender is gone nobody
/// can cancel any more, so it never resolves.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Handle to a spawned retry task.
pub struct RetryHandle<T, E> {
    cancel: Arc<watch::Sender<bool>>,
    join: JoinHandle<Result<T, RetryError<E>>>,
}

impl<T, E> RetryHandle<T, E> {
    /// Requests cancellation. No further attempts start after this returns;
    /// an attempt already running is dropped at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the terminal outcome.
    pub async fn result(self) -> Result<T, RetryError<E>> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(RetryError::Cancelled),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
