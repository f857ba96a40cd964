//! Worker pool running one function over a task collection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{DeployError, EngineError, Result};

/// Worker count spawning one worker per task.
pub const UNBOUNDED: i64 = -1;

/// How long the wait loop blocks on one task before checking in again.
const WAIT_SLICE: Duration = Duration::from_millis(500);

/// Runs `f` over every task with at most `worker_count` running at once
/// ([`UNBOUNDED`] or any non-positive count runs them all at once).
///
/// Each task is `(name, input)`; the name labels its failure. A failing or
/// panicking task does not stop the others. Results come back in task
/// order.
///
/// # Errors
///
/// Returns the task's own error when exactly one task failed, and
/// [`DeployError::Aggregate`] carrying every failure when several did.
pub async fn run_tasks<T, R, F, Fut>(worker_count: i64, tasks: Vec<(String, T)>, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let limit = usize::try_from(worker_count)
        .ok()
        .filter(|&n| n > 0)
        .unwrap_or(tasks.len());
    debug!("Running {} task(s) on {} worker(s)", tasks.len(), limit.min(tasks.len()));

    let permits = Arc::new(Semaphore::new(limit));
    let f = Arc::new(f);
    let handles: Vec<(String, JoinHandle<Result<R>>)> = tasks
        .into_iter()
        .map(|(name, input)| {
            let permits = Arc::clone(&permits);
            let f = Arc::clone(&f);
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| DeployError::internal(format!("worker pool closed: {e}")))?;
                f(input).await
            });
            (name, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    let mut failures = Vec::new();
    for (name, handle) in handles {
        match join_task(&name, handle).await {
            Ok(value) => results.push(value),
            Err(err) => {
                error!(task = %name, "{err}");
                failures.push((name, err));
            }
        }
    }

    match DeployError::from_failures(failures) {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

/// Waits for a spawned task, waking up every [`WAIT_SLICE`] so the caller
/// stays responsive to interruption. A panic becomes
/// [`EngineError::TaskPanicked`].
pub(crate) async fn join_task<R>(name: &str, mut handle: JoinHandle<Result<R>>) -> Result<R> {
    let joined = loop {
        match tokio::time::timeout(WAIT_SLICE, &mut handle).await {
            Ok(joined) => break joined,
            Err(_) => debug!("Still waiting for task '{name}'"),
        }
    };
    joined.unwrap_or_else(|join_error| {
        Err(EngineError::TaskPanicked {
            task: name.to_string(),
            message: panic_message(join_error),
        }
        .into())
    })
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("non-string panic payload"))
}
