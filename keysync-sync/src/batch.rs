//! Bounded-concurrency batch executor.
//!
//! `workers` tasks pull [`WorkItem`]s from one shared queue, so a slow item
//! only holds up the worker running it. Each worker checks the cancellation
//! token before taking the next item: cancelling stops new work but lets
//! in-flight items finish. A failing (or panicking) item never stops its
//! siblings; every started item yields exactly one [`BatchResult`].
//!
//! Results come back in completion order, not submission order; the item id
//! identifies each one.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

type Operation = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), SyncError>> + Send>;

/// A named unit of work.
pub struct WorkItem {
    id: String,
    operation: Operation,
}

impl WorkItem {
    pub fn new<F, Fut>(id: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        WorkItem {
            id: id.into(),
            operation: Box::new(move || operation().boxed()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("id", &self.id).finish()
    }
}

/// Outcome of one [`WorkItem`].
#[derive(Debug)]
pub struct BatchResult {
    pub id: String,
    pub result: Result<(), SyncError>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Emitted once per completed item when progress reporting is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub id: String,
    pub completed: usize,
    pub total: usize,
    pub succeeded: bool,
}

/// Run `items` over at most `workers` concurrent tasks.
pub async fn process_batch(
    cancel: &CancellationToken,
    items: Vec<WorkItem>,
    workers: usize,
) -> Vec<BatchResult> {
    run(cancel, items, workers, None).await
}

/// Same as [`process_batch`], additionally sending one [`BatchProgress`]
/// per completed item. A closed receiver is ignored.
pub async fn process_batch_with_progress(
    cancel: &CancellationToken,
    items: Vec<WorkItem>,
    workers: usize,
    progress: UnboundedSender<BatchProgress>,
) -> Vec<BatchResult> {
    run(cancel, items, workers, Some(progress)).await
}

async fn run(
    cancel: &CancellationToken,
    items: Vec<WorkItem>,
    workers: usize,
    progress: Option<UnboundedSender<BatchProgress>>,
) -> Vec<BatchResult> {
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);
    tracing::debug!(total, workers, "dispatching batch");

    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut set = JoinSet::new();

    for _ in 0..workers {
        let queue = queue.clone();
        let completed = completed.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        set.spawn(async move {
            let mut results = Vec::new();
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(WorkItem { id, operation }) = next_item(&queue) else {
                    break;
                };

                let result = match AssertUnwindSafe(async move { operation().await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(SyncError::Worker(panic_message(panic.as_ref()))),
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(tx) = &progress {
                    let _ = tx.send(BatchProgress {
                        id: id.clone(),
                        completed: done,
                        total,
                        succeeded: result.is_ok(),
                    });
                }
                results.push(BatchResult { id, result });
            }
            results
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(partial) => results.extend(partial),
            Err(err) => tracing::error!(error = %err, "batch worker terminated"),
        }
    }
    results
}

fn next_item(queue: &Mutex<VecDeque<WorkItem>>) -> Option<WorkItem> {
    match queue.lock() {
        Ok(mut guard) => guard.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("work item panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("work item panicked: {s}")
    } else {
        "work item panicked".to_string()
    }
}

/// Collapse batch results into one outcome.
///
/// - no failures → number of succeeded items
/// - one failure → that item's error, verbatim
/// - several → [`SyncError::PartialFailure`] naming every failed id
///
/// Every failed id is logged at warn so the user can retry just that subset.
pub fn aggregate(results: Vec<BatchResult>) -> Result<usize, SyncError> {
    let total = results.len();
    let mut failures: Vec<(String, SyncError)> = results
        .into_iter()
        .filter_map(|r| r.result.err().map(|err| (r.id, err)))
        .collect();

    for (id, err) in &failures {
        tracing::warn!(key = %id, error = %err, "batch item failed");
    }

    match failures.len() {
        0 => Ok(total),
        1 => Err(failures.remove(0).1),
        failed => {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            let keys = failures.iter().map(|(id, _)| id.clone()).collect();
            let first = failures.remove(0).1;
            Err(SyncError::PartialFailure {
                failed,
                total,
                keys,
                first: Box::new(first),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
