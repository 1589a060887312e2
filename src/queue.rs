// Coalescing single-concurrency task queue.
//
// `push(id, payload)` enqueues a run of the worker function. At most
// one job executes at a time; once work is available the queue waits a
// short debounce window, then drops every backlog entry that shares an
// id with a later entry, so a burst of triggers for the same aggregate
// recomputes once with the freshest payload. The window is a throughput
// optimization only: the worker function must be idempotent, and
// correctness never depends on which duplicates were dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::Result;
use crate::metrics;

pub type WorkerFn<P> = Arc<dyn Fn(String, P) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct DedupWorkerQueue<P> {
    pending: Arc<Mutex<VecDeque<(String, P)>>>,
    notify: Arc<Notify>,
    busy: Arc<AtomicBool>,
}

impl<P: Send + 'static> DedupWorkerQueue<P> {
    /// Create the queue and spawn its single worker task.
    pub fn new(delay: Duration, worker: WorkerFn<P>) -> DedupWorkerQueue<P> {
        let pending: Arc<Mutex<VecDeque<(String, P)>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let busy = Arc::new(AtomicBool::new(false));

        let queue = DedupWorkerQueue {
            pending: pending.clone(),
            notify: notify.clone(),
            busy: busy.clone(),
        };

        tokio::spawn(async move {
            loop {
                while pending.lock().unwrap().is_empty() {
                    notify.notified().await;
                }
                // Debounce, then coalesce the backlog per id.
                tokio::time::sleep(delay).await;
                // Busy is raised under the same lock as the pop, so
                // `is_idle` can never observe an empty backlog while a
                // popped job has not started yet.
                let job = {
                    let mut q = pending.lock().unwrap();
                    coalesce(&mut q);
                    metrics::DEDUP_QUEUE_DEPTH.set(q.len() as i64);
                    let job = q.pop_front();
                    busy.store(job.is_some(), Ordering::SeqCst);
                    job
                };
                let Some((id, payload)) = job else { continue };
                if let Err(err) = (worker)(id.clone(), payload).await {
                    tracing::error!(%id, %err, "dedup queue worker failed");
                }
                busy.store(false, Ordering::SeqCst);
            }
        });

        queue
    }

    pub fn push(&self, id: impl Into<String>, payload: P) {
        let mut q = self.pending.lock().unwrap();
        q.push_back((id.into(), payload));
        metrics::DEDUP_QUEUE_DEPTH.set(q.len() as i64);
        drop(q);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// No backlog and no job in flight. Used by tests and shutdown to
    /// wait out asynchronous propagation. The busy flag is read under
    /// the backlog lock; the worker raises it under the same lock when
    /// it pops, so an empty backlog with a popped-but-unstarted job is
    /// never visible here.
    pub fn is_idle(&self) -> bool {
        let q = self.pending.lock().unwrap();
        q.is_empty() && !self.busy.load(Ordering::SeqCst)
    }
}

/// Keep only the most recently enqueued entry per id, preserving the
/// relative order of the kept entries.
fn coalesce<P>(q: &mut VecDeque<(String, P)>) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: VecDeque<(String, P)> = VecDeque::with_capacity(q.len());
    while let Some(entry) = q.pop_back() {
        if seen.insert(entry.0.clone()) {
            kept.push_front(entry);
        } else {
            metrics::DEDUP_DISCARDED_TOTAL.inc();
        }
    }
    *q = kept;
}
