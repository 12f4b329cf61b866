//! Single-consumer FIFO worker queue.
//!
//! Every instrument-touching operation of a coordinator goes through one
//! queue, so no two commands ever overlap on a device link. The worker pulls
//! one task at a time and awaits it to completion before pulling the next.
//!
//! A task that fails with a retryable error is moved to the tail of the
//! queue after the handler cycled its connection and a backoff delay. Once
//! the retry policy is exhausted, or for non-retryable errors, the handler's
//! [`TaskHandler::abandon`] is called with the final error.
//!
//! ```no_run
//! use cryomag_daq::error::AppResult;
//! use cryomag_daq::error_recovery::RetryPolicy;
//! use cryomag_daq::queue::{TaskHandler, WorkerQueue};
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl TaskHandler<String> for Printer {
//!     async fn handle(&mut self, task: &String) -> AppResult<()> {
//!         println!("{task}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> AppResult<()> {
//! let (queue, worker) = WorkerQueue::new("printer", RetryPolicy::default());
//! tokio::spawn(worker.run(Printer));
//! queue.submit("hello".to_string())?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Executes the tasks of one queue.
#[async_trait]
pub trait TaskHandler<T: Send + Sync + 'static>: Send {
    /// Runs one task to completion.
    async fn handle(&mut self, task: &T) -> AppResult<()>;

    /// Called with the error of a retryable failure, before the task is requeued.
    async fn recover(&mut self, error: &DaqError) -> AppResult<()> {
        let _ = error;
        Ok(())
    }

    /// Called once a task will not be attempted again.
    async fn abandon(&mut self, task: T, error: DaqError) {
        let _ = (task, error);
    }
}

/// Constructor namespace for a queue and its worker.
pub struct WorkerQueue;

impl WorkerQueue {
    /// Creates a queue named `name` for logs.
    pub fn new<T: Send + Sync + 'static>(
        name: &str,
        policy: RetryPolicy,
    ) -> (QueueHandle<T>, QueueWorker<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let name: Arc<str> = Arc::from(name);
        (
            QueueHandle {
                name: name.clone(),
                tx,
                depth: depth.clone(),
            },
            QueueWorker {
                name,
                rx,
                depth,
                policy,
                backlog: VecDeque::new(),
            },
        )
    }
}

/// Submitting side of a queue. Cheap to clone.
#[derive(Debug)]
pub struct QueueHandle<T> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> QueueHandle<T> {
    /// Enqueues `task` without waiting.
    pub fn submit(&self, task: T) -> AppResult<()> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(DaqError::QueueClosed);
        }
        Ok(())
    }

    /// Pending plus in-flight tasks.
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Consuming side of a queue.
pub struct QueueWorker<T> {
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicUsize>,
    policy: RetryPolicy,
    backlog: VecDeque<(T, u32)>,
}

impl<T: Send + Sync + 'static> QueueWorker<T> {
    fn drain_channel(&mut self) {
        while let Ok(task) = self.rx.try_recv() {
            self.backlog.push_back((task, 0));
        }
    }

    async fn next_task(&mut self) -> Option<(T, u32)> {
        self.drain_channel();
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry);
        }
        self.rx.recv().await.map(|task| (task, 0))
    }

    /// Processes tasks until every [`QueueHandle`] is dropped and the queue is empty.
    pub async fn run<H: TaskHandler<T>>(mut self, mut handler: H) {
        info!(queue = %self.name, "worker started");

        while let Some((task, failures)) = self.next_task().await {
            match handler.handle(&task).await {
                Ok(()) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) => {
                    let failures = failures + 1;
                    if err.is_retryable() && self.policy.allows_retry(failures) {
                        let delay = self.policy.backoff_for(failures);
                        warn!(
                            queue = %self.name,
                            attempt = failures,
                            ?delay,
                            error = %err,
                            "task failed, requeueing"
                        );
                        if let Err(e) = handler.recover(&err).await {
                            warn!(queue = %self.name, error = %e, "recovery failed");
                        }
                        tokio::time::sleep(delay).await;
                        self.drain_channel();
                        self.backlog.push_back((task, failures));
                    } else {
                        error!(
                            queue = %self.name,
                            attempts = failures,
                            error = %err,
                            "task abandoned"
                        );
                        handler.abandon(task, err).await;
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }

        debug!(queue = %self.name, "worker stopped");
    }
}
