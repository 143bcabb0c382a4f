//! Execution contexts for completion delivery and serialized side effects.
//!
//! The engine never runs caller-facing callbacks on an assumed thread.
//! Completion notifications go through a [`DeliveryContext`] so callers with
//! thread-affine state (a UI loop, an event reactor) can route them; database
//! style side effects (prepare/save/revert) go through a [`SerialExecutor`]
//! so they land in strict submission order.

use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Where completion callbacks are delivered.
///
/// The manager hands every completion notification and listener fan-out to
/// its delivery context. The default, [`InlineDelivery`], runs them
/// synchronously on whatever thread produced them; callers needing thread
/// affinity supply their own context (a [`SerialExecutor`] works).
pub trait DeliveryContext: Send + Sync {
    /// Delivers a job for execution.
    fn deliver(&self, job: Job);
}

/// Runs delivered jobs immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDelivery;

impl DeliveryContext for InlineDelivery {
    fn deliver(&self, job: Job) {
        job();
    }
}

/// A single-concurrency executor backed by one dedicated thread.
///
/// Jobs run one at a time in exactly the order they were submitted. The
/// manager uses one of these for prepare/save/revert so a non-transactional
/// backing store never sees interleaved writes.
pub struct SerialExecutor {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Creates a new executor with a named worker thread.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("failed to spawn serial executor thread");

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submits a job to run after all previously submitted jobs.
    ///
    /// Jobs submitted after [`shutdown`](Self::shutdown) are dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Drains all queued jobs and stops the worker thread.
    ///
    /// Must not be called from a job running on this executor; in that case
    /// the worker is released without being joined.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl DeliveryContext for SerialExecutor {
    fn deliver(&self, job: Job) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(job);
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
