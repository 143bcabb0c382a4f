//! A scripted in-process backend.
//!
//! Fixture tasks direct their "network" calls here. Every call runs on its
//! own thread and invokes its callback when done, like a real asynchronous
//! client would. Tests that need precise interleavings give tasks a [`Gate`]
//! to hold calls in flight until the test releases them.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

struct GateInner {
    open: Mutex<bool>,
    cond: Condvar,
}

/// A reusable barrier for holding backend calls in flight.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    /// Creates a gate, open or closed.
    pub fn new(open: bool) -> Self {
        Self {
            inner: Arc::new(GateInner {
                open: Mutex::new(open),
                cond: Condvar::new(),
            }),
        }
    }

    /// Opens the gate, releasing every call waiting on it.
    pub fn open(&self) {
        *self.inner.open.lock() = true;
        self.inner.cond.notify_all();
    }

    /// Closes the gate; subsequent calls wait until it opens again.
    pub fn close(&self) {
        *self.inner.open.lock() = false;
    }

    /// Blocks until the gate is open.
    pub fn wait_open(&self) {
        let mut open = self.inner.open.lock();
        while !*open {
            self.inner.cond.wait(&mut open);
        }
    }
}

struct BackendInner {
    items: Mutex<Vec<String>>,
    fetch_calls: AtomicUsize,
    store_calls: AtomicUsize,
}

/// An in-process stand-in for a remote backend.
///
/// Holds a list of named items. Reads and writes complete asynchronously on
/// spawned threads, counting every call so tests can assert how often the
/// network was actually hit.
#[derive(Clone)]
pub struct FakeBackend {
    inner: Arc<BackendInner>,
}

impl FakeBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                items: Mutex::new(Vec::new()),
                fetch_calls: AtomicUsize::new(0),
                store_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Replaces the stored items.
    pub fn seed_items(&self, items: Vec<String>) {
        *self.inner.items.lock() = items;
    }

    /// Returns a copy of the stored items.
    pub fn items(&self) -> Vec<String> {
        self.inner.items.lock().clone()
    }

    /// Reads all items asynchronously.
    pub fn get_items(&self, callback: impl FnOnce(Vec<String>) + Send + 'static) {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        spawn_call(move || callback(inner.items.lock().clone()));
    }

    /// Appends an item asynchronously.
    pub fn add_item(&self, name: String, callback: impl FnOnce(String) + Send + 'static) {
        self.inner.store_calls.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        spawn_call(move || {
            inner.items.lock().push(name.clone());
            callback(name);
        });
    }

    /// Runs an arbitrary job on a backend thread. Fixtures use this for
    /// scripted failures and gated completions.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        spawn_call(job);
    }

    /// Number of read calls made so far.
    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of write calls made so far.
    pub fn store_calls(&self) -> usize {
        self.inner.store_calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_call(job: impl FnOnce() + Send + 'static) {
    thread::Builder::new()
        .name("fake-backend".into())
        .spawn(job)
        .expect("failed to spawn backend call thread");
}
