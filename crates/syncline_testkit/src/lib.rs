//! # Syncline Testkit
//!
//! Test utilities for the syncline sync engine.
//!
//! This crate provides:
//! - A scripted in-process backend whose calls complete on worker threads
//! - Gates for holding backend calls in flight at precise points
//! - Fixture fetch and upload tasks with instrumented counters
//! - A recording listener and a scriptable sync delegate
//!
//! The cross-module property suite for the engine lives in this crate's
//! `tests/` directory and is built entirely from these fixtures.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;

pub use backend::{FakeBackend, Gate};
pub use fixtures::{
    GroupStats, ItemsFetch, ItemsGroupSpec, RecordingListener, RefreshStep, ScriptedDelegate,
    SyncEvent, TextStore, TextUpload,
};

use std::time::{Duration, Instant};

/// Polls `check` until it returns true, panicking after two seconds.
///
/// The fixtures complete on background threads, so assertions about their
/// effects go through this instead of bare sleeps.
pub fn wait_until(what: &str, check: impl Fn() -> bool) {
    wait_until_for(what, Duration::from_secs(2), check);
}

/// Polls `check` until it returns true, panicking after `timeout`.
pub fn wait_until_for(what: &str, timeout: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}
