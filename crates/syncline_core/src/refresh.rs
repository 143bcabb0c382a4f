//! Single-flight credential refresh coordination.
//!
//! At most one refresh attempt is ever in flight; every unit demanding a
//! fresh credential waits on the same outcome. The coordinator runs on its
//! own thread so refresh I/O never blocks the worker's queue bookkeeping,
//! retries with a linear backoff up to the configured attempt limit, and on
//! permanent failure fails every queued unit that needs a credential.

use crate::error::ErrorValue;
use crate::manager::ManagerInner;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Outcome of a single refresh attempt.
#[derive(Clone)]
pub(crate) enum RefreshOutcome {
    Success,
    Failure {
        error: ErrorValue,
        abort_retries: bool,
    },
}

struct RefreshShared {
    outcome: Mutex<Option<RefreshOutcome>>,
    cond: Condvar,
}

/// Completion handle passed to the credential refresh hook.
///
/// The hook reports the attempt's result through exactly one of
/// [`success`](Self::success) or [`failure`](Self::failure); later reports
/// are ignored. The handle may be moved to any thread.
#[derive(Clone)]
pub struct RefreshHandle {
    shared: Arc<RefreshShared>,
}

impl RefreshHandle {
    /// Creates an unclaimed handle. The engine builds one per refresh
    /// attempt; tests exercising a delegate directly can too.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RefreshShared {
                outcome: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Reports that the credential was refreshed. Queued units resume.
    pub fn success(&self) {
        self.resolve(RefreshOutcome::Success);
    }

    /// Reports that the refresh attempt failed.
    ///
    /// With `abort_retries` false the coordinator retries with backoff until
    /// its attempt limit. Set it true when the failure is permanent (for
    /// example the credential was revoked by a logout); every queued unit
    /// that needs a credential is then failed with `error` immediately.
    pub fn failure(&self, error: ErrorValue, abort_retries: bool) {
        self.resolve(RefreshOutcome::Failure {
            error,
            abort_retries,
        });
    }

    fn resolve(&self, outcome: RefreshOutcome) {
        let mut slot = self.shared.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.shared.cond.notify_all();
        }
    }

    pub(crate) fn wait(&self) -> RefreshOutcome {
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.shared.cond.wait(&mut slot);
        }
    }
}

impl Default for RefreshHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the refresh coordinator thread for `manager`.
///
/// The caller must have claimed the single-flight slot first; the manager is
/// told the coordinator is gone through
/// [`ManagerInner::refresh_finished`] before the thread exits.
pub(crate) fn spawn(manager: Arc<ManagerInner>) {
    thread::Builder::new()
        .name("syncline-refresh".into())
        .spawn(move || run(manager))
        .expect("failed to spawn credential refresh thread");
}

fn run(manager: Arc<ManagerInner>) {
    let config = manager.refresh_config().clone();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        debug!(attempt, "refreshing credential");
        let handle = RefreshHandle::new();
        manager.delegate().start_refresh_credential(handle.clone());

        match handle.wait() {
            RefreshOutcome::Success => {
                debug!("credential refresh succeeded");
                manager.refresh_finished(None);
                return;
            }
            RefreshOutcome::Failure {
                error,
                abort_retries,
            } => {
                if abort_retries || attempt >= config.max_attempts {
                    warn!(attempt, abort_retries, "credential refresh gave up");
                    manager.refresh_finished(Some(error));
                    return;
                }
                let delay = config.delay_for_attempt(attempt);
                debug!(?delay, "credential refresh failed, scheduling retry");
                thread::sleep(delay);
            }
        }
    }
}
