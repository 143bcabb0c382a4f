//! Shared lifecycle state for sync units.
//!
//! Both unit kinds (fetch and upload) embed a [`UnitCore`] holding the
//! lifecycle flags, the attached error, the manager binding and the optional
//! per-unit listener. The core enforces the exactly-once completion guard:
//! however many times a unit's completion check runs, its listeners hear
//! about the outcome once per lifecycle.

use crate::dispatch::DeliveryContext;
use crate::error::ErrorValue;
use crate::fetch::Fetch;
use crate::manager::ManagerInner;
use crate::upload::Upload;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Callbacks fired when sync units finish.
///
/// All methods default to no-ops so listeners implement only what they need.
/// Registered listeners hear about every unit the manager completes; a
/// listener attached to a single unit hears about that unit only.
pub trait SyncListener: Send + Sync {
    /// A fetch finished, successfully or not.
    fn on_fetch_done(&self, _fetch: &Fetch) {}

    /// An upload finished, successfully or not.
    fn on_upload_done(&self, _upload: &Upload) {}

    /// A unit was dropped without running: the policy gate rejected it or
    /// the manager was stopped while it was in flight. No save or revert
    /// side effects were performed.
    fn on_sync_aborted(&self, _unit: &SyncUnit) {}
}

/// A schedulable sync unit: either a fetch or an upload.
#[derive(Clone)]
pub enum SyncUnit {
    /// A read-oriented unit.
    Fetch(Fetch),
    /// A write-oriented unit.
    Upload(Upload),
}

impl SyncUnit {
    /// Returns true if the unit has failed.
    pub fn is_failed(&self) -> bool {
        self.core().is_failed()
    }

    /// Returns the error attached to the unit, if any.
    pub fn error(&self) -> Option<ErrorValue> {
        self.core().error()
    }

    /// Returns the human-readable error message, if one was attached.
    pub fn error_message(&self) -> Option<String> {
        self.core().error_message()
    }

    /// Returns true if the unit requires a bearer credential to sync.
    pub fn needs_credential(&self) -> bool {
        self.core().needs_credential()
    }

    pub(crate) fn start(&self) {
        match self {
            SyncUnit::Fetch(fetch) => fetch.start(),
            SyncUnit::Upload(upload) => upload.start(),
        }
    }

    pub(crate) fn set_error(&self, error: ErrorValue) {
        match self {
            SyncUnit::Fetch(fetch) => fetch.set_error(error),
            SyncUnit::Upload(upload) => upload.set_error(error),
        }
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn SyncListener>> {
        self.core().listener()
    }

    fn core(&self) -> &UnitCore {
        match self {
            SyncUnit::Fetch(fetch) => fetch.core(),
            SyncUnit::Upload(upload) => upload.core(),
        }
    }
}

/// Where a bound unit reports its completion.
pub(crate) struct Binding {
    pub(crate) manager: Weak<ManagerInner>,
    pub(crate) delivery: Arc<dyn DeliveryContext>,
}

#[derive(Default)]
struct Lifecycle {
    error: Option<ErrorValue>,
    error_message: Option<String>,
    failed: bool,
    started: bool,
    listener_notified: bool,
}

/// Lifecycle state shared by both unit kinds.
pub(crate) struct UnitCore {
    state: Mutex<Lifecycle>,
    needs_credential: AtomicBool,
    listener: Mutex<Option<Arc<dyn SyncListener>>>,
    binding: Mutex<Option<Binding>>,
}

impl UnitCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(Lifecycle::default()),
            needs_credential: AtomicBool::new(true),
            listener: Mutex::new(None),
            binding: Mutex::new(None),
        }
    }

    /// A unit counts as started once dispatched or once failed, so a unit
    /// failed before dispatch is never picked up by the worker.
    pub(crate) fn is_started(&self) -> bool {
        let state = self.state.lock();
        state.started || state.failed
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub(crate) fn error(&self) -> Option<ErrorValue> {
        self.state.lock().error.clone()
    }

    pub(crate) fn error_message(&self) -> Option<String> {
        self.state.lock().error_message.clone()
    }

    pub(crate) fn mark_started(&self) {
        self.state.lock().started = true;
    }

    pub(crate) fn set_failure(&self, error: Option<ErrorValue>, message: Option<String>) {
        let mut state = self.state.lock();
        state.error = error;
        if message.is_some() {
            state.error_message = message;
        }
        state.failed = true;
    }

    /// Returns the unit to its idle state. Callers must have checked that the
    /// unit is done or failed first.
    pub(crate) fn reset_lifecycle(&self) {
        let mut state = self.state.lock();
        state.error = None;
        state.error_message = None;
        state.failed = false;
        state.started = false;
        state.listener_notified = false;
    }

    /// Claims the single completion notification if the unit is finished.
    ///
    /// Returns true exactly once per lifecycle, and only when the unit is
    /// failed or `done` holds.
    pub(crate) fn begin_completion(&self, done: bool) -> bool {
        let mut state = self.state.lock();
        if (state.failed || done) && !state.listener_notified {
            state.listener_notified = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn needs_credential(&self) -> bool {
        self.needs_credential.load(Ordering::SeqCst)
    }

    pub(crate) fn set_needs_credential(&self, needs: bool) {
        self.needs_credential.store(needs, Ordering::SeqCst);
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn SyncListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn SyncListener>> {
        self.listener.lock().clone()
    }

    pub(crate) fn bind(&self, manager: Weak<ManagerInner>, delivery: Arc<dyn DeliveryContext>) {
        *self.binding.lock() = Some(Binding { manager, delivery });
    }

    /// Returns the bound manager and delivery context, if the unit was
    /// submitted and the manager is still alive.
    pub(crate) fn binding(&self) -> Option<(Arc<ManagerInner>, Arc<dyn DeliveryContext>)> {
        let binding = self.binding.lock();
        let binding = binding.as_ref()?;
        let manager = binding.manager.upgrade()?;
        Some((manager, Arc::clone(&binding.delivery)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_value, SyncError};

    #[test]
    fn fresh_core_is_idle() {
        let core = UnitCore::new();
        assert!(!core.is_started());
        assert!(!core.is_failed());
        assert!(core.error().is_none());
        assert!(core.needs_credential());
    }

    #[test]
    fn failed_counts_as_started() {
        let core = UnitCore::new();
        core.set_failure(Some(error_value(SyncError::Backend("410".into()))), None);
        assert!(core.is_started());
        assert!(core.is_failed());
    }

    #[test]
    fn completion_fires_exactly_once() {
        let core = UnitCore::new();
        assert!(!core.begin_completion(false));

        core.mark_started();
        assert!(core.begin_completion(true));
        assert!(!core.begin_completion(true));

        // A reset re-arms the guard.
        core.reset_lifecycle();
        assert!(!core.is_started());
        assert!(core.begin_completion(true));
    }

    #[test]
    fn failure_message_is_kept() {
        let core = UnitCore::new();
        core.set_failure(
            Some(error_value(SyncError::Backend("conflict".into()))),
            Some("could not save".into()),
        );
        assert_eq!(core.error_message().as_deref(), Some("could not save"));
        assert!(core.error().is_some());
    }

    #[test]
    fn unbound_core_has_no_binding() {
        let core = UnitCore::new();
        assert!(core.binding().is_none());
    }
}
