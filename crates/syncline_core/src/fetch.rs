//! Read-oriented sync units.

use crate::dispatch::DeliveryContext;
use crate::error::ErrorValue;
use crate::manager::ManagerInner;
use crate::unit::{SyncListener, UnitCore};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Caller-supplied behavior of a fetch.
///
/// Implementations hold their own fetched data; the engine only asks whether
/// the fetch is done and tells it when to start, reset and save.
pub trait FetchTask: Any + Send + Sync {
    /// Begins the asynchronous work. Must run off the calling thread (the
    /// worker dispatches from here) and eventually call
    /// [`Fetch::check_if_done`] or [`Fetch::set_error`] on the handle.
    fn on_start(&self, fetch: &Fetch);

    /// Clears all partial results so the fetch can start over.
    fn on_reset(&self);

    /// Returns true once all data this fetch is responsible for has arrived.
    fn is_done(&self) -> bool;

    /// Persists the fetched data. Runs on the serialized side-effect channel.
    fn on_save(&self) {}

    /// Returns true if `other` would fetch the same data as this task.
    ///
    /// Used to drop duplicate submissions of expensive fetches while an
    /// equivalent one is still queued. Default is no coalescing. Runs under
    /// the manager's queue lock, so it must only compare state and never
    /// call back into the manager.
    fn will_fetch_same_data(&self, _other: &Fetch) -> bool {
        false
    }
}

pub(crate) struct FetchInner {
    core: UnitCore,
    task: Box<dyn FetchTask>,
    should_reset: AtomicBool,
    retries: AtomicU32,
    group_member: AtomicBool,
}

/// A read-oriented sync unit.
///
/// Cheap to clone; all clones share the same underlying fetch. Construct one
/// around a [`FetchTask`] and hand it to
/// [`SyncManager::submit_fetch`](crate::SyncManager::submit_fetch).
#[derive(Clone)]
pub struct Fetch {
    inner: Arc<FetchInner>,
}

impl Fetch {
    /// Creates a fetch around the given task.
    pub fn new(task: impl FetchTask) -> Self {
        Self {
            inner: Arc::new(FetchInner {
                core: UnitCore::new(),
                task: Box::new(task),
                should_reset: AtomicBool::new(false),
                retries: AtomicU32::new(0),
                group_member: AtomicBool::new(false),
            }),
        }
    }

    /// Builds a fetch whose task needs a weak handle back to the fetch that
    /// owns it (the fetch group wires child completions through its parent).
    pub(crate) fn new_cyclic(
        task: impl FnOnce(Weak<FetchInner>) -> Box<dyn FetchTask>,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| FetchInner {
                core: UnitCore::new(),
                task: task(weak.clone()),
                should_reset: AtomicBool::new(false),
                retries: AtomicU32::new(0),
                group_member: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<FetchInner>) -> Self {
        Self { inner }
    }

    /// Sets how many times the fetch is silently restarted on failure before
    /// the failure is surfaced to listeners.
    pub fn with_retries(self, retries: u32) -> Self {
        self.inner.retries.store(retries, Ordering::SeqCst);
        self
    }

    /// Sets whether this fetch requires a bearer credential. Default is true.
    pub fn with_needs_credential(self, needs: bool) -> Self {
        self.inner.core.set_needs_credential(needs);
        self
    }

    /// Attaches a listener notified about this fetch only.
    pub fn with_listener(self, listener: Arc<dyn SyncListener>) -> Self {
        self.inner.core.set_listener(listener);
        self
    }

    /// Replaces the per-unit listener.
    pub fn set_listener(&self, listener: Arc<dyn SyncListener>) {
        self.inner.core.set_listener(listener);
    }

    /// Borrows the task as its concrete type.
    pub fn task<T: FetchTask>(&self) -> Option<&T> {
        let task: &dyn Any = self.inner.task.as_ref();
        task.downcast_ref::<T>()
    }

    /// Returns true once the task's completion predicate holds.
    pub fn is_done(&self) -> bool {
        self.inner.task.is_done()
    }

    /// Returns true if the fetch has failed.
    pub fn is_failed(&self) -> bool {
        self.inner.core.is_failed()
    }

    /// Returns true if the fetch has not failed.
    pub fn is_success(&self) -> bool {
        !self.is_failed()
    }

    /// Returns the error attached to the fetch, if any.
    pub fn error(&self) -> Option<ErrorValue> {
        self.inner.core.error()
    }

    /// Returns the human-readable error message, if one was attached.
    pub fn error_message(&self) -> Option<String> {
        self.inner.core.error_message()
    }

    /// Returns how many silent restarts remain.
    pub fn retries_remaining(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Fails the fetch with the given error.
    pub fn set_error(&self, error: ErrorValue) {
        self.inner.core.set_failure(Some(error), None);
        self.check_if_done();
    }

    /// Fails the fetch with an error and a message for the error display hook.
    pub fn set_error_and_message(&self, error: ErrorValue, message: impl Into<String>) {
        self.inner
            .core
            .set_failure(Some(error), Some(message.into()));
        self.check_if_done();
    }

    /// Runs the completion check.
    ///
    /// Task code calls this whenever new data may have completed the fetch.
    /// If the fetch is now done or failed, the completion is delivered to the
    /// owning manager exactly once, through the manager's delivery context.
    /// Before submission this is a no-op.
    pub fn check_if_done(&self) {
        let Some((manager, delivery)) = self.inner.core.binding() else {
            return;
        };
        if !self.inner.core.begin_completion(self.inner.task.is_done()) {
            return;
        }
        let fetch = self.clone();
        delivery.deliver(Box::new(move || manager.on_fetch_done(&fetch)));
    }

    pub(crate) fn core(&self) -> &UnitCore {
        &self.inner.core
    }

    pub(crate) fn is_started(&self) -> bool {
        self.inner.core.is_started()
    }

    pub(crate) fn start(&self) {
        self.inner.core.mark_started();
        self.inner.task.on_start(self);
    }

    /// Returns the fetch to idle so it can be started again.
    ///
    /// # Panics
    ///
    /// Panics if the fetch is neither done nor failed; resetting a unit
    /// mid-flight is a caller defect.
    pub(crate) fn reset(&self) {
        assert!(
            self.is_failed() || self.inner.task.is_done(),
            "can not reset a fetch that is not done or failed"
        );
        self.inner.core.reset_lifecycle();
        self.inner.should_reset.store(false, Ordering::SeqCst);
        self.inner.task.on_reset();
    }

    /// Flags a started fetch for reset once it completes, because an upload
    /// may have invalidated what it is reading. Unstarted fetches have
    /// produced nothing stale and are left alone.
    pub(crate) fn mark_should_reset(&self) {
        if self.is_started() {
            self.inner.should_reset.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn should_reset(&self) -> bool {
        self.inner.should_reset.load(Ordering::SeqCst)
    }

    pub(crate) fn decrement_retries(&self) {
        let _ = self
            .inner
            .retries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1));
    }

    pub(crate) fn mark_group_member(&self) {
        self.inner.group_member.store(true, Ordering::SeqCst);
    }

    /// Returns true if this fetch belongs to a fetch group. Group members are
    /// saved and retried by their group, not by the manager.
    pub fn is_group_member(&self) -> bool {
        self.inner.group_member.load(Ordering::SeqCst)
    }

    pub(crate) fn run_save(&self) {
        self.inner.task.on_save();
    }

    pub(crate) fn will_fetch_same_data(&self, other: &Fetch) -> bool {
        self.inner.task.will_fetch_same_data(other)
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn SyncListener>> {
        self.inner.core.listener()
    }

    pub(crate) fn bind(&self, manager: Weak<ManagerInner>, delivery: Arc<dyn DeliveryContext>) {
        self.inner.core.bind(manager, delivery);
    }

    pub(crate) fn manager(&self) -> Option<Arc<ManagerInner>> {
        self.inner.core.binding().map(|(manager, _)| manager)
    }
}

impl PartialEq for Fetch {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fetch {}

/// Single-value container for fetch tasks that download one object.
///
/// Embed one in a task, call [`set`](Self::set) from the response callback
/// and report `slot.is_set()` from [`FetchTask::is_done`]. Clearing the slot
/// from [`FetchTask::on_reset`] makes the task restartable.
pub struct FetchSlot<T> {
    value: Mutex<Option<T>>,
}

impl<T: Clone> FetchSlot<T> {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    /// Stores the fetched value and runs the owning fetch's completion check.
    pub fn set(&self, fetch: &Fetch, value: T) {
        *self.value.lock() = Some(value);
        fetch.check_if_done();
    }

    /// Returns a copy of the stored value, if set.
    pub fn value(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Returns true if a value has been stored.
    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Discards the stored value.
    pub fn clear(&self) {
        *self.value.lock() = None;
    }
}

impl<T: Clone> Default for FetchSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_value, SyncError};

    struct SlotTask {
        slot: FetchSlot<String>,
    }

    impl FetchTask for SlotTask {
        fn on_start(&self, _fetch: &Fetch) {}

        fn on_reset(&self) {
            self.slot.clear();
        }

        fn is_done(&self) -> bool {
            self.slot.is_set()
        }
    }

    fn slot_fetch() -> Fetch {
        Fetch::new(SlotTask {
            slot: FetchSlot::new(),
        })
    }

    #[test]
    fn slot_completes_the_task() {
        let fetch = slot_fetch();
        assert!(!fetch.is_done());

        let task = fetch.task::<SlotTask>().unwrap();
        task.slot.set(&fetch, "payload".into());
        assert!(fetch.is_done());
        assert_eq!(task.slot.value().as_deref(), Some("payload"));
    }

    #[test]
    fn check_if_done_before_submission_is_ignored() {
        let fetch = slot_fetch();
        let task = fetch.task::<SlotTask>().unwrap();
        task.slot.set(&fetch, "early".into());

        // The completion guard must still be armed for the real submission.
        assert!(fetch.core().begin_completion(fetch.is_done()));
    }

    #[test]
    fn task_downcast() {
        let fetch = slot_fetch();
        assert!(fetch.task::<SlotTask>().is_some());

        struct OtherTask;
        impl FetchTask for OtherTask {
            fn on_start(&self, _fetch: &Fetch) {}
            fn on_reset(&self) {}
            fn is_done(&self) -> bool {
                false
            }
        }
        assert!(fetch.task::<OtherTask>().is_none());
    }

    #[test]
    fn reset_clears_failure_and_data() {
        let fetch = slot_fetch();
        fetch.set_error(error_value(SyncError::Backend("timeout".into())));
        assert!(fetch.is_failed());

        fetch.reset();
        assert!(!fetch.is_failed());
        assert!(!fetch.is_started());
        assert!(!fetch.is_done());
    }

    #[test]
    #[should_panic(expected = "not done or failed")]
    fn reset_mid_flight_panics() {
        let fetch = slot_fetch();
        fetch.start();
        fetch.reset();
    }

    #[test]
    fn retries_builder_and_decrement() {
        let fetch = slot_fetch().with_retries(2);
        assert_eq!(fetch.retries_remaining(), 2);
        fetch.decrement_retries();
        assert_eq!(fetch.retries_remaining(), 1);
        fetch.decrement_retries();
        fetch.decrement_retries();
        assert_eq!(fetch.retries_remaining(), 0);
    }

    #[test]
    fn should_reset_only_marks_started_fetches() {
        let fetch = slot_fetch();
        fetch.mark_should_reset();
        assert!(!fetch.should_reset());

        fetch.start();
        fetch.mark_should_reset();
        assert!(fetch.should_reset());
    }

    #[test]
    fn same_data_default_is_no_coalescing() {
        let a = slot_fetch();
        let b = slot_fetch();
        assert!(!a.will_fetch_same_data(&b));
    }
}
