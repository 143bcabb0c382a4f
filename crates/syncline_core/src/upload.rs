//! Write-oriented sync units.

use crate::dispatch::DeliveryContext;
use crate::error::ErrorValue;
use crate::fetch::Fetch;
use crate::manager::ManagerInner;
use crate::unit::{SyncListener, UnitCore};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Caller-supplied behavior of an upload.
///
/// An upload optimistically applies its local effect in [`prepare`] before
/// the backend call, and undoes it in [`revert`] if the call fails. Uploads
/// of the same kind cooperate through [`has_conflict`] and
/// [`update_revert_values`] so back-to-back edits of one logical entity keep
/// a correct rollback baseline.
///
/// The queue-examination hooks ([`has_conflict`], [`update_revert_values`],
/// [`should_reset_fetch`]) run under the manager's queue lock; they must only
/// inspect and adjust unit state, never call back into the manager.
///
/// [`should_reset_fetch`]: Self::should_reset_fetch
/// [`prepare`]: Self::prepare
/// [`revert`]: Self::revert
/// [`has_conflict`]: Self::has_conflict
/// [`update_revert_values`]: Self::update_revert_values
pub trait UploadTask: Any + Send + Sync {
    /// Begins the asynchronous work. Must run off the calling thread and
    /// eventually call [`Upload::upload_successful`] or [`Upload::set_error`]
    /// on the handle.
    fn on_start(&self, upload: &Upload);

    /// Applies the local effect before the backend call, so callers see the
    /// change immediately. Runs once, on the serialized side-effect channel.
    fn prepare(&self) {}

    /// Undoes [`prepare`](Self::prepare) after a failed upload.
    fn revert(&self) {}

    /// Persists the result after a successful upload.
    fn on_save(&self) {}

    /// Returns true if this upload's local state would be clobbered by a
    /// blind revert or update on behalf of `other`. Default is no conflict.
    fn has_conflict(&self, _other: &Upload) -> bool {
        false
    }

    /// Re-aligns this upload's revert baseline against `other`, an upload of
    /// the same kind that was just queued behind it (`use_old_values` true)
    /// or just succeeded (`use_old_values` false).
    fn update_revert_values(&self, _other: &Upload, _use_old_values: bool) {}

    /// Returns false to exempt a specific queued fetch from the mandatory
    /// reset when this upload is submitted. Only worth overriding for fetches
    /// expensive enough that skipping a restart matters.
    fn should_reset_fetch(&self, _fetch: &Fetch) -> bool {
        true
    }
}

type SideEffect = Box<dyn FnOnce() + Send>;

struct UploadInner {
    core: UnitCore,
    task: Box<dyn UploadTask>,
    succeeded: AtomicBool,
    extra_prepare: Mutex<Option<SideEffect>>,
    extra_revert: Mutex<Option<SideEffect>>,
}

/// A write-oriented sync unit.
///
/// Cheap to clone; all clones share the same underlying upload. Construct one
/// around an [`UploadTask`] and hand it to
/// [`SyncManager::submit_upload`](crate::SyncManager::submit_upload).
#[derive(Clone)]
pub struct Upload {
    inner: Arc<UploadInner>,
}

impl Upload {
    /// Creates an upload around the given task.
    pub fn new(task: impl UploadTask) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                core: UnitCore::new(),
                task: Box::new(task),
                succeeded: AtomicBool::new(false),
                extra_prepare: Mutex::new(None),
                extra_revert: Mutex::new(None),
            }),
        }
    }

    /// Attaches an extra prepare side effect owned by calling code, run after
    /// the task's own [`UploadTask::prepare`].
    pub fn with_extra_prepare(self, effect: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.extra_prepare.lock() = Some(Box::new(effect));
        self
    }

    /// Attaches an extra revert side effect, run after the task's own
    /// [`UploadTask::revert`] when the upload fails.
    pub fn with_extra_revert(self, effect: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.extra_revert.lock() = Some(Box::new(effect));
        self
    }

    /// Sets whether this upload requires a bearer credential. Default is true.
    pub fn with_needs_credential(self, needs: bool) -> Self {
        self.inner.core.set_needs_credential(needs);
        self
    }

    /// Attaches a listener notified about this upload only.
    pub fn with_listener(self, listener: Arc<dyn SyncListener>) -> Self {
        self.inner.core.set_listener(listener);
        self
    }

    /// Replaces the per-unit listener.
    pub fn set_listener(&self, listener: Arc<dyn SyncListener>) {
        self.inner.core.set_listener(listener);
    }

    /// Borrows the task as its concrete type.
    pub fn task<T: UploadTask>(&self) -> Option<&T> {
        let task: &dyn Any = self.inner.task.as_ref();
        task.downcast_ref::<T>()
    }

    /// Marks the upload as successfully finished and runs the completion
    /// check. Task code calls this instead of a plain completion check.
    pub fn upload_successful(&self) {
        self.inner.succeeded.store(true, Ordering::SeqCst);
        self.check_if_done();
    }

    /// Returns true once the backend accepted the upload.
    pub fn succeeded(&self) -> bool {
        self.inner.succeeded.load(Ordering::SeqCst)
    }

    /// An upload is done once it has either failed or succeeded.
    pub fn is_done(&self) -> bool {
        self.is_failed() || self.succeeded()
    }

    /// Returns true if the upload has failed.
    pub fn is_failed(&self) -> bool {
        self.inner.core.is_failed()
    }

    /// Returns true if the upload has not failed.
    pub fn is_success(&self) -> bool {
        !self.is_failed()
    }

    /// Returns the error attached to the upload, if any.
    pub fn error(&self) -> Option<ErrorValue> {
        self.inner.core.error()
    }

    /// Returns the human-readable error message, if one was attached.
    pub fn error_message(&self) -> Option<String> {
        self.inner.core.error_message()
    }

    /// Fails the upload with the given error.
    pub fn set_error(&self, error: ErrorValue) {
        self.inner.core.set_failure(Some(error), None);
        self.check_if_done();
    }

    /// Fails the upload with an error and a message for the error display
    /// hook.
    pub fn set_error_and_message(&self, error: ErrorValue, message: impl Into<String>) {
        self.inner
            .core
            .set_failure(Some(error), Some(message.into()));
        self.check_if_done();
    }

    /// Runs the completion check, delivering the completion to the owning
    /// manager exactly once when the upload is done.
    pub fn check_if_done(&self) {
        let Some((manager, delivery)) = self.inner.core.binding() else {
            return;
        };
        if !self.inner.core.begin_completion(self.succeeded()) {
            return;
        }
        let upload = self.clone();
        delivery.deliver(Box::new(move || manager.on_upload_done(&upload)));
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

    pub(crate) fn run_prepare(&self) {
        self.inner.task.prepare();
        if let Some(effect) = self.inner.extra_prepare.lock().take() {
            effect();
        }
    }

    pub(crate) fn run_revert(&self) {
        self.inner.task.revert();
        if let Some(effect) = self.inner.extra_revert.lock().take() {
            effect();
        }
    }

    pub(crate) fn run_save(&self) {
        self.inner.task.on_save();
    }

    pub(crate) fn has_conflict(&self, other: &Upload) -> bool {
        self.inner.task.has_conflict(other)
    }

    pub(crate) fn update_revert_values(&self, other: &Upload, use_old_values: bool) {
        self.inner.task.update_revert_values(other, use_old_values);
    }

    pub(crate) fn should_reset_fetch(&self, fetch: &Fetch) -> bool {
        self.inner.task.should_reset_fetch(fetch)
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn SyncListener>> {
        self.inner.core.listener()
    }

    pub(crate) fn bind(&self, manager: Weak<ManagerInner>, delivery: Arc<dyn DeliveryContext>) {
        self.inner.core.bind(manager, delivery);
    }
}

impl PartialEq for Upload {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Upload {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_value, SyncError};

    struct NoteUpload {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl UploadTask for NoteUpload {
        fn on_start(&self, _upload: &Upload) {}

        fn prepare(&self) {
            self.log.lock().push("task prepare");
        }

        fn revert(&self) {
            self.log.lock().push("task revert");
        }

        fn on_save(&self) {
            self.log.lock().push("task save");
        }
    }

    fn note_upload() -> (Upload, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let upload = Upload::new(NoteUpload {
            log: Arc::clone(&log),
        });
        (upload, log)
    }

    #[test]
    fn done_requires_success_or_failure() {
        let (upload, _) = note_upload();
        assert!(!upload.is_done());

        upload.upload_successful();
        assert!(upload.is_done());
        assert!(upload.is_success());
    }

    #[test]
    fn failure_makes_the_upload_done() {
        let (upload, _) = note_upload();
        upload.set_error(error_value(SyncError::Backend("403".into())));
        assert!(upload.is_done());
        assert!(upload.is_failed());
        assert!(!upload.succeeded());
    }

    #[test]
    fn extra_effects_run_after_task_hooks() {
        let (upload, log) = note_upload();
        let upload = {
            let log_p = Arc::clone(&log);
            let log_r = Arc::clone(&log);
            upload
                .with_extra_prepare(move || log_p.lock().push("extra prepare"))
                .with_extra_revert(move || log_r.lock().push("extra revert"))
        };

        upload.run_prepare();
        upload.run_revert();

        assert_eq!(
            *log.lock(),
            vec!["task prepare", "extra prepare", "task revert", "extra revert"]
        );
    }

    #[test]
    fn extra_effects_run_at_most_once() {
        let (upload, log) = note_upload();
        let log_p = Arc::clone(&log);
        let upload = upload.with_extra_prepare(move || log_p.lock().push("extra prepare"));

        upload.run_prepare();
        upload.run_prepare();

        let entries = log.lock();
        assert_eq!(
            entries.iter().filter(|e| **e == "extra prepare").count(),
            1
        );
    }

    #[test]
    fn conflict_default_is_none() {
        let (a, _) = note_upload();
        let (b, _) = note_upload();
        assert!(!a.has_conflict(&b));
    }

    #[test]
    fn reset_fetch_default_is_reset_everything() {
        let (upload, _) = note_upload();
        struct NopFetch;
        impl crate::fetch::FetchTask for NopFetch {
            fn on_start(&self, _fetch: &Fetch) {}
            fn on_reset(&self) {}
            fn is_done(&self) -> bool {
                false
            }
        }
        let fetch = Fetch::new(NopFetch);
        assert!(upload.should_reset_fetch(&fetch));
    }

    #[test]
    fn task_downcast() {
        let (upload, _) = note_upload();
        assert!(upload.task::<NoteUpload>().is_some());
    }
}
