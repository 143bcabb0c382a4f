//! Instrumented fixture tasks, listeners and delegates.

use crate::backend::{FakeBackend, Gate};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use syncline_core::{
    error_value, Fetch, FetchGroup, FetchGroupSpec, FetchSlot, FetchTask, RefreshHandle,
    SyncDelegate, SyncError, SyncListener, SyncUnit, Upload, UploadTask,
};

/// A fetch task that loads the backend's item list.
///
/// Every lifecycle hook is counted so tests can assert how often the fetch
/// was started, reset and saved.
pub struct ItemsFetch {
    backend: FakeBackend,
    slot: FetchSlot<Vec<String>>,
    scope: &'static str,
    coalesce: bool,
    reset_exempt: bool,
    gate: Option<Gate>,
    fail_remaining: AtomicUsize,
    starts: AtomicUsize,
    resets: AtomicUsize,
    saves: AtomicUsize,
}

impl ItemsFetch {
    /// Creates a fetch task against the given backend.
    pub fn new(backend: &FakeBackend) -> Self {
        Self {
            backend: backend.clone(),
            slot: FetchSlot::new(),
            scope: "items",
            coalesce: false,
            reset_exempt: false,
            gate: None,
            fail_remaining: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        }
    }

    /// Names the data this fetch reads; used by coalescing and tests.
    pub fn with_scope(mut self, scope: &'static str) -> Self {
        self.scope = scope;
        self
    }

    /// Opts this fetch into duplicate coalescing against same-scope fetches.
    pub fn coalescing(mut self) -> Self {
        self.coalesce = true;
        self
    }

    /// Marks this fetch as too expensive to restart on upload conflicts;
    /// [`TextUpload`] honors the exemption.
    pub fn reset_exempt(mut self) -> Self {
        self.reset_exempt = true;
        self
    }

    /// Holds this fetch's backend call on `gate`.
    pub fn with_gate(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    /// Makes the first `times` backend calls fail.
    pub fn failing(mut self, times: usize) -> Self {
        self.fail_remaining = AtomicUsize::new(times);
        self
    }

    /// Returns the fetched items, if the fetch completed.
    pub fn items(&self) -> Option<Vec<String>> {
        self.slot.value()
    }

    /// Returns true if uploads should not restart this fetch.
    pub fn is_reset_exempt(&self) -> bool {
        self.reset_exempt
    }

    /// Number of times the fetch was started.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of times the fetch was reset.
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Number of times the fetch was saved.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl FetchTask for ItemsFetch {
    fn on_start(&self, fetch: &Fetch) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.clone();
        let handle = fetch.clone();
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failing {
            self.backend.run(move || {
                if let Some(gate) = &gate {
                    gate.wait_open();
                }
                handle.set_error_and_message(
                    error_value(SyncError::Backend("item list unavailable".into())),
                    "could not load items",
                );
            });
        } else {
            let backend = self.backend.clone();
            self.backend.run(move || {
                if let Some(gate) = &gate {
                    gate.wait_open();
                }
                backend.get_items(move |items| {
                    if let Some(task) = handle.task::<ItemsFetch>() {
                        task.slot.set(&handle, items);
                    }
                });
            });
        }
    }

    fn on_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.slot.clear();
    }

    fn is_done(&self) -> bool {
        self.slot.is_set()
    }

    fn on_save(&self) {
        self.saves.fetch_add(1, Ordering::SeqCst);
    }

    fn will_fetch_same_data(&self, other: &Fetch) -> bool {
        self.coalesce
            && other
                .task::<ItemsFetch>()
                .is_some_and(|o| o.coalesce && o.scope == self.scope)
    }
}

/// The local "database" cell a [`TextUpload`] edits optimistically.
#[derive(Clone)]
pub struct TextStore {
    value: Arc<Mutex<String>>,
}

impl TextStore {
    /// Creates a store holding `initial`.
    pub fn new(initial: &str) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial.to_owned())),
        }
    }

    /// Returns the current value.
    pub fn get(&self) -> String {
        self.value.lock().clone()
    }

    /// Replaces the current value.
    pub fn set(&self, value: impl Into<String>) {
        *self.value.lock() = value.into();
    }
}

/// An upload task editing a [`TextStore`] field with optimistic local apply
/// and rollback.
///
/// Its revert baseline starts at whatever the store showed at construction
/// and is re-aligned by the engine while same-field uploads overlap.
pub struct TextUpload {
    backend: FakeBackend,
    store: TextStore,
    field: &'static str,
    from: Mutex<String>,
    to: String,
    gate: Option<Gate>,
    fail: AtomicBool,
    conflicts: bool,
    prepares: AtomicUsize,
    reverts: AtomicUsize,
    saves: AtomicUsize,
}

impl TextUpload {
    /// Creates an upload changing `field` of `store` to `to`.
    pub fn new(
        backend: &FakeBackend,
        store: &TextStore,
        field: &'static str,
        to: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.clone(),
            store: store.clone(),
            field,
            from: Mutex::new(store.get()),
            to: to.into(),
            gate: None,
            fail: AtomicBool::new(false),
            conflicts: false,
            prepares: AtomicUsize::new(0),
            reverts: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        }
    }

    /// Holds this upload's backend call on `gate`.
    pub fn with_gate(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    /// Makes the backend call fail.
    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    /// Declares this upload in conflict with same-field uploads.
    pub fn conflicting(mut self) -> Self {
        self.conflicts = true;
        self
    }

    /// Returns the value a revert would currently restore.
    pub fn baseline(&self) -> String {
        self.from.lock().clone()
    }

    /// Number of times prepare ran.
    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    /// Number of times revert ran.
    pub fn reverts(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }

    /// Number of times save ran.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl UploadTask for TextUpload {
    fn on_start(&self, upload: &Upload) {
        let gate = self.gate.clone();
        let handle = upload.clone();
        let fail = self.fail.load(Ordering::SeqCst);
        self.backend.run(move || {
            if let Some(gate) = &gate {
                gate.wait_open();
            }
            if fail {
                handle.set_error_and_message(
                    error_value(SyncError::Backend("text rejected".into())),
                    "could not save text",
                );
            } else {
                handle.upload_successful();
            }
        });
    }

    fn prepare(&self) {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        self.store.set(self.to.clone());
    }

    fn revert(&self) {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        self.store.set(self.from.lock().clone());
    }

    fn on_save(&self) {
        self.saves.fetch_add(1, Ordering::SeqCst);
    }

    fn has_conflict(&self, other: &Upload) -> bool {
        self.conflicts
            && other
                .task::<TextUpload>()
                .is_some_and(|o| o.field == self.field)
    }

    fn update_revert_values(&self, other: &Upload, use_old_values: bool) {
        let Some(other) = other.task::<TextUpload>() else {
            return;
        };
        if other.field != self.field {
            return;
        }
        let value = if use_old_values {
            other.baseline()
        } else {
            other.to.clone()
        };
        *self.from.lock() = value;
    }

    fn should_reset_fetch(&self, fetch: &Fetch) -> bool {
        fetch
            .task::<ItemsFetch>()
            .map_or(true, |f| !f.is_reset_exempt())
    }
}

/// Shared observation point for an [`ItemsGroupSpec`].
pub struct GroupStats {
    children: Mutex<Vec<Fetch>>,
    group_saves: AtomicUsize,
    group_resets: AtomicUsize,
}

impl GroupStats {
    /// Returns the child fetches added so far.
    pub fn children(&self) -> Vec<Fetch> {
        self.children.lock().clone()
    }

    /// Number of times the group-level save hook ran.
    pub fn group_saves(&self) -> usize {
        self.group_saves.load(Ordering::SeqCst)
    }

    /// Number of times the group-level reset hook ran.
    pub fn group_resets(&self) -> usize {
        self.group_resets.load(Ordering::SeqCst)
    }
}

/// A group spec fanning out one [`ItemsFetch`] per scope.
pub struct ItemsGroupSpec {
    backend: FakeBackend,
    scopes: Vec<&'static str>,
    stats: Arc<GroupStats>,
}

impl ItemsGroupSpec {
    /// Creates a spec adding one child per scope. An empty scope list makes
    /// the group fail fast at start.
    pub fn new(backend: &FakeBackend, scopes: Vec<&'static str>) -> Self {
        Self {
            backend: backend.clone(),
            scopes,
            stats: Arc::new(GroupStats {
                children: Mutex::new(Vec::new()),
                group_saves: AtomicUsize::new(0),
                group_resets: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the stats handle, valid after the spec moved into a group.
    pub fn stats(&self) -> Arc<GroupStats> {
        Arc::clone(&self.stats)
    }
}

impl FetchGroupSpec for ItemsGroupSpec {
    fn on_add_fetches(&self, group: &FetchGroup) {
        for scope in &self.scopes {
            let fetch = Fetch::new(ItemsFetch::new(&self.backend).with_scope(scope));
            self.stats.children.lock().push(fetch.clone());
            group.add(fetch);
        }
    }

    fn on_save_group(&self) {
        self.stats.group_saves.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reset_group(&self) {
        self.stats.group_resets.fetch_add(1, Ordering::SeqCst);
        self.stats.children.lock().clear();
    }
}

/// One observed completion event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// A fetch finished.
    FetchDone {
        /// Whether it finished failed.
        failed: bool,
    },
    /// An upload finished.
    UploadDone {
        /// Whether it finished failed.
        failed: bool,
    },
    /// A unit was dropped without side effects.
    Aborted,
}

/// A listener recording every completion it hears about.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingListener {
    /// Creates an empty listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events in order.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Total number of recorded events.
    pub fn total(&self) -> usize {
        self.events.lock().len()
    }

    /// Number of fetch completions, failed or not.
    pub fn fetches_done(&self) -> usize {
        self.count(|e| matches!(e, SyncEvent::FetchDone { .. }))
    }

    /// Number of failed fetch completions.
    pub fn fetch_failures(&self) -> usize {
        self.count(|e| matches!(e, SyncEvent::FetchDone { failed: true }))
    }

    /// Number of upload completions, failed or not.
    pub fn uploads_done(&self) -> usize {
        self.count(|e| matches!(e, SyncEvent::UploadDone { .. }))
    }

    /// Number of failed upload completions.
    pub fn upload_failures(&self) -> usize {
        self.count(|e| matches!(e, SyncEvent::UploadDone { failed: true }))
    }

    /// Number of aborted notifications.
    pub fn aborts(&self) -> usize {
        self.count(|e| matches!(e, SyncEvent::Aborted))
    }

    fn count(&self, pred: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl SyncListener for RecordingListener {
    fn on_fetch_done(&self, fetch: &Fetch) {
        self.events.lock().push(SyncEvent::FetchDone {
            failed: fetch.is_failed(),
        });
    }

    fn on_upload_done(&self, upload: &Upload) {
        self.events.lock().push(SyncEvent::UploadDone {
            failed: upload.is_failed(),
        });
    }

    fn on_sync_aborted(&self, _unit: &SyncUnit) {
        self.events.lock().push(SyncEvent::Aborted);
    }
}

/// One scripted outcome of a credential refresh attempt.
#[derive(Clone, Copy, Debug)]
pub enum RefreshStep {
    /// Report success and stop requiring refreshes.
    Succeed,
    /// Report a retryable failure.
    Fail,
    /// Report a permanent failure that aborts retries.
    Abort,
}

/// A [`SyncDelegate`] driven by test scripts instead of real policy.
pub struct ScriptedDelegate {
    allow_sync: AtomicBool,
    needs_refresh: AtomicBool,
    refresh_delay: Mutex<Duration>,
    refresh_script: Mutex<VecDeque<RefreshStep>>,
    refresh_calls: AtomicUsize,
    errors_shown: AtomicUsize,
}

impl ScriptedDelegate {
    /// Creates a delegate allowing everything, with no refresh required.
    pub fn new() -> Self {
        Self {
            allow_sync: AtomicBool::new(true),
            needs_refresh: AtomicBool::new(false),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_script: Mutex::new(VecDeque::new()),
            refresh_calls: AtomicUsize::new(0),
            errors_shown: AtomicUsize::new(0),
        }
    }

    /// Creates a delegate whose policy gate rejects every unit.
    pub fn denying() -> Self {
        let delegate = Self::new();
        delegate.allow_sync.store(false, Ordering::SeqCst);
        delegate
    }

    /// Starts with a credential refresh required. A `Succeed` step clears
    /// the requirement.
    pub fn needing_refresh(self) -> Self {
        self.needs_refresh.store(true, Ordering::SeqCst);
        self
    }

    /// Scripts the outcomes of successive refresh attempts. Attempts beyond
    /// the script succeed.
    pub fn with_refresh_script(self, steps: impl IntoIterator<Item = RefreshStep>) -> Self {
        self.refresh_script.lock().extend(steps);
        self
    }

    /// Makes every refresh attempt take `delay` before resolving.
    pub fn with_refresh_delay(self, delay: Duration) -> Self {
        *self.refresh_delay.lock() = delay;
        self
    }

    /// Number of refresh attempts started.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of units routed through the error display hook.
    pub fn errors_shown(&self) -> usize {
        self.errors_shown.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDelegate for ScriptedDelegate {
    fn should_sync_unit(&self, _unit: &SyncUnit) -> bool {
        self.allow_sync.load(Ordering::SeqCst)
    }

    fn should_refresh_credential(&self) -> bool {
        self.needs_refresh.load(Ordering::SeqCst)
    }

    fn start_refresh_credential(&self, refresh: RefreshHandle) {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let step = self
            .refresh_script
            .lock()
            .pop_front()
            .unwrap_or(RefreshStep::Succeed);
        match step {
            RefreshStep::Succeed => {
                self.needs_refresh.store(false, Ordering::SeqCst);
                refresh.success();
            }
            RefreshStep::Fail => refresh.failure(
                error_value(SyncError::refresh_retryable("token endpoint unavailable")),
                false,
            ),
            RefreshStep::Abort => refresh.failure(
                error_value(SyncError::refresh_permanent("credential revoked")),
                true,
            ),
        }
    }

    fn show_error(&self, _unit: &SyncUnit) {
        self.errors_shown.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_upload_captures_baseline_at_construction() {
        let backend = FakeBackend::new();
        let store = TextStore::new("a");
        let upload = TextUpload::new(&backend, &store, "note", "ab");
        assert_eq!(upload.baseline(), "a");

        upload.prepare();
        assert_eq!(store.get(), "ab");
        upload.revert();
        assert_eq!(store.get(), "a");
    }

    #[test]
    fn revert_baseline_realignment() {
        let backend = FakeBackend::new();
        let store = TextStore::new("a");
        let first = Upload::new(TextUpload::new(&backend, &store, "note", "ab"));
        store.set("ab");
        let second = TextUpload::new(&backend, &store, "note", "abc");
        assert_eq!(second.baseline(), "ab");

        // Queued behind the first upload: adopt its older baseline.
        second.update_revert_values(&first, true);
        assert_eq!(second.baseline(), "a");

        // First upload landed: its new value is the baseline now.
        second.update_revert_values(&first, false);
        assert_eq!(second.baseline(), "ab");
    }

    #[test]
    fn same_scope_fetches_coalesce() {
        let backend = FakeBackend::new();
        let a = ItemsFetch::new(&backend).coalescing();
        let b = Fetch::new(ItemsFetch::new(&backend).coalescing());
        let c = Fetch::new(ItemsFetch::new(&backend).coalescing().with_scope("other"));
        assert!(a.will_fetch_same_data(&b));
        assert!(!a.will_fetch_same_data(&c));
    }

    #[test]
    fn scripted_delegate_consumes_steps() {
        let delegate =
            ScriptedDelegate::new().with_refresh_script([RefreshStep::Fail, RefreshStep::Succeed]);

        delegate.start_refresh_credential(RefreshHandle::new());
        delegate.start_refresh_credential(RefreshHandle::new());
        assert_eq!(delegate.refresh_calls(), 2);
    }
}
