//! The sync manager: queues, worker loop and completion handling.
//!
//! Two queues are managed, a fetch queue and an upload queue. Units run in
//! parallel once started, but no fetch is started while any upload is queued;
//! this keeps reads from racing writes into an inconsistent store. If a fetch
//! is already in flight when an upload arrives, the fetch is flagged and
//! restarted after it lands, because what it read may now be stale.
//!
//! A failed fetch is reported to listeners (or silently retried while it has
//! retries left). A failed upload is rolled back through its revert hook,
//! unless another queued upload of the same kind owns the authoritative local
//! state, in which case the revert would clobber it and is skipped.
//!
//! One worker thread drains both queues as fast as it can. Everything
//! touching the queues is guarded by a single lock, so a fetch finishing at
//! the same instant an upload is submitted cannot slip its save past the
//! upload's prepare.

use crate::config::{ManagerConfig, RefreshConfig};
use crate::dispatch::{DeliveryContext, InlineDelivery, SerialExecutor};
use crate::error::ErrorValue;
use crate::fetch::Fetch;
use crate::refresh::{self, RefreshHandle};
use crate::unit::{SyncListener, SyncUnit};
use crate::upload::Upload;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

/// Capabilities the sync manager needs from its host application.
pub trait SyncDelegate: Send + Sync {
    /// Called on the worker thread just before a unit is started, to check
    /// for conditions under which it should not sync at all (for example no
    /// credential exists yet). Returning false drops the unit with an
    /// aborted notification and no side effects.
    fn should_sync_unit(&self, unit: &SyncUnit) -> bool;

    /// Called on the worker thread before starting a unit that needs a
    /// credential. Returning true pauses scheduling and triggers
    /// [`start_refresh_credential`](Self::start_refresh_credential).
    fn should_refresh_credential(&self) -> bool;

    /// Refreshes the bearer credential, reporting the outcome through
    /// `refresh`. Called on the refresh coordinator thread; the work may
    /// complete asynchronously on any thread.
    fn start_refresh_credential(&self, refresh: RefreshHandle);

    /// Surfaces a failed unit to the user. The default logs the unit's error
    /// message, if any.
    fn show_error(&self, unit: &SyncUnit) {
        if let Some(message) = unit.error_message() {
            warn!(%message, "sync unit failed");
        }
    }
}

impl<T: SyncDelegate + ?Sized> SyncDelegate for Arc<T> {
    fn should_sync_unit(&self, unit: &SyncUnit) -> bool {
        (**self).should_sync_unit(unit)
    }

    fn should_refresh_credential(&self) -> bool {
        (**self).should_refresh_credential()
    }

    fn start_refresh_credential(&self, refresh: RefreshHandle) {
        (**self).start_refresh_credential(refresh)
    }

    fn show_error(&self, unit: &SyncUnit) {
        (**self).show_error(unit)
    }
}

#[derive(Default)]
struct Shared {
    fetch_queue: Vec<Fetch>,
    upload_queue: Vec<Upload>,
    stopped: bool,
    worker_running: bool,
    refresh_active: bool,
}

pub(crate) struct ManagerInner {
    shared: Mutex<Shared>,
    cond: Condvar,
    listeners: Mutex<Vec<Arc<dyn SyncListener>>>,
    delegate: Box<dyn SyncDelegate>,
    delivery: Arc<dyn DeliveryContext>,
    serial: SerialExecutor,
    uses_credential: AtomicBool,
    config: ManagerConfig,
    me: Weak<ManagerInner>,
}

/// Orchestrates fetch and upload units against a backend.
///
/// Cheap to clone; all clones drive the same queues. The manager owns one
/// worker thread for scheduling, a serialized channel for prepare/save/revert
/// side effects, and at most one credential refresh coordinator at a time.
/// Call [`stop`](Self::stop) to tear it down.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    /// Creates a manager with synchronous completion delivery.
    pub fn new(config: ManagerConfig, delegate: impl SyncDelegate + 'static) -> Self {
        Self::with_delivery(config, delegate, Arc::new(InlineDelivery))
    }

    /// Creates a manager delivering completions through `delivery`, so
    /// listener code with thread-affine state runs where the caller wants it.
    pub fn with_delivery(
        config: ManagerConfig,
        delegate: impl SyncDelegate + 'static,
        delivery: Arc<dyn DeliveryContext>,
    ) -> Self {
        let uses_credential = config.uses_credential;
        Self {
            inner: Arc::new_cyclic(|me| ManagerInner {
                shared: Mutex::new(Shared::default()),
                cond: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                delegate: Box::new(delegate),
                delivery,
                serial: SerialExecutor::new("syncline-serial"),
                uses_credential: AtomicBool::new(uses_credential),
                config,
                me: me.clone(),
            }),
        }
    }

    /// Queues a fetch. It starts as soon as possible, but only once no
    /// uploads are queued. A fetch equivalent to one already queued (per
    /// [`FetchTask::will_fetch_same_data`](crate::FetchTask::will_fetch_same_data))
    /// is dropped silently; group members are exempt from this coalescing.
    pub fn submit_fetch(&self, fetch: Fetch) {
        self.inner.submit_fetch(fetch);
    }

    /// Queues an upload. Its prepare side effect runs on the serialized
    /// channel before it becomes eligible, and every queued fetch it does not
    /// exempt is flagged for restart.
    pub fn submit_upload(&self, upload: Upload) {
        self.inner.submit_upload(upload);
    }

    /// Registers a listener for all unit completions. Registering the same
    /// listener twice is a no-op.
    pub fn register_listener(&self, listener: Arc<dyn SyncListener>) {
        self.inner.register_listener(listener);
    }

    /// Removes a previously registered listener.
    pub fn unregister_listener(&self, listener: &Arc<dyn SyncListener>) {
        self.inner.unregister_listener(listener);
    }

    /// Enables or disables credential handling at runtime. With it disabled
    /// the manager never consults the refresh hooks.
    pub fn set_uses_credential(&self, uses_credential: bool) {
        self.inner
            .uses_credential
            .store(uses_credential, Ordering::SeqCst);
    }

    /// Clears both queues without notification and stops the worker. Units
    /// already in flight deliver an aborted notification when they finish,
    /// never a save or revert.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Number of fetches currently queued.
    pub fn pending_fetches(&self) -> usize {
        self.inner.shared.lock().fetch_queue.len()
    }

    /// Number of uploads currently queued.
    pub fn pending_uploads(&self) -> usize {
        self.inner.shared.lock().upload_queue.len()
    }
}

impl ManagerInner {
    fn arc(&self) -> Arc<ManagerInner> {
        self.me.upgrade().expect("manager inner still alive")
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn SyncListener>> {
        self.listeners.lock().clone()
    }

    fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    fn uses_credential(&self) -> bool {
        self.uses_credential.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_config(&self) -> &RefreshConfig {
        &self.config.refresh
    }

    pub(crate) fn delegate(&self) -> &dyn SyncDelegate {
        self.delegate.as_ref()
    }

    pub(crate) fn register_listener(&self, listener: Arc<dyn SyncListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &listener))
        {
            listeners.push(listener);
        }
    }

    pub(crate) fn unregister_listener(&self, listener: &Arc<dyn SyncListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub(crate) fn submit_fetch(&self, fetch: Fetch) {
        let mut shared = self.shared.lock();
        debug!("new fetch submitted");
        if !fetch.is_group_member() {
            let duplicate = shared
                .fetch_queue
                .iter()
                .any(|existing| existing.will_fetch_same_data(&fetch));
            if duplicate {
                debug!("equivalent fetch already queued, dropping submission");
                return;
            }
        }
        fetch.bind(self.me.clone(), Arc::clone(&self.delivery));
        shared.fetch_queue.push(fetch);
        self.start_worker_locked(&mut shared);
    }

    pub(crate) fn submit_upload(&self, upload: Upload) {
        {
            let shared = self.shared.lock();
            debug!("new upload submitted");
            upload.bind(self.me.clone(), Arc::clone(&self.delivery));
            // Started fetches may be reading state this upload invalidates.
            for fetch in &shared.fetch_queue {
                if upload.should_reset_fetch(fetch) {
                    fetch.mark_should_reset();
                }
            }
            // Outstanding edits of the same kind move the rollback baseline.
            for queued in &shared.upload_queue {
                upload.update_revert_values(queued, true);
            }
        }

        let manager = self.arc();
        self.serial.execute(move || {
            upload.run_prepare();
            let mut shared = manager.shared.lock();
            shared.upload_queue.push(upload);
            manager.start_worker_locked(&mut shared);
        });
    }

    pub(crate) fn stop(&self) {
        let mut shared = self.shared.lock();
        debug!("sync stopped, clearing queues");
        shared.stopped = true;
        shared.fetch_queue.clear();
        shared.upload_queue.clear();
        self.cond.notify_all();
    }

    fn start_worker(&self) {
        let mut shared = self.shared.lock();
        self.start_worker_locked(&mut shared);
    }

    fn start_worker_locked(&self, shared: &mut Shared) {
        shared.stopped = false;
        if !shared.worker_running {
            shared.worker_running = true;
            let inner = self.arc();
            thread::Builder::new()
                .name("syncline-worker".into())
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn sync worker thread");
        }
        self.cond.notify_all();
    }

    fn remove_unit(&self, unit: &SyncUnit) {
        let mut shared = self.shared.lock();
        match unit {
            SyncUnit::Fetch(fetch) => shared.fetch_queue.retain(|queued| queued != fetch),
            SyncUnit::Upload(upload) => shared.upload_queue.retain(|queued| queued != upload),
        }
    }

    fn deliver_aborted(&self, unit: SyncUnit) {
        let manager = self.arc();
        self.delivery
            .deliver(Box::new(move || manager.fan_out_aborted(&unit)));
    }

    fn fan_out_aborted(&self, unit: &SyncUnit) {
        for listener in self.listeners_snapshot() {
            listener.on_sync_aborted(unit);
        }
        if let Some(listener) = unit.listener() {
            listener.on_sync_aborted(unit);
        }
    }

    fn fan_out_fetch(&self, fetch: &Fetch) {
        for listener in self.listeners_snapshot() {
            listener.on_fetch_done(fetch);
        }
        if let Some(listener) = fetch.listener() {
            listener.on_fetch_done(fetch);
        }
    }

    fn fan_out_upload(&self, upload: &Upload) {
        for listener in self.listeners_snapshot() {
            listener.on_upload_done(upload);
        }
        if let Some(listener) = upload.listener() {
            listener.on_upload_done(upload);
        }
    }

    /// Completion entry for fetches, invoked through the delivery context.
    pub(crate) fn on_fetch_done(&self, fetch: &Fetch) {
        if self.is_stopped() {
            self.fan_out_aborted(&SyncUnit::Fetch(fetch.clone()));
            return;
        }

        debug!(failed = fetch.is_failed(), "fetch completed");
        if fetch.is_failed() {
            if fetch.retries_remaining() > 0 {
                debug!(
                    retries_left = fetch.retries_remaining() - 1,
                    "fetch failed, resetting for retry"
                );
                fetch.reset();
                fetch.decrement_retries();
                self.start_worker();
                return;
            }
            {
                let mut shared = self.shared.lock();
                shared.fetch_queue.retain(|queued| queued != fetch);
            }
            self.delegate.show_error(&SyncUnit::Fetch(fetch.clone()));
            self.fan_out_fetch(fetch);
            return;
        }

        enum Outcome {
            Save,
            GroupRestart,
            Reset,
        }

        let outcome = {
            let mut shared = self.shared.lock();
            if !fetch.should_reset() {
                shared.fetch_queue.retain(|queued| queued != fetch);
                Outcome::Save
            } else if fetch.is_group_member() {
                shared.fetch_queue.retain(|queued| queued != fetch);
                Outcome::GroupRestart
            } else {
                Outcome::Reset
            }
        };

        match outcome {
            Outcome::Save => {
                let manager = self.arc();
                let fetch = fetch.clone();
                self.serial.execute(move || {
                    // Group members are saved by their group.
                    if !fetch.is_group_member() {
                        fetch.run_save();
                    }
                    let inner = Arc::clone(&manager);
                    let fetch = fetch.clone();
                    manager
                        .delivery
                        .deliver(Box::new(move || inner.fan_out_fetch(&fetch)));
                });
            }
            Outcome::GroupRestart => {
                debug!("conflicting upload landed, group member removed for group-driven restart");
                if let Some(listener) = fetch.listener() {
                    listener.on_fetch_done(fetch);
                }
            }
            Outcome::Reset => {
                debug!("conflicting upload landed, resetting fetch for restart");
                fetch.reset();
                self.start_worker();
            }
        }
    }

    /// Completion entry for uploads, invoked through the delivery context.
    pub(crate) fn on_upload_done(&self, upload: &Upload) {
        if self.is_stopped() {
            self.fan_out_aborted(&SyncUnit::Upload(upload.clone()));
            return;
        }

        debug!(failed = upload.is_failed(), "upload completed");
        let conflicted = {
            let mut shared = self.shared.lock();
            shared.upload_queue.retain(|queued| queued != upload);
            // Reverting while a conflicting upload is queued would overwrite
            // that upload's prepared state.
            upload.is_failed()
                && shared
                    .upload_queue
                    .iter()
                    .any(|queued| queued.has_conflict(upload))
        };

        if upload.is_failed() {
            self.delegate.show_error(&SyncUnit::Upload(upload.clone()));
        }

        let manager = self.arc();
        let upload_for_serial = upload.clone();
        self.serial.execute(move || {
            if upload_for_serial.is_failed() {
                if conflicted {
                    debug!("upload failed with a conflicting upload pending, skipping revert");
                } else {
                    debug!("upload failed, reverting local effects");
                    upload_for_serial.run_revert();
                }
            } else {
                {
                    // This value is now authoritative for same-kind rollbacks.
                    let shared = manager.shared.lock();
                    for queued in &shared.upload_queue {
                        queued.update_revert_values(&upload_for_serial, false);
                    }
                }
                upload_for_serial.run_save();
            }
            let inner = Arc::clone(&manager);
            let upload = upload_for_serial.clone();
            manager
                .delivery
                .deliver(Box::new(move || inner.fan_out_upload(&upload)));
        });

        self.start_worker();
    }

    /// Called by the refresh coordinator when it terminates. A permanent
    /// failure carries the error to attach to every queued unit that needs a
    /// credential.
    pub(crate) fn refresh_finished(&self, error: Option<ErrorValue>) {
        let to_fail: Vec<SyncUnit> = {
            let mut shared = self.shared.lock();
            shared.refresh_active = false;
            if error.is_some() {
                let mut units: Vec<SyncUnit> = Vec::new();
                units.extend(shared.upload_queue.iter().cloned().map(SyncUnit::Upload));
                units.extend(shared.fetch_queue.iter().cloned().map(SyncUnit::Fetch));
                units.retain(|unit| unit.needs_credential());
                units
            } else {
                Vec::new()
            }
        };

        if let Some(error) = error {
            warn!(
                count = to_fail.len(),
                "credential refresh failed, failing queued units that need one"
            );
            for unit in &to_fail {
                unit.set_error(Arc::clone(&error));
            }
        }

        let _shared = self.shared.lock();
        self.cond.notify_all();
    }
}

fn next_unstarted(shared: &Shared) -> Option<SyncUnit> {
    for upload in &shared.upload_queue {
        if !upload.is_started() {
            return Some(SyncUnit::Upload(upload.clone()));
        }
    }
    // Fetches only run while no upload is queued, started or not.
    if shared.upload_queue.is_empty() {
        for fetch in &shared.fetch_queue {
            if !fetch.is_started() {
                return Some(SyncUnit::Fetch(fetch.clone()));
            }
        }
    }
    None
}

fn worker_loop(inner: Arc<ManagerInner>) {
    debug!("sync worker running");
    loop {
        let candidate = {
            let mut shared = inner.shared.lock();
            if shared.stopped {
                shared.worker_running = false;
                break;
            }
            match next_unstarted(&shared) {
                Some(unit) => unit,
                None => {
                    inner.cond.wait(&mut shared);
                    continue;
                }
            }
        };

        if !inner.delegate.should_sync_unit(&candidate) {
            debug!("policy gate rejected unit, removing without side effects");
            inner.remove_unit(&candidate);
            inner.deliver_aborted(candidate);
            continue;
        }

        if inner.uses_credential()
            && candidate.needs_credential()
            && inner.delegate.should_refresh_credential()
        {
            let mut shared = inner.shared.lock();
            if shared.stopped {
                shared.worker_running = false;
                break;
            }
            if !shared.refresh_active {
                shared.refresh_active = true;
                refresh::spawn(inner.arc());
            } else {
                debug!("credential refresh already in flight");
            }
            // Woken when the refresh resolves, then the unit is re-evaluated.
            inner.cond.wait(&mut shared);
            continue;
        }

        debug!("starting sync unit");
        candidate.start();

        let mut shared = inner.shared.lock();
        if !shared.stopped && next_unstarted(&shared).is_none() {
            inner.cond.wait(&mut shared);
        }
    }
    debug!("sync worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_value, SyncError};
    use crate::fetch::{FetchSlot, FetchTask};
    use crate::upload::UploadTask;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for {what}");
    }

    struct OpenDelegate;

    impl SyncDelegate for OpenDelegate {
        fn should_sync_unit(&self, _unit: &SyncUnit) -> bool {
            true
        }
        fn should_refresh_credential(&self) -> bool {
            false
        }
        fn start_refresh_credential(&self, _refresh: RefreshHandle) {}
    }

    struct ClosedDelegate;

    impl SyncDelegate for ClosedDelegate {
        fn should_sync_unit(&self, _unit: &SyncUnit) -> bool {
            false
        }
        fn should_refresh_credential(&self) -> bool {
            false
        }
        fn start_refresh_credential(&self, _refresh: RefreshHandle) {}
    }

    #[derive(Default)]
    struct Events {
        fetch_done: AtomicUsize,
        fetch_failed: AtomicUsize,
        upload_done: AtomicUsize,
        aborted: AtomicUsize,
    }

    struct CountingListener {
        events: Arc<Events>,
    }

    impl SyncListener for CountingListener {
        fn on_fetch_done(&self, fetch: &Fetch) {
            if fetch.is_failed() {
                self.events.fetch_failed.fetch_add(1, Ordering::SeqCst);
            }
            self.events.fetch_done.fetch_add(1, Ordering::SeqCst);
        }
        fn on_upload_done(&self, _upload: &Upload) {
            self.events.upload_done.fetch_add(1, Ordering::SeqCst);
        }
        fn on_sync_aborted(&self, _unit: &SyncUnit) {
            self.events.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager_with_events(
        delegate: impl SyncDelegate + 'static,
    ) -> (SyncManager, Arc<Events>) {
        let manager = SyncManager::new(ManagerConfig::new(), delegate);
        let events = Arc::new(Events::default());
        manager.register_listener(Arc::new(CountingListener {
            events: Arc::clone(&events),
        }));
        (manager, events)
    }

    /// Completes synchronously inside on_start after `fail_times` failures.
    struct InstantFetch {
        slot: FetchSlot<&'static str>,
        starts: AtomicUsize,
        resets: AtomicUsize,
        saves: AtomicUsize,
        fail_times: AtomicUsize,
    }

    impl InstantFetch {
        fn new(fail_times: usize) -> Self {
            Self {
                slot: FetchSlot::new(),
                starts: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                saves: AtomicUsize::new(0),
                fail_times: AtomicUsize::new(fail_times),
            }
        }
    }

    impl FetchTask for InstantFetch {
        fn on_start(&self, fetch: &Fetch) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_times
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                fetch.set_error(error_value(SyncError::Backend("503".into())));
            } else {
                self.slot.set(fetch, "data");
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
    }

    /// Never completes on its own; tests drive it through the handle.
    struct StalledFetch {
        starts: AtomicUsize,
        saves: AtomicUsize,
        done: AtomicBool,
        same_data: bool,
    }

    impl StalledFetch {
        fn new(same_data: bool) -> Self {
            Self {
                starts: AtomicUsize::new(0),
                saves: AtomicUsize::new(0),
                done: AtomicBool::new(false),
                same_data,
            }
        }
    }

    impl FetchTask for StalledFetch {
        fn on_start(&self, _fetch: &Fetch) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_reset(&self) {
            self.done.store(false, Ordering::SeqCst);
        }
        fn is_done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }
        fn on_save(&self) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        fn will_fetch_same_data(&self, other: &Fetch) -> bool {
            self.same_data && other.task::<StalledFetch>().is_some_and(|t| t.same_data)
        }
    }

    struct StalledUpload;

    impl UploadTask for StalledUpload {
        fn on_start(&self, _upload: &Upload) {}
    }

    #[test]
    fn fetch_completes_saves_and_notifies() {
        let (manager, events) = manager_with_events(OpenDelegate);
        let fetch = Fetch::new(InstantFetch::new(0));
        manager.submit_fetch(fetch.clone());

        wait_until("fetch completion", || {
            events.fetch_done.load(Ordering::SeqCst) == 1
        });
        let task = fetch.task::<InstantFetch>().unwrap();
        assert_eq!(task.saves.load(Ordering::SeqCst), 1);
        assert_eq!(events.fetch_failed.load(Ordering::SeqCst), 0);
        assert_eq!(manager.pending_fetches(), 0);
        manager.stop();
    }

    #[test]
    fn failed_fetch_retries_before_surfacing() {
        let (manager, events) = manager_with_events(OpenDelegate);
        let fetch = Fetch::new(InstantFetch::new(usize::MAX)).with_retries(2);
        manager.submit_fetch(fetch.clone());

        wait_until("fetch failure", || {
            events.fetch_failed.load(Ordering::SeqCst) == 1
        });
        let task = fetch.task::<InstantFetch>().unwrap();
        assert_eq!(task.starts.load(Ordering::SeqCst), 3);
        assert_eq!(task.resets.load(Ordering::SeqCst), 2);
        assert_eq!(events.fetch_done.load(Ordering::SeqCst), 1);
        assert_eq!(task.saves.load(Ordering::SeqCst), 0);
        manager.stop();
    }

    #[test]
    fn equivalent_fetch_is_dropped() {
        let (manager, _events) = manager_with_events(OpenDelegate);
        let first = Fetch::new(StalledFetch::new(true));
        let second = Fetch::new(StalledFetch::new(true));
        manager.submit_fetch(first.clone());
        manager.submit_fetch(second.clone());

        wait_until("first fetch start", || {
            first.task::<StalledFetch>().unwrap().starts.load(Ordering::SeqCst) == 1
        });
        assert_eq!(manager.pending_fetches(), 1);
        assert_eq!(
            second.task::<StalledFetch>().unwrap().starts.load(Ordering::SeqCst),
            0
        );
        manager.stop();
    }

    #[test]
    fn fetches_wait_for_queued_uploads() {
        let (manager, events) = manager_with_events(OpenDelegate);
        let upload = Upload::new(StalledUpload);
        let fetch = Fetch::new(StalledFetch::new(false));

        manager.submit_upload(upload.clone());
        wait_until("upload queued", || manager.pending_uploads() == 1);
        manager.submit_fetch(fetch.clone());

        // The fetch must not start while the upload queue is non-empty.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            fetch.task::<StalledFetch>().unwrap().starts.load(Ordering::SeqCst),
            0
        );

        upload.upload_successful();
        wait_until("upload completion", || {
            events.upload_done.load(Ordering::SeqCst) == 1
        });
        wait_until("fetch start", || {
            fetch.task::<StalledFetch>().unwrap().starts.load(Ordering::SeqCst) == 1
        });
        manager.stop();
    }

    #[test]
    fn rejected_unit_is_aborted_without_side_effects() {
        let (manager, events) = manager_with_events(ClosedDelegate);
        let fetch = Fetch::new(InstantFetch::new(0));
        manager.submit_fetch(fetch.clone());

        wait_until("abort notification", || {
            events.aborted.load(Ordering::SeqCst) == 1
        });
        let task = fetch.task::<InstantFetch>().unwrap();
        assert_eq!(task.starts.load(Ordering::SeqCst), 0);
        assert_eq!(task.saves.load(Ordering::SeqCst), 0);
        assert_eq!(manager.pending_fetches(), 0);
        manager.stop();
    }

    #[test]
    fn completion_after_stop_is_aborted() {
        let (manager, events) = manager_with_events(OpenDelegate);
        let fetch = Fetch::new(StalledFetch::new(false));
        manager.submit_fetch(fetch.clone());

        wait_until("fetch start", || {
            fetch.task::<StalledFetch>().unwrap().starts.load(Ordering::SeqCst) == 1
        });
        manager.stop();

        let task = fetch.task::<StalledFetch>().unwrap();
        task.done.store(true, Ordering::SeqCst);
        fetch.check_if_done();

        wait_until("abort notification", || {
            events.aborted.load(Ordering::SeqCst) == 1
        });
        assert_eq!(task.saves.load(Ordering::SeqCst), 0);
        assert_eq!(events.fetch_done.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_registration_is_idempotent() {
        let manager = SyncManager::new(ManagerConfig::new(), OpenDelegate);
        let events = Arc::new(Events::default());
        let listener: Arc<dyn SyncListener> = Arc::new(CountingListener {
            events: Arc::clone(&events),
        });
        manager.register_listener(Arc::clone(&listener));
        manager.register_listener(Arc::clone(&listener));

        let fetch = Fetch::new(InstantFetch::new(0));
        manager.submit_fetch(fetch);
        wait_until("fetch completion", || {
            events.fetch_done.load(Ordering::SeqCst) >= 1
        });
        assert_eq!(events.fetch_done.load(Ordering::SeqCst), 1);

        manager.unregister_listener(&listener);
        let fetch = Fetch::new(InstantFetch::new(0));
        manager.submit_fetch(fetch);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(events.fetch_done.load(Ordering::SeqCst), 1);
        manager.stop();
    }
}
