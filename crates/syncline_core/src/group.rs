//! Composite fetches that fan out to child fetches.
//!
//! A fetch group is itself a fetch: it is queued, gated and reset like any
//! other. Starting it asks the caller's [`FetchGroupSpec`] to add child
//! fetches, which are submitted to the owning manager as group members. The
//! group completes when every child is done, fails when any child fails, and
//! drives the saves of all its children so cross-fetch coordination stays out
//! of the child implementations.

use crate::fetch::{Fetch, FetchInner, FetchTask};
use crate::unit::SyncListener;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Caller-supplied behavior of a fetch group.
pub trait FetchGroupSpec: Send + Sync + 'static {
    /// Adds the initial child fetches via [`FetchGroup::add`]. Adding none is
    /// a caller defect and the group start panics.
    fn on_add_fetches(&self, group: &FetchGroup);

    /// Runs after every child's save when the whole group succeeded.
    fn on_save_group(&self) {}

    /// Runs when the group is reset, after the child list is cleared.
    fn on_reset_group(&self) {}
}

/// The sealed task driving a group of child fetches.
///
/// Obtain one from a group fetch with `fetch.task::<FetchGroup>()` to add
/// more children after the initial batch.
pub struct FetchGroup {
    parent: Weak<FetchInner>,
    spec: Box<dyn FetchGroupSpec>,
    children: Mutex<Vec<Fetch>>,
}

impl FetchGroup {
    /// Creates a group fetch around the given spec.
    pub fn new_fetch(spec: impl FetchGroupSpec) -> Fetch {
        Fetch::new_cyclic(|parent| {
            Box::new(FetchGroup {
                parent,
                spec: Box::new(spec),
                children: Mutex::new(Vec::new()),
            })
        })
    }

    /// Adds a child fetch to the group and submits it to the owning manager.
    ///
    /// The group is not done until every added child is done. A failing child
    /// fails the whole group.
    pub fn add(&self, child: Fetch) {
        child.mark_group_member();
        child.set_listener(Arc::new(GroupChildListener {
            parent: self.parent.clone(),
        }));
        self.children.lock().push(child.clone());

        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        match Fetch::from_inner(parent).manager() {
            Some(manager) => manager.submit_fetch(child),
            None => debug!("group fetch is not submitted yet, child kept local"),
        }
    }

    /// Returns the number of children currently in the group.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    fn children(&self) -> Vec<Fetch> {
        self.children.lock().clone()
    }
}

impl FetchTask for FetchGroup {
    fn on_start(&self, _fetch: &Fetch) {
        self.spec.on_add_fetches(self);
        assert!(
            self.child_count() > 0,
            "can not start a fetch group with no fetches added"
        );
    }

    fn on_reset(&self) {
        self.children.lock().clear();
        self.spec.on_reset_group();
    }

    /// An empty group was just reset and is about to be restarted, so it is
    /// never done.
    fn is_done(&self) -> bool {
        let children = self.children();
        !children.is_empty() && children.iter().all(|child| child.is_done())
    }

    fn on_save(&self) {
        for child in self.children() {
            child.run_save();
        }
        self.spec.on_save_group();
    }
}

struct GroupChildListener {
    parent: Weak<FetchInner>,
}

impl SyncListener for GroupChildListener {
    fn on_fetch_done(&self, child: &Fetch) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        let group = Fetch::from_inner(parent);
        if child.is_failed() {
            group.core().set_failure(child.error(), child.error_message());
        }
        group.check_if_done();
    }
}
