//! # Syncline Core
//!
//! Client-side sync orchestration engine.
//!
//! This crate provides:
//! - Dual work queues (fetches and uploads) drained by a single worker
//! - Upload-over-fetch scheduling so reads never race writes
//! - Reset-on-conflict and revert-baseline tracking for concurrent edits
//! - Single-flight credential refresh with bounded linear backoff
//! - A shared unit lifecycle with exactly-once completion delivery
//!
//! ## Architecture
//!
//! Callers wrap their backend calls in [`FetchTask`] / [`UploadTask`]
//! implementations and submit them to a [`SyncManager`]. The manager
//! dispatches units from one worker thread; the units run their work on
//! their own threads and report back through their handle. Persistence,
//! transport, credential storage and error display stay on the caller's
//! side of the [`SyncDelegate`] and task traits.
//!
//! ## Key Invariants
//!
//! - No fetch starts while any upload is queued
//! - A unit's completion is delivered to listeners exactly once per lifecycle
//! - Prepare/save/revert side effects run serialized, in submission order
//! - At most one credential refresh is in flight at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dispatch;
mod error;
mod fetch;
mod group;
mod manager;
mod refresh;
mod unit;
mod upload;

pub use config::{ManagerConfig, RefreshConfig};
pub use dispatch::{DeliveryContext, InlineDelivery, Job, SerialExecutor};
pub use error::{error_value, ErrorValue, SyncError};
pub use fetch::{Fetch, FetchSlot, FetchTask};
pub use group::{FetchGroup, FetchGroupSpec};
pub use manager::{SyncDelegate, SyncManager};
pub use refresh::RefreshHandle;
pub use unit::{SyncListener, SyncUnit};
pub use upload::{Upload, UploadTask};
