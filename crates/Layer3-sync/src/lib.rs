//! # dashboard-sync
//!
//! Keeps realtime subscribers consistent with the task store.
//!
//! One loop polls the store and both supervisors on a fixed tick, diffs each
//! snapshot against the previous tick and pushes only what changed.

pub mod broadcaster;
pub mod message;

pub use broadcaster::SyncBroadcaster;
pub use message::{InitState, SyncMessage};
