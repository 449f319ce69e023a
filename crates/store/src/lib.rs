// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared key/value substrate for bazaar tabs.
//!
//! Every tab of the same origin reads and writes one [`PersistentKv`]. Writes
//! are announced to every *other* context through a [`ChangeFeed`]; the writer
//! never observes its own change. [`ExpiringStorage`] layers a
//! `(value, expiry, timestamp)` envelope on top and purges stale entries.

pub mod clock;
pub mod expiring;
pub mod file;
pub mod kv;
pub mod memory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use expiring::{spawn_sweeper, ExpiringEntry, ExpiringStorage, ENVELOPE_NAMESPACE};
pub use file::FileKv;
pub use kv::{ChangeFeed, ContextId, PersistentKv, StorageChange};
pub use memory::MemoryKv;
