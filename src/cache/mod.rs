//! Cache entries, their storage, and garbage collection
//!
//! # Entry Lifecycle
//!
//! | State | Acquirable | Evictable | Description |
//! |-------|------------|-----------|-------------|
//! | Active | yes | no | At least one live session holds a lease |
//! | Settling | yes | prune only | Released within the settle delay |
//! | Inactive | yes | yes | No holders |
//! | Evicting | no | - | Claimed by prune or GC, object being removed |
//!
//! Automatic GC only runs when usage exceeds the keep-bytes budget and
//! evicts least-recently-used entries first.

pub mod entry;
pub mod gc;
pub mod set;
pub mod size;
pub mod store;

pub use entry::{CacheEntry, EntryId};
pub use gc::{GcHandle, GcManager, GcPolicy, GcReport, PruneReport, Skipped};
pub use set::{CacheEntrySet, EntryLease, SkipReason};
pub use size::{format_bytes, CacheSizeStatus, KeepBytes};
pub use store::{DirObjectStore, ObjectStore};
