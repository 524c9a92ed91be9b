//! Resolver lockfile
//!
//! Pins impure external resolutions (image tags, git refs, URLs) to the
//! digests they resolved to, so repeat runs replay the same inputs without
//! touching the network.
//!
//! # Format
//!
//! Newline-delimited JSON, sorted, rewritten atomically on every change.
//! Safe to commit and review as a plain diff. See [`format`].

pub mod entry;
pub mod format;
pub mod resolver;
pub mod store;

pub use entry::{LockfileEntry, Primitive, ResolverCall, CONTAINER_FROM, CORE_MODULE, HTTP_GET};
pub use resolver::{LiveResolver, StaticResolver};
pub use store::{ConflictPolicy, Lockfile, RecordOutcome, Resolution};
