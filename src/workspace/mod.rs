//! Confined, content-addressed workspace access
//!
//! Host files reach a computation only as digested handles produced by a
//! [`WorkspaceRoot`]. The digest of a selection depends on the selected
//! names and bytes alone, which makes handles safe to use as cache keys.

pub mod digest;
pub mod guard;
pub mod selector;

pub use digest::{digest_bytes, ContentDigest};
pub use guard::{DirectoryHandle, FileHandle, WorkspaceRoot};
pub use selector::{PathSelector, SelectorMatcher};
