//! Cairn - reproducible resolution and content-addressed caching
//!
//! Pins impure resolver lookups in a lockfile, digests confined workspace
//! content into cache keys, memoizes function calls on those keys, and
//! keeps the local cache within a disk budget.

pub mod audit;
pub mod cache;
pub mod call;
pub mod cli;
pub mod config;
pub mod error;
mod filelock;
pub mod lockfile;
pub mod session;
pub mod workspace;

pub use error::{CairnError, CairnResult};
