//! CLI command implementations

pub mod cache;
pub mod config;
pub mod digest;
pub mod lock;

pub use cache::execute as cache;
pub use config::execute as config;
pub use digest::execute as digest;
pub use lock::execute as lock;
