mod article;
mod cluster;
pub mod core;
mod lease;
mod merged;
mod repository;
mod schema;

pub use self::core::{Database, DbLockErrorExt};
pub use lease::SqliteMergeCache;
