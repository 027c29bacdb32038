pub mod assignment;
pub mod store;
pub mod types;

pub use assignment::{Assignment, AssignmentOutcome, Clusterer};
pub use store::ClusterStore;
pub use types::*;

/// Default age limit for clusters that may still receive new members.
pub const DEFAULT_CLUSTER_WINDOW_HOURS: i64 = 72;
