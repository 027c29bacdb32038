//! Dedup-guarded language-model merging of story clusters.

pub mod cache;
pub mod merged;
pub mod orchestrator;
pub mod output;
pub mod prompt;

pub use cache::{Lease, LeaseGuard, MemoryMergeCache, MergeCache, TryBegin};
pub use merged::MergedArticle;
pub use orchestrator::{MergeOrchestrator, MergeOutcome};
pub use output::{MergeOutput, Violation};
