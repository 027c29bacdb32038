//! Error taxonomy for the ingestion and merge pipeline.
//!
//! Per-article and per-cluster failures are values, not panics: the pipeline
//! counts them and moves on to the next record or cluster.

use std::fmt;
use thiserror::Error;

use crate::clustering::ClusterId;
use crate::merge::Violation;

/// Why a raw scrape record could not become an [`Article`](crate::Article).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    MissingUrl,
    InvalidUrl,
    MissingTitle,
    GenericTitle,
    MissingBody,
    DegenerateBody(usize),
    /// No catalogue brand or model and no motoring vocabulary.
    Irrelevant,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::MissingUrl => write!(f, "missing source URL"),
            MalformedReason::InvalidUrl => write!(f, "source URL does not parse"),
            MalformedReason::MissingTitle => write!(f, "missing or too short title"),
            MalformedReason::GenericTitle => write!(f, "generic title"),
            MalformedReason::MissingBody => write!(f, "missing body"),
            MalformedReason::DegenerateBody(len) => {
                write!(f, "body too short after cleanup ({} chars)", len)
            }
            MalformedReason::Irrelevant => write!(f, "not automotive news"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed source record ({url}): {reason}")]
    MalformedSourceRecord { url: String, reason: MalformedReason },
    /// The repository could not say whether the URL was seen before.
    #[error("failed to look up known article {url}: {message}")]
    Lookup { url: String, message: String },
}

/// Failure reported by a language-model provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeouts, 5xx responses, rate limiting and connection failures.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Bad requests, authentication failures, unknown models.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

/// Output was well-formed enough to inspect but broke the field constraints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("merged output failed validation: {}", describe_violations(.violations))]
pub struct MergeValidationError {
    pub violations: Vec<Violation>,
}

fn describe_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("lease for cluster {cluster_id} revision {revision} is no longer held")]
    LeaseLost { cluster_id: ClusterId, revision: u64 },
    #[error("merge cache backend failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("provider kept failing after {attempts} attempts: {last}")]
    TransientProvider { attempts: u32, last: ProviderError },
    #[error(transparent)]
    PermanentProvider(ProviderError),
    #[error(transparent)]
    Validation(#[from] MergeValidationError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("cluster {0} has no members")]
    EmptyCluster(ClusterId),
}
