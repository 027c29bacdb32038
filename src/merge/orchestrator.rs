use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::cache::{Lease, LeaseGuard, MergeCache, TryBegin};
use super::merged::MergedArticle;
use super::output::MergeOutput;
use super::prompt::{corrective_note, merge_request};
use crate::clustering::{Cluster, ClusterId, ClusterStore};
use crate::config::RetryPolicy;
use crate::error::{MergeError, MergeValidationError, ProviderError};
use crate::llm::MergeProvider;
use crate::repository::Repository;
use crate::{TARGET_LLM_REQUEST, TARGET_PIPELINE};

/// Result of one dedup-guarded merge attempt for a cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// A new merged article was generated and committed.
    Merged(MergedArticle),
    /// This revision had already been merged; the stored result was reused.
    Cached(MergedArticle),
    /// Another task holds the lease for this revision.
    InProgress,
    /// Nothing to do: the cluster is unknown, empty or already merged.
    Skipped,
    Failed(MergeError),
}

/// Steps of the bounded retry loop around the provider call.
#[derive(Debug)]
enum MergeState {
    Attempting {
        attempt: u32,
    },
    Retry {
        attempt: u32,
        last: ProviderError,
    },
    Repair {
        attempt: u32,
        error: MergeValidationError,
        output: Option<MergeOutput>,
    },
    Succeeded(MergeOutput),
    Failed(MergeError),
}

/// Drives the model merge of a cluster under a [`MergeCache`] lease and
/// commits the result.
pub struct MergeOrchestrator {
    store: Arc<ClusterStore>,
    cache: Arc<dyn MergeCache>,
    provider: Arc<dyn MergeProvider>,
    repository: Arc<dyn Repository>,
    policy: RetryPolicy,
    max_member_chars: usize,
}

impl MergeOrchestrator {
    pub fn new(
        store: Arc<ClusterStore>,
        cache: Arc<dyn MergeCache>,
        provider: Arc<dyn MergeProvider>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            store,
            cache,
            provider,
            repository,
            policy: RetryPolicy::default(),
            max_member_chars: 1500,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_member_chars(mut self, max_member_chars: usize) -> Self {
        self.max_member_chars = max_member_chars;
        self
    }

    pub fn cache(&self) -> &Arc<dyn MergeCache> {
        &self.cache
    }

    /// Merges the current revision of `cluster_id` unless it is already merged,
    /// cached or being merged elsewhere.
    #[instrument(target = "pipeline", level = "debug", skip(self))]
    pub async fn process(&self, cluster_id: ClusterId) -> MergeOutcome {
        let Some(cluster) = self.store.get(&cluster_id).await else {
            return MergeOutcome::Skipped;
        };
        if !cluster.needs_merge() {
            return MergeOutcome::Skipped;
        }

        let lease = match self.cache.try_begin(cluster.id, cluster.revision).await {
            Ok(TryBegin::Acquired(lease)) => lease,
            Ok(TryBegin::InProgress) => {
                debug!(target: TARGET_PIPELINE, "Cluster {} revision {} is being merged elsewhere", cluster.id, cluster.revision);
                return MergeOutcome::InProgress;
            }
            Ok(TryBegin::AlreadyDone(merged)) => {
                if let Err(e) = self.commit_cached(&merged).await {
                    warn!(target: TARGET_PIPELINE, "Could not re-apply cached merge of cluster {}: {}", cluster.id, e);
                }
                return MergeOutcome::Cached(merged);
            }
            Err(e) => return MergeOutcome::Failed(e.into()),
        };

        let guard = LeaseGuard::new(self.cache.clone(), lease);
        let result = self.merge(&cluster, guard.lease()).await;
        let lease = guard.disarm();

        let committed = match result {
            Ok(merged) => self.commit(&lease, &merged).await.map(|_| merged),
            Err(e) => Err(e),
        };

        match committed {
            Ok(merged) => {
                info!(
                    target: TARGET_PIPELINE,
                    "Merged cluster {} revision {} ({} sources): {}",
                    merged.cluster_id,
                    merged.revision,
                    merged.source_urls.len(),
                    merged.headline
                );
                MergeOutcome::Merged(merged)
            }
            Err(e) => {
                error!(target: TARGET_PIPELINE, "Merge of cluster {} revision {} failed: {}", cluster.id, cluster.revision, e);
                if let Err(abort_error) = self.cache.abort(&lease).await {
                    debug!(target: TARGET_PIPELINE, "Lease already released: {}", abort_error);
                }
                MergeOutcome::Failed(e)
            }
        }
    }

    /// Generates a validated merged article for `cluster` under `lease`.
    ///
    /// Transient provider errors are retried with backoff up to the attempt
    /// cap. A response that fails validation gets one repair: truncation when
    /// only the headline or subheadline is too long, otherwise a second call
    /// with a corrective note.
    pub async fn merge(&self, cluster: &Cluster, lease: &Lease) -> Result<MergedArticle, MergeError> {
        if cluster.members.is_empty() {
            return Err(MergeError::EmptyCluster(cluster.id));
        }
        if lease.cluster_id != cluster.id || lease.revision != cluster.revision {
            return Err(crate::error::CacheError::LeaseLost {
                cluster_id: cluster.id,
                revision: cluster.revision,
            }
            .into());
        }

        let mut correction: Option<String> = None;
        let mut repaired = false;
        let mut state = MergeState::Attempting { attempt: 1 };

        loop {
            state = match state {
                MergeState::Attempting { attempt } => {
                    let request = merge_request(cluster, self.max_member_chars, correction.as_deref());
                    debug!(target: TARGET_LLM_REQUEST, "Merge attempt {} for cluster {}", attempt, cluster.id);
                    match self.provider.complete(&request).await {
                        Ok(text) => match MergeOutput::parse(&text) {
                            Ok(output) => match output.validate() {
                                Ok(()) => MergeState::Succeeded(output),
                                Err(error) => MergeState::Repair {
                                    attempt,
                                    error,
                                    output: Some(output),
                                },
                            },
                            Err(error) => MergeState::Repair {
                                attempt,
                                error,
                                output: None,
                            },
                        },
                        Err(ProviderError::Transient(message)) => MergeState::Retry {
                            attempt,
                            last: ProviderError::Transient(message),
                        },
                        Err(permanent) => {
                            MergeState::Failed(MergeError::PermanentProvider(permanent))
                        }
                    }
                }
                MergeState::Retry { attempt, last } => {
                    if attempt >= self.policy.max_attempts {
                        MergeState::Failed(MergeError::TransientProvider {
                            attempts: attempt,
                            last,
                        })
                    } else {
                        let delay = self.retry_delay(attempt);
                        warn!(
                            target: TARGET_LLM_REQUEST,
                            "Attempt {}/{} for cluster {} failed ({}), retrying in {:?}",
                            attempt,
                            self.policy.max_attempts,
                            cluster.id,
                            last,
                            delay
                        );
                        sleep(delay).await;
                        MergeState::Attempting {
                            attempt: attempt + 1,
                        }
                    }
                }
                MergeState::Repair {
                    attempt,
                    error,
                    output,
                } => {
                    if repaired {
                        MergeState::Failed(MergeError::Validation(error))
                    } else {
                        repaired = true;
                        match output.as_ref().and_then(MergeOutput::truncated) {
                            Some(fixed) => {
                                debug!(target: TARGET_PIPELINE, "Truncated over-long fields for cluster {}", cluster.id);
                                MergeState::Succeeded(fixed)
                            }
                            None => {
                                warn!(target: TARGET_PIPELINE, "Cluster {}: {}; asking again", cluster.id, error);
                                correction = Some(corrective_note(&error));
                                MergeState::Attempting { attempt }
                            }
                        }
                    }
                }
                MergeState::Succeeded(output) => {
                    return Ok(MergedArticle::from_output(cluster, output));
                }
                MergeState::Failed(error) => return Err(error),
            };
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.policy.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.policy.backoff(attempt) + Duration::from_millis(jitter)
    }

    /// Publishes a fresh result: caches it under the lease, stores it, then
    /// marks the cluster merged at that revision.
    async fn commit(&self, lease: &Lease, merged: &MergedArticle) -> Result<(), MergeError> {
        self.cache.complete(lease, merged).await?;
        self.persist(merged).await?;
        if let Err(e) = self
            .cache
            .evict_superseded(merged.cluster_id, merged.revision)
            .await
        {
            warn!(target: TARGET_PIPELINE, "Failed to evict superseded cache entries: {}", e);
        }
        Ok(())
    }

    /// Re-applies a result that is already cached. Idempotent, so it also
    /// repairs a commit that was interrupted after caching.
    async fn commit_cached(&self, merged: &MergedArticle) -> Result<(), MergeError> {
        self.persist(merged).await
    }

    async fn persist(&self, merged: &MergedArticle) -> Result<(), MergeError> {
        self.repository
            .save_merged(merged)
            .await
            .map_err(|e| MergeError::Persistence(format!("{:#}", e)))?;

        if let Some(cluster) = self
            .store
            .mark_merged(&merged.cluster_id, merged.revision)
            .await
        {
            self.repository
                .save_cluster(&cluster)
                .await
                .map_err(|e| MergeError::Persistence(format!("{:#}", e)))?;
        }
        Ok(())
    }
}
