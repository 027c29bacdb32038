use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::store::ClusterStore;
use super::types::Cluster;
use crate::article::Article;
use crate::similarity::SimilarityEngine;
use crate::TARGET_CLUSTER;

/// How an article ended up in its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Created,
    Joined,
    /// The article's URL was already a member; nothing changed.
    AlreadyMember,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    /// Snapshot taken right after the assignment.
    pub cluster: Cluster,
    pub outcome: AssignmentOutcome,
}

/// Sequential single-link assignment of articles to clusters.
pub struct Clusterer {
    store: Arc<ClusterStore>,
    engine: SimilarityEngine,
    window: Duration,
}

impl Clusterer {
    /// # Arguments
    /// * `store` - Cluster store shared with the merge orchestrator
    /// * `engine` - Similarity predicate
    /// * `window` - Only clusters updated within this window are candidates
    pub fn new(store: Arc<ClusterStore>, engine: SimilarityEngine, window: Duration) -> Self {
        Self {
            store,
            engine,
            window,
        }
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    /// Places `article` in the first candidate cluster that holds a similar
    /// member, or opens a new cluster.
    ///
    /// Candidates are visited most recently touched first. Assigning an
    /// article that is already a member is a no-op that returns its cluster.
    #[instrument(target = "clustering", level = "debug", skip_all, fields(url = %article.canonical_url))]
    pub async fn assign(&self, article: Arc<Article>) -> Assignment {
        loop {
            if let Some(assignment) = self.existing_membership(&article).await {
                return assignment;
            }

            if let Some(assignment) = self.try_join(&article).await {
                return assignment;
            }

            match self.store.create(article.clone()) {
                Ok(cluster) => {
                    return Assignment {
                        cluster,
                        outcome: AssignmentOutcome::Created,
                    }
                }
                // Placed by a concurrent task between our scan and the insert.
                Err(_) => continue,
            }
        }
    }

    async fn existing_membership(&self, article: &Article) -> Option<Assignment> {
        let id = self.store.cluster_of(&article.canonical_url)?;
        let cluster = self.store.get(&id).await?;
        debug!(target: TARGET_CLUSTER, "{} already in cluster {}", article.canonical_url, id);
        Some(Assignment {
            cluster,
            outcome: AssignmentOutcome::AlreadyMember,
        })
    }

    async fn try_join(&self, article: &Arc<Article>) -> Option<Assignment> {
        let since = Utc::now() - self.window;

        for id in self.store.candidates(since) {
            let Some(handle) = self.store.handle(&id) else {
                continue;
            };

            // Members only ever grow, so a match against this copy still holds
            // once the lock is re-taken below.
            let members = handle.lock().await.members.clone();
            let matched = members
                .iter()
                .any(|member| self.engine.similar(article, member));
            if !matched {
                continue;
            }

            let mut cluster = handle.lock().await;
            // Evicted since the candidate scan.
            if !self.store.is_live(&id, &handle) {
                continue;
            }
            if let Err(owner) = self.store.claim(&article.canonical_url, id) {
                let snapshot = if owner == id {
                    cluster.clone()
                } else {
                    drop(cluster);
                    self.store.get(&owner).await?
                };
                return Some(Assignment {
                    cluster: snapshot,
                    outcome: AssignmentOutcome::AlreadyMember,
                });
            }

            cluster.add_member(article.clone(), self.store.next_touch());
            self.store.record_touch(&cluster);
            debug!(
                target: TARGET_CLUSTER,
                "{} joined cluster {} at revision {}",
                article.canonical_url,
                id,
                cluster.revision
            );
            return Some(Assignment {
                cluster: cluster.clone(),
                outcome: AssignmentOutcome::Joined,
            });
        }

        None
    }
}
