//! One run of the pipeline: normalize a scraped batch, cluster it, then merge
//! every cluster whose current revision has no merged article yet.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::article::{Article, Normalized, Normalizer, RawArticle};
use crate::clustering::{AssignmentOutcome, ClusterId, ClusterStore, Clusterer};
use crate::error::NormalizeError;
use crate::config::PipelineConfig;
use crate::llm::MergeProvider;
use crate::merge::{MergeCache, MergeOrchestrator, MergeOutcome};
use crate::repository::Repository;
use crate::similarity::SimilarityEngine;
use crate::TARGET_PIPELINE;

/// Counters for one `run_once` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub received: usize,
    pub normalized: usize,
    pub duplicates: usize,
    pub malformed: usize,
    /// Records skipped because the repository lookup failed.
    pub lookup_failures: usize,
    pub new_clusters: usize,
    pub joined: usize,
    pub merges_attempted: usize,
    pub merges_succeeded: usize,
    pub merges_failed: usize,
    /// Another run held the lease for the cluster revision.
    pub merges_in_progress: usize,
    pub merges_cached: usize,
    /// Merged clusters dropped from memory after leaving the window.
    pub evicted: usize,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Merged(_) => self.merges_succeeded += 1,
            MergeOutcome::Cached(_) => self.merges_cached += 1,
            MergeOutcome::InProgress => self.merges_in_progress += 1,
            MergeOutcome::Failed(_) => self.merges_failed += 1,
            MergeOutcome::Skipped => {}
        }
    }
}

pub struct Pipeline {
    normalizer: Normalizer,
    clusterer: Clusterer,
    store: Arc<ClusterStore>,
    orchestrator: Arc<MergeOrchestrator>,
    repository: Arc<dyn Repository>,
    window: Duration,
    merge_slots: Arc<Semaphore>,
    cancel: watch::Receiver<bool>,
}

impl Pipeline {
    /// Wires the pipeline components around one cluster store.
    ///
    /// `cancel` flipping to `true` stops further merge dispatches; merges
    /// already running finish and release their lease.
    pub fn new(
        config: &PipelineConfig,
        cache: Arc<dyn MergeCache>,
        provider: Arc<dyn MergeProvider>,
        repository: Arc<dyn Repository>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let store = Arc::new(ClusterStore::new());
        let clusterer = Clusterer::new(
            store.clone(),
            SimilarityEngine::new(config.similarity_threshold),
            config.cluster_window,
        );
        let orchestrator = MergeOrchestrator::new(store.clone(), cache, provider, repository.clone())
            .with_policy(config.retry)
            .with_max_member_chars(config.max_member_chars);

        Self {
            normalizer: Normalizer::new(repository.clone()),
            clusterer,
            store,
            orchestrator: Arc::new(orchestrator),
            repository,
            window: config.cluster_window,
            merge_slots: Arc::new(Semaphore::new(config.max_concurrent_merges.max(1))),
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<MergeOrchestrator> {
        &self.orchestrator
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Loads the clusters new articles may still join, and those still
    /// waiting for a merge, from the repository. Older merged history stays
    /// in storage.
    pub async fn hydrate(&self) -> Result<()> {
        let since = Utc::now() - self.window;
        let records = self
            .repository
            .load_clusters(since)
            .await
            .context("failed to load stored clusters")?;

        let urls: Vec<String> = records
            .iter()
            .flat_map(|record| record.member_urls.iter().cloned())
            .collect();
        let members: HashMap<String, Arc<Article>> = self
            .repository
            .load_articles(&urls)
            .await
            .context("failed to load cluster members")?
            .into_iter()
            .map(|article| (article.canonical_url.clone(), Arc::new(article)))
            .collect();

        let cluster_count = records.len();
        for record in records {
            let cluster = record.into_cluster(|url| members.get(url).cloned());
            self.store.restore(cluster);
        }

        info!(
            target: TARGET_PIPELINE,
            "Hydrated {} clusters with {} articles", cluster_count, members.len()
        );
        Ok(())
    }

    /// Processes one scraped batch end to end. Failures of single articles or
    /// clusters are logged and counted; they never abort the run.
    #[instrument(target = "pipeline", level = "info", skip_all, fields(batch = batch.len()))]
    pub async fn run_once(&self, batch: Vec<RawArticle>) -> RunSummary {
        let mut summary = RunSummary {
            received: batch.len(),
            ..Default::default()
        };

        summary.evicted = self.store.evict_settled(Utc::now() - self.window).await;
        let touched = self.ingest(&batch, &mut summary).await;
        self.save_clusters(&touched).await;
        self.dispatch_merges(&mut summary).await;

        info!(
            target: TARGET_PIPELINE,
            "Run finished: received={} normalized={} duplicates={} malformed={} lookup_failures={} new_clusters={} joined={} merges attempted={} succeeded={} failed={} in_progress={} cached={} evicted={} cancelled={}",
            summary.received,
            summary.normalized,
            summary.duplicates,
            summary.malformed,
            summary.lookup_failures,
            summary.new_clusters,
            summary.joined,
            summary.merges_attempted,
            summary.merges_succeeded,
            summary.merges_failed,
            summary.merges_in_progress,
            summary.merges_cached,
            summary.evicted,
            summary.cancelled
        );
        summary
    }

    async fn ingest(&self, batch: &[RawArticle], summary: &mut RunSummary) -> BTreeSet<ClusterId> {
        let mut touched = BTreeSet::new();

        for raw in batch {
            let article = match self.normalizer.normalize(raw).await {
                Ok(Normalized::Fresh(article)) => {
                    summary.normalized += 1;
                    if let Err(e) = self.repository.save_article(&article).await {
                        error!(target: TARGET_PIPELINE, "{:#}", e);
                    }
                    article
                }
                Ok(Normalized::Existing(article)) => {
                    summary.duplicates += 1;
                    // Known URL; still assigned in case an earlier run stopped
                    // between normalizing and clustering it.
                    if !self.needs_placement(&article).await {
                        continue;
                    }
                    article
                }
                Err(e @ NormalizeError::Lookup { .. }) => {
                    summary.lookup_failures += 1;
                    error!(target: TARGET_PIPELINE, "Skipping record: {}", e);
                    continue;
                }
                Err(e) => {
                    summary.malformed += 1;
                    warn!(target: TARGET_PIPELINE, "Skipping record: {}", e);
                    continue;
                }
            };

            let assignment = self.clusterer.assign(article).await;
            match assignment.outcome {
                AssignmentOutcome::Created => summary.new_clusters += 1,
                AssignmentOutcome::Joined => summary.joined += 1,
                AssignmentOutcome::AlreadyMember => continue,
            }
            touched.insert(assignment.cluster.id);
        }

        touched
    }

    /// Whether a re-scraped article goes through assignment. Live members do,
    /// and assignment reports them as already placed. Articles held only by a
    /// stored cluster that was evicted or never hydrated are settled and skip.
    async fn needs_placement(&self, article: &Article) -> bool {
        if self.store.cluster_of(&article.canonical_url).is_some() {
            return true;
        }
        match self.repository.cluster_of_article(&article.canonical_url).await {
            Ok(None) => true,
            Ok(Some(cluster_id)) => {
                debug!(
                    target: TARGET_PIPELINE,
                    "{} already settled in cluster {}", article.canonical_url, cluster_id
                );
                false
            }
            Err(e) => {
                error!(target: TARGET_PIPELINE, "{:#}", e);
                false
            }
        }
    }

    async fn save_clusters(&self, touched: &BTreeSet<ClusterId>) {
        for cluster_id in touched {
            let Some(cluster) = self.store.get(cluster_id).await else {
                continue;
            };
            if let Err(e) = self.repository.save_cluster(&cluster).await {
                error!(target: TARGET_PIPELINE, "{:#}", e);
            }
        }
    }

    async fn dispatch_merges(&self, summary: &mut RunSummary) {
        let dirty = self.store.dirty_clusters();
        let mut merges = JoinSet::new();

        for cluster_id in dirty {
            if self.cancelled() {
                summary.cancelled = true;
                break;
            }
            let Ok(permit) = self.merge_slots.clone().acquire_owned().await else {
                break;
            };
            // Waiting for a slot can take a while.
            if self.cancelled() {
                summary.cancelled = true;
                break;
            }

            summary.merges_attempted += 1;
            let orchestrator = self.orchestrator.clone();
            merges.spawn(async move {
                let _permit = permit;
                orchestrator.process(cluster_id).await
            });
        }

        if summary.cancelled {
            info!(target: TARGET_PIPELINE, "Cancellation received, waiting for {} in-flight merges", merges.len());
        }

        while let Some(joined) = merges.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!(target: TARGET_PIPELINE, "Merge task failed: {}", e);
                    summary.merges_failed += 1;
                }
            }
        }
    }
}
