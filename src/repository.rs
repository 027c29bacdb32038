//! Persistence seam for articles, clusters and merged articles.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::article::Article;
use crate::clustering::{Cluster, ClusterId, ClusterStatus};
use crate::merge::MergedArticle;

/// Stored form of a cluster: members are referenced by canonical URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub member_urls: Vec<String>,
    pub revision: u64,
    pub status: ClusterStatus,
    pub merged_revision: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub touch: u64,
}

impl From<&Cluster> for ClusterRecord {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id,
            member_urls: cluster.member_urls(),
            revision: cluster.revision,
            status: cluster.status,
            merged_revision: cluster.merged_revision,
            created_at: cluster.created_at,
            updated_at: cluster.updated_at,
            touch: cluster.touch,
        }
    }
}

impl ClusterRecord {
    /// Rebuilds the cluster, resolving members through `lookup`. Members that
    /// cannot be resolved are dropped.
    pub fn into_cluster<F>(self, lookup: F) -> Cluster
    where
        F: Fn(&str) -> Option<Arc<Article>>,
    {
        Cluster {
            id: self.id,
            members: self.member_urls.iter().filter_map(|url| lookup(url)).collect(),
            revision: self.revision,
            status: self.status,
            merged_revision: self.merged_revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
            touch: self.touch,
        }
    }

    /// Ordering key for last-writer-wins snapshots: later membership changes
    /// and later merges win.
    pub fn freshness(&self) -> (u64, u64) {
        (self.touch, self.merged_revision.unwrap_or(0))
    }
}

/// Filters for listing current merged articles.
#[derive(Debug, Clone, Default)]
pub struct ArticleQuery {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub limit: Option<usize>,
}

impl ArticleQuery {
    pub fn matches(&self, merged: &MergedArticle) -> bool {
        let field_matches = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            None => true,
            Some(wanted) => actual
                .as_deref()
                .is_some_and(|actual| actual.eq_ignore_ascii_case(wanted)),
        };
        !merged.superseded
            && field_matches(&self.brand, &merged.brand)
            && field_matches(&self.model, &merged.model)
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_article(&self, article: &Article) -> Result<()>;

    /// Stores a cluster snapshot unless a fresher one is already stored.
    async fn save_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Stores a merged article and supersedes every older revision of the same
    /// cluster. Returns `false` when that cluster revision was already stored.
    async fn save_merged(&self, merged: &MergedArticle) -> Result<bool>;

    async fn current_merged(&self, cluster_id: ClusterId) -> Result<Option<MergedArticle>>;

    /// All merged articles of a cluster, oldest revision first.
    async fn merged_history(&self, cluster_id: ClusterId) -> Result<Vec<MergedArticle>>;

    async fn find_article(&self, canonical_url: &str) -> Result<Option<Article>>;

    /// Stored articles with the given canonical URLs. Unknown URLs are skipped.
    async fn load_articles(&self, canonical_urls: &[String]) -> Result<Vec<Article>>;

    /// Cluster whose stored snapshot lists `canonical_url` as a member.
    async fn cluster_of_article(&self, canonical_url: &str) -> Result<Option<ClusterId>>;

    /// Clusters updated at or after `since`, plus every older cluster that
    /// still waits for a merge. Least recently touched first.
    async fn load_clusters(&self, since: DateTime<Utc>) -> Result<Vec<ClusterRecord>>;

    /// Current merged articles, newest first.
    async fn list_current(&self, query: &ArticleQuery) -> Result<Vec<MergedArticle>>;

    async fn brands(&self) -> Result<Vec<String>>;

    async fn models(&self, brand: Option<&str>) -> Result<Vec<String>>;
}

/// In-process [`Repository`] without durability.
#[derive(Default)]
pub struct MemoryRepository {
    articles: DashMap<String, Article>,
    clusters: DashMap<ClusterId, ClusterRecord>,
    members: DashMap<String, ClusterId>,
    merged: Mutex<Vec<MergedArticle>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_article(&self, article: &Article) -> Result<()> {
        self.articles
            .entry(article.canonical_url.clone())
            .or_insert_with(|| article.clone());
        Ok(())
    }

    async fn save_cluster(&self, cluster: &Cluster) -> Result<()> {
        let record = ClusterRecord::from(cluster);
        for url in &record.member_urls {
            self.members.entry(url.clone()).or_insert(record.id);
        }
        self.clusters
            .entry(record.id)
            .and_modify(|stored| {
                if record.freshness() >= stored.freshness() {
                    *stored = record.clone();
                }
            })
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn save_merged(&self, merged: &MergedArticle) -> Result<bool> {
        let mut all = self.merged.lock().await;
        if all
            .iter()
            .any(|m| m.cluster_id == merged.cluster_id && m.revision == merged.revision)
        {
            return Ok(false);
        }
        all.push(merged.clone());

        let latest = all
            .iter()
            .filter(|m| m.cluster_id == merged.cluster_id)
            .map(|m| m.revision)
            .max()
            .unwrap_or(merged.revision);
        for m in all.iter_mut().filter(|m| m.cluster_id == merged.cluster_id) {
            m.superseded = m.revision < latest;
        }
        Ok(true)
    }

    async fn current_merged(&self, cluster_id: ClusterId) -> Result<Option<MergedArticle>> {
        let all = self.merged.lock().await;
        Ok(all
            .iter()
            .find(|m| m.cluster_id == cluster_id && !m.superseded)
            .cloned())
    }

    async fn merged_history(&self, cluster_id: ClusterId) -> Result<Vec<MergedArticle>> {
        let all = self.merged.lock().await;
        let mut history: Vec<MergedArticle> = all
            .iter()
            .filter(|m| m.cluster_id == cluster_id)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.revision);
        Ok(history)
    }

    async fn find_article(&self, canonical_url: &str) -> Result<Option<Article>> {
        Ok(self.articles.get(canonical_url).map(|a| a.value().clone()))
    }

    async fn load_articles(&self, canonical_urls: &[String]) -> Result<Vec<Article>> {
        Ok(canonical_urls
            .iter()
            .filter_map(|url| self.articles.get(url).map(|a| a.value().clone()))
            .collect())
    }

    async fn cluster_of_article(&self, canonical_url: &str) -> Result<Option<ClusterId>> {
        Ok(self.members.get(canonical_url).map(|id| *id.value()))
    }

    async fn load_clusters(&self, since: DateTime<Utc>) -> Result<Vec<ClusterRecord>> {
        let mut clusters: Vec<ClusterRecord> = self
            .clusters
            .iter()
            .filter(|c| c.updated_at >= since || c.status != ClusterStatus::Merged)
            .map(|c| c.value().clone())
            .collect();
        clusters.sort_by_key(|c| c.touch);
        Ok(clusters)
    }

    async fn list_current(&self, query: &ArticleQuery) -> Result<Vec<MergedArticle>> {
        let all = self.merged.lock().await;
        let mut current: Vec<MergedArticle> =
            all.iter().filter(|m| query.matches(m)).cloned().collect();
        current.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        if let Some(limit) = query.limit {
            current.truncate(limit);
        }
        Ok(current)
    }

    async fn brands(&self) -> Result<Vec<String>> {
        let all = self.merged.lock().await;
        Ok(all
            .iter()
            .filter(|m| !m.superseded)
            .filter_map(|m| m.brand.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn models(&self, brand: Option<&str>) -> Result<Vec<String>> {
        let query = ArticleQuery {
            brand: brand.map(str::to_string),
            ..Default::default()
        };
        let all = self.merged.lock().await;
        Ok(all
            .iter()
            .filter(|m| query.matches(m))
            .filter_map(|m| m.model.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }
}
