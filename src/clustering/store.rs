use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::{Cluster, ClusterId};
use crate::article::Article;
use crate::TARGET_CLUSTER;

/// Unlocked summary of a cluster, refreshed whenever the cluster changes.
#[derive(Debug, Clone, Copy)]
struct Recency {
    touch: u64,
    updated_at: DateTime<Utc>,
    needs_merge: bool,
}

impl From<&Cluster> for Recency {
    fn from(cluster: &Cluster) -> Self {
        Self {
            touch: cluster.touch,
            updated_at: cluster.updated_at,
            needs_merge: cluster.needs_merge(),
        }
    }
}

/// Owner of all live clusters.
///
/// Each cluster sits behind its own `tokio::sync::Mutex`; there is no lock
/// over the whole store. `membership` maps a canonical article URL to the one
/// cluster that holds it and is the arbiter when two tasks race to place the
/// same article. Merged clusters that fall out of the candidate window are
/// evicted, so the store only holds recent or unfinished stories.
#[derive(Default)]
pub struct ClusterStore {
    clusters: DashMap<ClusterId, Arc<Mutex<Cluster>>>,
    recency: DashMap<ClusterId, Recency>,
    membership: DashMap<String, ClusterId>,
    sequence: AtomicU64,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub(crate) fn next_touch(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn handle(&self, id: &ClusterId) -> Option<Arc<Mutex<Cluster>>> {
        self.clusters.get(id).map(|entry| entry.value().clone())
    }

    /// Consistent copy of a cluster, taken under its lock.
    pub async fn get(&self, id: &ClusterId) -> Option<Cluster> {
        let handle = self.handle(id)?;
        let cluster = handle.lock().await;
        Some(cluster.clone())
    }

    pub fn cluster_of(&self, canonical_url: &str) -> Option<ClusterId> {
        self.membership.get(canonical_url).map(|entry| *entry.value())
    }

    /// Clusters updated at or after `since`, most recently touched first,
    /// ties broken by ascending id.
    pub fn candidates(&self, since: DateTime<Utc>) -> Vec<ClusterId> {
        let ordered: Vec<(u64, ClusterId)> = self
            .recency
            .iter()
            .filter(|entry| entry.value().updated_at >= since)
            .map(|entry| (entry.value().touch, *entry.key()))
            .collect();
        sort_by_recency(ordered)
    }

    /// Clusters that are `Open` or `Stale`, in candidate order. Reads the
    /// recency summaries only; no cluster lock is taken.
    pub fn dirty_clusters(&self) -> Vec<ClusterId> {
        let ordered: Vec<(u64, ClusterId)> = self
            .recency
            .iter()
            .filter(|entry| entry.value().needs_merge)
            .map(|entry| (entry.value().touch, *entry.key()))
            .collect();
        sort_by_recency(ordered)
    }

    /// Drops merged clusters last updated before `before`, along with their
    /// URL memberships. Returns how many were evicted.
    ///
    /// The status is re-checked under each cluster's lock, and the cluster is
    /// unlinked while that lock is held, so a concurrent join either lands
    /// first (and refreshes `updated_at`) or finds the cluster gone.
    pub async fn evict_settled(&self, before: DateTime<Utc>) -> usize {
        let expired: Vec<ClusterId> = self
            .recency
            .iter()
            .filter(|entry| !entry.value().needs_merge && entry.value().updated_at < before)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            let Some(handle) = self.handle(&id) else {
                continue;
            };
            let cluster = handle.lock().await;
            if cluster.needs_merge() || cluster.updated_at >= before {
                continue;
            }
            self.clusters.remove(&id);
            self.recency.remove(&id);
            for member in &cluster.members {
                self.membership.remove_if(&member.canonical_url, |_, owner| *owner == id);
            }
            evicted += 1;
        }

        if evicted > 0 {
            debug!(target: TARGET_CLUSTER, "Evicted {} settled clusters", evicted);
        }
        evicted
    }

    /// Whether `handle` is still the live entry for `id`. Callers check this
    /// after locking a handle obtained earlier.
    pub(crate) fn is_live(&self, id: &ClusterId, handle: &Arc<Mutex<Cluster>>) -> bool {
        self.clusters
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), handle))
    }

    /// Opens a cluster for `article` unless another task already placed it,
    /// in which case the owning cluster id is returned as the error.
    pub(crate) fn create(&self, article: Arc<Article>) -> Result<Cluster, ClusterId> {
        match self.membership.entry(article.canonical_url.clone()) {
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                let cluster = Cluster::open(article, self.next_touch());
                self.recency.insert(cluster.id, Recency::from(&cluster));
                self.clusters
                    .insert(cluster.id, Arc::new(Mutex::new(cluster.clone())));
                entry.insert(cluster.id);
                debug!(target: TARGET_CLUSTER, "Opened cluster {}", cluster.id);
                Ok(cluster)
            }
        }
    }

    /// Claims `canonical_url` for `id`. Returns the current owner if the URL is
    /// already placed elsewhere. Callers hold the lock of cluster `id`.
    pub(crate) fn claim(&self, canonical_url: &str, id: ClusterId) -> Result<(), ClusterId> {
        match self.membership.entry(canonical_url.to_string()) {
            Entry::Occupied(entry) => Err(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(id);
                Ok(())
            }
        }
    }

    /// Refreshes the unlocked summary. Callers hold the cluster's lock.
    pub(crate) fn record_touch(&self, cluster: &Cluster) {
        self.recency.insert(cluster.id, Recency::from(cluster));
    }

    /// Records a committed merge of `revision` and returns the updated cluster.
    pub async fn mark_merged(&self, id: &ClusterId, revision: u64) -> Option<Cluster> {
        let handle = self.handle(id)?;
        let mut cluster = handle.lock().await;
        cluster.mark_merged(revision);
        self.record_touch(&cluster);
        Some(cluster.clone())
    }

    /// Re-inserts a cluster loaded from storage. Empty clusters are ignored.
    pub fn restore(&self, cluster: Cluster) {
        if cluster.members.is_empty() {
            return;
        }
        self.sequence.fetch_max(cluster.touch, Ordering::SeqCst);
        for member in &cluster.members {
            self.membership
                .entry(member.canonical_url.clone())
                .or_insert(cluster.id);
        }
        self.record_touch(&cluster);
        self.clusters
            .insert(cluster.id, Arc::new(Mutex::new(cluster)));
    }
}

fn sort_by_recency(mut ordered: Vec<(u64, ClusterId)>) -> Vec<ClusterId> {
    ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ordered.into_iter().map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusterStatus;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn article(url: &str) -> Arc<Article> {
        Arc::new(Article {
            source: "test".to_string(),
            url: format!("https://{}", url),
            canonical_url: url.to_string(),
            title: "Hyundai Exter CNG launched".to_string(),
            body: "Hyundai has added a CNG option to the Exter.".to_string(),
            brands: BTreeSet::new(),
            models: BTreeSet::new(),
            scraped_at: Utc::now(),
            published_at: None,
        })
    }

    #[tokio::test]
    async fn test_create_is_exclusive_per_url() {
        let store = ClusterStore::new();
        let first = store.create(article("a.example/1")).unwrap();
        let second = store.create(article("a.example/1"));

        assert_eq!(second.unwrap_err(), first.id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.cluster_of("a.example/1"), Some(first.id));
    }

    #[tokio::test]
    async fn test_candidates_most_recent_first() {
        let store = ClusterStore::new();
        let a = store.create(article("a.example/1")).unwrap();
        let b = store.create(article("b.example/1")).unwrap();
        let c = store.create(article("c.example/1")).unwrap();

        let order = store.candidates(Utc::now() - Duration::hours(1));
        assert_eq!(order, vec![c.id, b.id, a.id]);

        assert!(store.candidates(Utc::now() + Duration::hours(1)).is_empty());
    }

    #[tokio::test]
    async fn test_dirty_clusters_and_mark_merged() {
        let store = ClusterStore::new();
        let a = store.create(article("a.example/1")).unwrap();
        let b = store.create(article("b.example/1")).unwrap();

        let merged = store.mark_merged(&a.id, 1).await.unwrap();
        assert_eq!(merged.status, ClusterStatus::Merged);
        assert_eq!(store.dirty_clusters(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_restore_continues_touch_sequence() {
        let store = ClusterStore::new();
        let mut cluster = Cluster::open(article("a.example/1"), 41);
        cluster.touch = 41;
        let id = cluster.id;
        store.restore(cluster);

        assert_eq!(store.cluster_of("a.example/1"), Some(id));
        let fresh = store.create(article("b.example/1")).unwrap();
        assert_eq!(fresh.touch, 42);
        assert_eq!(store.candidates(DateTime::<Utc>::MIN_UTC)[0], fresh.id);
    }

    #[tokio::test]
    async fn test_evicts_only_settled_clusters_outside_window() {
        let store = ClusterStore::new();
        let old = Utc::now() - Duration::hours(100);

        let mut settled = Cluster::open(article("a.example/old-merged"), 1);
        settled.mark_merged(1);
        settled.updated_at = old;
        let settled_id = settled.id;
        store.restore(settled);

        let mut unfinished = Cluster::open(article("b.example/old-open"), 2);
        unfinished.updated_at = old;
        let unfinished_id = unfinished.id;
        store.restore(unfinished);

        let recent = store.create(article("c.example/new")).unwrap();
        store.mark_merged(&recent.id, 1).await.unwrap();

        let evicted = store.evict_settled(Utc::now() - Duration::hours(72)).await;

        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(&settled_id).await.is_none());
        assert_eq!(store.cluster_of("a.example/old-merged"), None);
        assert_eq!(store.cluster_of("b.example/old-open"), Some(unfinished_id));
        assert_eq!(store.dirty_clusters(), vec![unfinished_id]);

        // The URL is free again, so a new cluster can claim it.
        assert!(store.create(article("a.example/old-merged")).is_ok());
    }
}
