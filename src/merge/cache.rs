use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::merged::MergedArticle;
use crate::clustering::ClusterId;
use crate::error::CacheError;
use crate::TARGET_PIPELINE;

/// Exclusive right to merge one cluster revision until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub cluster_id: ClusterId,
    pub revision: u64,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(cluster_id: ClusterId, revision: u64, ttl: Duration) -> Self {
        Self {
            cluster_id,
            revision,
            token: Uuid::new_v4(),
            expires_at: expiry(ttl),
        }
    }
}

pub(crate) fn expiry(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or_else(|| now + chrono::Duration::minutes(10))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TryBegin {
    Acquired(Lease),
    AlreadyDone(MergedArticle),
    InProgress,
}

/// Dedup guard keyed by `(cluster id, revision)`.
///
/// For a given key at most one caller holds a live lease, and once a result is
/// completed every later caller gets it back instead of merging again.
#[async_trait]
pub trait MergeCache: Send + Sync {
    async fn try_begin(&self, cluster_id: ClusterId, revision: u64) -> Result<TryBegin, CacheError>;

    /// Stores the result. Fails with [`CacheError::LeaseLost`] unless `lease`
    /// is still the holder of its key.
    async fn complete(&self, lease: &Lease, result: &MergedArticle) -> Result<(), CacheError>;

    /// Releases the lease so the key can be acquired again.
    async fn abort(&self, lease: &Lease) -> Result<(), CacheError>;

    /// Drops entries of `cluster_id` older than `current_revision`.
    async fn evict_superseded(
        &self,
        cluster_id: ClusterId,
        current_revision: u64,
    ) -> Result<usize, CacheError>;

    /// Number of expired leases taken over so far.
    fn reclaimed_leases(&self) -> u64;
}

#[derive(Debug, Clone)]
enum CacheEntry {
    InFlight { token: Uuid, expires_at: DateTime<Utc> },
    Done(MergedArticle),
}

pub struct MemoryMergeCache {
    entries: DashMap<(ClusterId, u64), CacheEntry>,
    ttl: Duration,
    reclaimed: AtomicU64,
}

impl MemoryMergeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            reclaimed: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys currently leased.
    pub fn in_flight(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), CacheEntry::InFlight { .. }))
            .count()
    }
}

fn lost(lease: &Lease) -> CacheError {
    CacheError::LeaseLost {
        cluster_id: lease.cluster_id,
        revision: lease.revision,
    }
}

#[async_trait]
impl MergeCache for MemoryMergeCache {
    async fn try_begin(&self, cluster_id: ClusterId, revision: u64) -> Result<TryBegin, CacheError> {
        let now = Utc::now();
        match self.entries.entry((cluster_id, revision)) {
            Entry::Vacant(entry) => {
                let lease = Lease::new(cluster_id, revision, self.ttl);
                entry.insert(CacheEntry::InFlight {
                    token: lease.token,
                    expires_at: lease.expires_at,
                });
                Ok(TryBegin::Acquired(lease))
            }
            Entry::Occupied(mut entry) => {
                let (token, expires_at) = match entry.get() {
                    CacheEntry::Done(result) => return Ok(TryBegin::AlreadyDone(result.clone())),
                    CacheEntry::InFlight { expires_at, .. } if *expires_at > now => {
                        return Ok(TryBegin::InProgress)
                    }
                    CacheEntry::InFlight { token, expires_at } => (*token, *expires_at),
                };

                warn!(
                    target: TARGET_PIPELINE,
                    "AbandonedLease: reclaiming lease {} on cluster {} revision {} (expired {})",
                    token, cluster_id, revision, expires_at
                );
                self.reclaimed.fetch_add(1, Ordering::SeqCst);
                let lease = Lease::new(cluster_id, revision, self.ttl);
                entry.insert(CacheEntry::InFlight {
                    token: lease.token,
                    expires_at: lease.expires_at,
                });
                Ok(TryBegin::Acquired(lease))
            }
        }
    }

    async fn complete(&self, lease: &Lease, result: &MergedArticle) -> Result<(), CacheError> {
        let mut entry = self
            .entries
            .get_mut(&(lease.cluster_id, lease.revision))
            .ok_or_else(|| lost(lease))?;
        let holder = matches!(entry.value(), CacheEntry::InFlight { token, .. } if *token == lease.token);
        if !holder {
            return Err(lost(lease));
        }
        *entry.value_mut() = CacheEntry::Done(result.clone());
        debug!(target: TARGET_PIPELINE, "Cached merge of cluster {} revision {}", lease.cluster_id, lease.revision);
        Ok(())
    }

    async fn abort(&self, lease: &Lease) -> Result<(), CacheError> {
        let removed = self.entries.remove_if(&(lease.cluster_id, lease.revision), |_, entry| {
            matches!(entry, CacheEntry::InFlight { token, .. } if *token == lease.token)
        });
        match removed {
            Some(_) => Ok(()),
            None => Err(lost(lease)),
        }
    }

    async fn evict_superseded(
        &self,
        cluster_id: ClusterId,
        current_revision: u64,
    ) -> Result<usize, CacheError> {
        let mut evicted = 0;
        self.entries.retain(|(id, revision), _| {
            let superseded = *id == cluster_id && *revision < current_revision;
            if superseded {
                evicted += 1;
            }
            !superseded
        });
        Ok(evicted)
    }

    fn reclaimed_leases(&self) -> u64 {
        self.reclaimed.load(Ordering::SeqCst)
    }
}

/// Aborts its lease on drop unless [`LeaseGuard::disarm`] was called, so a
/// cancelled or panicking merge never leaves a key locked until expiry.
pub struct LeaseGuard {
    cache: Arc<dyn MergeCache>,
    lease: Lease,
    armed: bool,
}

impl LeaseGuard {
    pub fn new(cache: Arc<dyn MergeCache>, lease: Lease) -> Self {
        Self {
            cache,
            lease,
            armed: true,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Hands the lease back to the caller, who becomes responsible for
    /// completing or aborting it.
    pub fn disarm(mut self) -> Lease {
        self.armed = false;
        self.lease.clone()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cache = self.cache.clone();
        let lease = self.lease.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = cache.abort(&lease).await {
                    debug!(target: TARGET_PIPELINE, "Dropped lease was already released: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusterId;

    fn merged(cluster_id: ClusterId, revision: u64) -> MergedArticle {
        MergedArticle {
            cluster_id,
            revision,
            headline: "Honda Elevate gets a black edition".to_string(),
            subheadline: None,
            body: "b".repeat(2500),
            brand: Some("Honda".to_string()),
            model: Some("Elevate".to_string()),
            source_urls: vec!["https://a.example/1".to_string()],
            generated_at: Utc::now(),
            superseded: false,
        }
    }

    #[tokio::test]
    async fn test_concurrent_try_begin_acquires_once() {
        let cache = Arc::new(MemoryMergeCache::new(Duration::from_secs(600)));
        let cluster_id = ClusterId::new();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.try_begin(cluster_id, 1).await }));
        }

        let mut acquired = 0;
        let mut in_progress = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                TryBegin::Acquired(_) => acquired += 1,
                TryBegin::InProgress => in_progress += 1,
                TryBegin::AlreadyDone(_) => panic!("nothing was completed"),
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(in_progress, 31);
    }

    #[tokio::test]
    async fn test_complete_then_already_done() {
        let cache = MemoryMergeCache::new(Duration::from_secs(600));
        let cluster_id = ClusterId::new();

        let TryBegin::Acquired(lease) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expected lease");
        };
        cache.complete(&lease, &merged(cluster_id, 1)).await.unwrap();

        match cache.try_begin(cluster_id, 1).await.unwrap() {
            TryBegin::AlreadyDone(result) => assert_eq!(result.revision, 1),
            other => panic!("expected cached result, got {:?}", other),
        }
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abort_releases_and_only_holder_may_abort() {
        let cache = MemoryMergeCache::new(Duration::from_secs(600));
        let cluster_id = ClusterId::new();

        let TryBegin::Acquired(lease) = cache.try_begin(cluster_id, 3).await.unwrap() else {
            panic!("expected lease");
        };
        let impostor = Lease::new(cluster_id, 3, Duration::from_secs(600));
        assert!(matches!(
            cache.abort(&impostor).await,
            Err(CacheError::LeaseLost { revision: 3, .. })
        ));

        cache.abort(&lease).await.unwrap();
        assert!(matches!(
            cache.try_begin(cluster_id, 3).await.unwrap(),
            TryBegin::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let cache = MemoryMergeCache::new(Duration::ZERO);
        let cluster_id = ClusterId::new();

        let TryBegin::Acquired(stale) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expected lease");
        };
        let TryBegin::Acquired(fresh) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expired lease should be reclaimable");
        };
        assert_ne!(stale.token, fresh.token);
        assert_eq!(cache.reclaimed_leases(), 1);

        assert!(cache.complete(&stale, &merged(cluster_id, 1)).await.is_err());
        cache.complete(&fresh, &merged(cluster_id, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_evict_superseded_keeps_current() {
        let cache = MemoryMergeCache::new(Duration::from_secs(600));
        let cluster_id = ClusterId::new();
        let other = ClusterId::new();

        for revision in 1..=3 {
            let TryBegin::Acquired(lease) = cache.try_begin(cluster_id, revision).await.unwrap() else {
                panic!("expected lease");
            };
            cache.complete(&lease, &merged(cluster_id, revision)).await.unwrap();
        }
        assert!(matches!(
            cache.try_begin(other, 1).await.unwrap(),
            TryBegin::Acquired(_)
        ));

        assert_eq!(cache.evict_superseded(cluster_id, 3).await.unwrap(), 2);
        assert_eq!(cache.len(), 2);
        assert!(matches!(
            cache.try_begin(cluster_id, 3).await.unwrap(),
            TryBegin::AlreadyDone(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_evict_count_ignores_concurrent_inserts() {
        let cache = Arc::new(MemoryMergeCache::new(Duration::from_secs(600)));
        let cluster_id = ClusterId::new();
        for revision in 1..=5 {
            cache.try_begin(cluster_id, revision).await.unwrap();
        }

        let inserts: Vec<_> = (0..64)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.try_begin(ClusterId::new(), 1).await })
            })
            .collect();
        let evicted = cache.evict_superseded(cluster_id, 5).await.unwrap();
        for insert in inserts {
            insert.await.unwrap().unwrap();
        }

        assert_eq!(evicted, 4);
        assert_eq!(cache.len(), 65);
    }

    #[tokio::test]
    async fn test_dropped_guard_aborts_lease() {
        let cache = Arc::new(MemoryMergeCache::new(Duration::from_secs(600)));
        let cluster_id = ClusterId::new();

        let TryBegin::Acquired(lease) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expected lease");
        };
        drop(LeaseGuard::new(cache.clone(), lease));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.in_flight(), 0);
    }
}
