use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::core::{to_db_int, Database};
use crate::clustering::ClusterId;
use crate::error::CacheError;
use crate::merge::{Lease, MergeCache, MergedArticle, TryBegin};
use crate::{TARGET_DB, TARGET_PIPELINE};

const STATE_IN_FLIGHT: &str = "in_flight";
const STATE_DONE: &str = "done";

/// [`MergeCache`] backed by the `merge_leases` table, so leases and results
/// are shared by every process using the same database file.
pub struct SqliteMergeCache {
    db: Database,
    ttl: Duration,
    reclaimed: AtomicU64,
}

enum LeaseRow {
    Done(MergedArticle),
    InFlight { token: String, expires_at: i64 },
}

fn backend(e: impl std::fmt::Display) -> CacheError {
    CacheError::Backend(e.to_string())
}

fn lost(lease: &Lease) -> CacheError {
    CacheError::LeaseLost {
        cluster_id: lease.cluster_id,
        revision: lease.revision,
    }
}

impl SqliteMergeCache {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            reclaimed: AtomicU64::new(0),
        }
    }

    async fn read(&self, cluster_id: ClusterId, revision: u64) -> Result<Option<LeaseRow>, CacheError> {
        let row = sqlx::query(
            "SELECT state, token, expires_at, result FROM merge_leases WHERE cluster_id = ?1 AND revision = ?2",
        )
        .bind(cluster_id.to_string())
        .bind(to_db_int(revision))
        .fetch_optional(self.db.pool())
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state").map_err(backend)?;
        if state == STATE_DONE {
            let result: Option<String> = row.try_get("result").map_err(backend)?;
            let merged = serde_json::from_str(result.as_deref().unwrap_or_default()).map_err(backend)?;
            Ok(Some(LeaseRow::Done(merged)))
        } else {
            Ok(Some(LeaseRow::InFlight {
                token: row.try_get("token").map_err(backend)?,
                expires_at: row.try_get("expires_at").map_err(backend)?,
            }))
        }
    }

    /// Inserts a lease, or takes over one that expired before `now`.
    async fn claim(&self, lease: &Lease, now: DateTime<Utc>) -> Result<bool, CacheError> {
        let result = sqlx::query(
            r#"
            INSERT INTO merge_leases (cluster_id, revision, state, token, expires_at, result)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL)
            ON CONFLICT(cluster_id, revision) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
            WHERE merge_leases.state = ?3 AND merge_leases.expires_at <= ?6
            "#,
        )
        .bind(lease.cluster_id.to_string())
        .bind(to_db_int(lease.revision))
        .bind(STATE_IN_FLIGHT)
        .bind(lease.token.to_string())
        .bind(lease.expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(self.db.pool())
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MergeCache for SqliteMergeCache {
    async fn try_begin(&self, cluster_id: ClusterId, revision: u64) -> Result<TryBegin, CacheError> {
        let now = Utc::now();
        let previous = self.read(cluster_id, revision).await?;

        match &previous {
            Some(LeaseRow::Done(merged)) => return Ok(TryBegin::AlreadyDone(merged.clone())),
            Some(LeaseRow::InFlight { expires_at, .. }) if *expires_at > now.timestamp_millis() => {
                return Ok(TryBegin::InProgress)
            }
            _ => {}
        }

        let lease = Lease::new(cluster_id, revision, self.ttl);
        if self.claim(&lease, now).await? {
            if let Some(LeaseRow::InFlight { token, expires_at }) = previous {
                warn!(
                    target: TARGET_PIPELINE,
                    "AbandonedLease: reclaiming lease {} on cluster {} revision {} (expired at {} ms)",
                    token, cluster_id, revision, expires_at
                );
                self.reclaimed.fetch_add(1, Ordering::SeqCst);
            }
            return Ok(TryBegin::Acquired(lease));
        }

        // Lost a race with another claimant; report what it left behind.
        match self.read(cluster_id, revision).await? {
            Some(LeaseRow::Done(merged)) => Ok(TryBegin::AlreadyDone(merged)),
            _ => Ok(TryBegin::InProgress),
        }
    }

    async fn complete(&self, lease: &Lease, result: &MergedArticle) -> Result<(), CacheError> {
        let json = serde_json::to_string(result).map_err(backend)?;
        let updated = sqlx::query(
            r#"
            UPDATE merge_leases SET state = ?1, result = ?2
            WHERE cluster_id = ?3 AND revision = ?4 AND state = ?5 AND token = ?6
            "#,
        )
        .bind(STATE_DONE)
        .bind(json)
        .bind(lease.cluster_id.to_string())
        .bind(to_db_int(lease.revision))
        .bind(STATE_IN_FLIGHT)
        .bind(lease.token.to_string())
        .execute(self.db.pool())
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            return Err(lost(lease));
        }
        debug!(target: TARGET_DB, "Lease {} completed", lease.token);
        Ok(())
    }

    async fn abort(&self, lease: &Lease) -> Result<(), CacheError> {
        let deleted = sqlx::query(
            "DELETE FROM merge_leases WHERE cluster_id = ?1 AND revision = ?2 AND state = ?3 AND token = ?4",
        )
        .bind(lease.cluster_id.to_string())
        .bind(to_db_int(lease.revision))
        .bind(STATE_IN_FLIGHT)
        .bind(lease.token.to_string())
        .execute(self.db.pool())
        .await
        .map_err(backend)?;

        if deleted.rows_affected() == 0 {
            return Err(lost(lease));
        }
        Ok(())
    }

    async fn evict_superseded(
        &self,
        cluster_id: ClusterId,
        current_revision: u64,
    ) -> Result<usize, CacheError> {
        let deleted = sqlx::query("DELETE FROM merge_leases WHERE cluster_id = ?1 AND revision < ?2")
            .bind(cluster_id.to_string())
            .bind(to_db_int(current_revision))
            .execute(self.db.pool())
            .await
            .map_err(backend)?;
        Ok(deleted.rows_affected() as usize)
    }

    fn reclaimed_leases(&self) -> u64 {
        self.reclaimed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn same_token(token: &str, lease: &Lease) -> bool {
        Uuid::parse_str(token).is_ok_and(|t| t == lease.token)
    }

    fn merged(cluster_id: ClusterId, revision: u64) -> MergedArticle {
        MergedArticle {
            cluster_id,
            revision,
            headline: "Royal Enfield Classic 650 launched".to_string(),
            subheadline: Some("Deliveries begin next month.".to_string()),
            body: "b".repeat(2200),
            brand: Some("Royal Enfield".to_string()),
            model: Some("Classic".to_string()),
            source_urls: vec!["https://a.example/1".to_string()],
            generated_at: Utc::now(),
            superseded: false,
        }
    }

    async fn cache(ttl: Duration) -> SqliteMergeCache {
        SqliteMergeCache::new(Database::in_memory().await.unwrap(), ttl)
    }

    #[tokio::test]
    async fn test_concurrent_try_begin_acquires_once() {
        let cache = Arc::new(cache(Duration::from_secs(600)).await);
        let cluster_id = ClusterId::new();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.try_begin(cluster_id, 2).await }));
        }
        let mut acquired = 0;
        for task in tasks {
            if let TryBegin::Acquired(_) = task.await.unwrap().unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn test_complete_abort_and_reclaim() {
        let cache = cache(Duration::ZERO).await;
        let cluster_id = ClusterId::new();

        let TryBegin::Acquired(first) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expected lease");
        };
        let TryBegin::Acquired(second) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expired lease should be reclaimable");
        };
        assert_eq!(cache.reclaimed_leases(), 1);
        assert!(cache.abort(&first).await.is_err());

        let row = cache.read(cluster_id, 1).await.unwrap();
        assert!(matches!(row, Some(LeaseRow::InFlight { ref token, .. }) if same_token(token, &second)));

        cache.complete(&second, &merged(cluster_id, 1)).await.unwrap();
        match cache.try_begin(cluster_id, 1).await.unwrap() {
            TryBegin::AlreadyDone(result) => {
                assert_eq!(result.subheadline.as_deref(), Some("Deliveries begin next month."))
            }
            other => panic!("expected cached result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_allows_reacquire_and_evict_drops_old_revisions() {
        let cache = cache(Duration::from_secs(600)).await;
        let cluster_id = ClusterId::new();

        let TryBegin::Acquired(lease) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("expected lease");
        };
        assert_eq!(cache.try_begin(cluster_id, 1).await.unwrap(), TryBegin::InProgress);
        cache.abort(&lease).await.unwrap();

        let TryBegin::Acquired(lease) = cache.try_begin(cluster_id, 1).await.unwrap() else {
            panic!("aborted lease should be re-acquirable");
        };
        cache.complete(&lease, &merged(cluster_id, 1)).await.unwrap();
        let TryBegin::Acquired(_) = cache.try_begin(cluster_id, 2).await.unwrap() else {
            panic!("new revision should be acquirable");
        };

        assert_eq!(cache.evict_superseded(cluster_id, 2).await.unwrap(), 1);
        assert!(cache.read(cluster_id, 1).await.unwrap().is_none());
        assert!(cache.read(cluster_id, 2).await.unwrap().is_some());
    }
}
