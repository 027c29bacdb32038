use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::core::{format_time, from_db_int, parse_time, to_db_int, Database};
use crate::clustering::{ClusterId, ClusterStatus};
use crate::repository::ClusterRecord;
use crate::TARGET_DB;

impl Database {
    /// Upserts a cluster snapshot and its member list.
    ///
    /// A snapshot older than the stored one (lower touch, or same touch with an
    /// older merge) leaves the row untouched. Returns whether it was written.
    #[instrument(target = "db", level = "debug", skip(self, record), fields(cluster = %record.id))]
    pub async fn upsert_cluster(&self, record: &ClusterRecord) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO clusters (id, revision, status, merged_revision, created_at, updated_at, touch)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                revision = excluded.revision,
                status = excluded.status,
                merged_revision = excluded.merged_revision,
                updated_at = excluded.updated_at,
                touch = excluded.touch
            WHERE excluded.touch > clusters.touch
               OR (excluded.touch = clusters.touch
                   AND COALESCE(excluded.merged_revision, 0) >= COALESCE(clusters.merged_revision, 0))
            "#,
        )
        .bind(record.id.to_string())
        .bind(to_db_int(record.revision))
        .bind(record.status.as_str())
        .bind(record.merged_revision.map(to_db_int))
        .bind(format_time(&record.created_at))
        .bind(format_time(&record.updated_at))
        .bind(to_db_int(record.touch))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(target: TARGET_DB, "Skipped older snapshot of cluster {}", record.id);
            return Ok(false);
        }

        sqlx::query("DELETE FROM cluster_members WHERE cluster_id = ?1")
            .bind(record.id.to_string())
            .execute(&mut *tx)
            .await?;

        for (position, url) in record.member_urls.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO cluster_members (cluster_id, position, canonical_url) VALUES (?1, ?2, ?3)",
            )
            .bind(record.id.to_string())
            .bind(position as i64)
            .bind(url)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Cluster holding `canonical_url` as a member.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn fetch_article_cluster(&self, canonical_url: &str) -> Result<Option<ClusterId>, sqlx::Error> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT cluster_id FROM cluster_members WHERE canonical_url = ?1")
                .bind(canonical_url)
                .fetch_optional(self.pool())
                .await?;
        id.map(|id| id.parse::<ClusterId>().map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .transpose()
    }

    /// Clusters updated at or after `since` plus older ones that were never
    /// merged at their current revision, with members in arrival order, least
    /// recently touched first.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn fetch_clusters(&self, since: DateTime<Utc>) -> Result<Vec<ClusterRecord>, sqlx::Error> {
        let since = format_time(&since);
        let member_rows = sqlx::query(
            r#"
            SELECT m.cluster_id, m.canonical_url
            FROM cluster_members m
            JOIN clusters c ON c.id = m.cluster_id
            WHERE c.updated_at >= ?1 OR c.status != ?2
            ORDER BY m.cluster_id, m.position
            "#,
        )
        .bind(&since)
        .bind(ClusterStatus::Merged.as_str())
        .fetch_all(self.pool())
        .await?;

        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        for row in &member_rows {
            let cluster_id: String = row.try_get("cluster_id")?;
            let url: String = row.try_get("canonical_url")?;
            members.entry(cluster_id).or_default().push(url);
        }

        let rows = sqlx::query(
            r#"
            SELECT id, revision, status, merged_revision, created_at, updated_at, touch
            FROM clusters
            WHERE updated_at >= ?1 OR status != ?2
            ORDER BY touch ASC
            "#,
        )
        .bind(&since)
        .bind(ClusterStatus::Merged.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<ClusterRecord, sqlx::Error> {
                let id: String = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                let merged_revision: Option<i64> = row.try_get("merged_revision")?;
                Ok(ClusterRecord {
                    id: id
                        .parse::<ClusterId>()
                        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                    member_urls: members.remove(&id).unwrap_or_default(),
                    revision: from_db_int(row.try_get("revision")?),
                    status: ClusterStatus::parse(&status).ok_or_else(|| {
                        sqlx::Error::Decode(format!("unknown cluster status '{}'", status).into())
                    })?,
                    merged_revision: merged_revision.map(from_db_int),
                    created_at: parse_time(row.try_get("created_at")?)?,
                    updated_at: parse_time(row.try_get("updated_at")?)?,
                    touch: from_db_int(row.try_get("touch")?),
                })
            })
            .collect()
    }
}
