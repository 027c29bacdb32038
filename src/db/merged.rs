use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, instrument};

use super::core::{format_time, from_db_int, parse_time, retry_on_lock, to_db_int, Database};
use crate::clustering::ClusterId;
use crate::merge::MergedArticle;
use crate::repository::ArticleQuery;
use crate::TARGET_DB;

const MERGED_COLUMNS: &str = "cluster_id, revision, headline, subheadline, body, brand, model, source_urls, generated_at, superseded";

fn merged_from_row(row: &SqliteRow) -> Result<MergedArticle, sqlx::Error> {
    let cluster_id: String = row.try_get("cluster_id")?;
    let source_urls: String = row.try_get("source_urls")?;
    let superseded: i64 = row.try_get("superseded")?;
    Ok(MergedArticle {
        cluster_id: cluster_id
            .parse::<ClusterId>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        revision: from_db_int(row.try_get("revision")?),
        headline: row.try_get("headline")?,
        subheadline: row.try_get("subheadline")?,
        body: row.try_get("body")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        source_urls: serde_json::from_str(&source_urls)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        generated_at: parse_time(row.try_get("generated_at")?)?,
        superseded: superseded != 0,
    })
}

impl Database {
    /// Inserts a merged article and marks every lower revision of the same
    /// cluster as superseded. Returns `false` if the revision was already stored.
    #[instrument(target = "db", level = "info", skip(self, merged), fields(cluster = %merged.cluster_id, revision = merged.revision))]
    pub async fn insert_merged(&self, merged: &MergedArticle) -> Result<bool, sqlx::Error> {
        let source_urls = serde_json::to_string(&merged.source_urls)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let source_urls = source_urls.as_str();
        retry_on_lock("insert_merged", || async move {
            let mut tx = self.pool().begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO merged_articles
                    (cluster_id, revision, headline, subheadline, body, brand, model, source_urls, generated_at, superseded)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
                "#,
            )
            .bind(merged.cluster_id.to_string())
            .bind(to_db_int(merged.revision))
            .bind(&merged.headline)
            .bind(&merged.subheadline)
            .bind(&merged.body)
            .bind(&merged.brand)
            .bind(&merged.model)
            .bind(source_urls)
            .bind(format_time(&merged.generated_at))
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;

            if inserted {
                sqlx::query(
                    r#"
                    UPDATE merged_articles
                    SET superseded = CASE
                        WHEN revision < (SELECT MAX(revision) FROM merged_articles WHERE cluster_id = ?1)
                        THEN 1 ELSE 0 END
                    WHERE cluster_id = ?1
                    "#,
                )
                .bind(merged.cluster_id.to_string())
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(inserted)
        })
        .await
        .inspect(|inserted| {
            if *inserted {
                info!(target: TARGET_DB, "Stored merged article for cluster {} revision {}", merged.cluster_id, merged.revision);
            }
        })
    }

    pub async fn fetch_current_merged(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Option<MergedArticle>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM merged_articles WHERE cluster_id = ?1 AND superseded = 0",
            MERGED_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(cluster_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(merged_from_row).transpose()
    }

    pub async fn fetch_merged_history(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Vec<MergedArticle>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM merged_articles WHERE cluster_id = ?1 ORDER BY revision ASC",
            MERGED_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(cluster_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(merged_from_row).collect()
    }

    /// Current merged articles matching `filter`, newest first.
    pub async fn fetch_current_articles(
        &self,
        filter: &ArticleQuery,
    ) -> Result<Vec<MergedArticle>, sqlx::Error> {
        let query = format!(
            r#"
            SELECT {} FROM merged_articles
            WHERE superseded = 0
              AND (?1 IS NULL OR brand = ?1 COLLATE NOCASE)
              AND (?2 IS NULL OR model = ?2 COLLATE NOCASE)
            ORDER BY generated_at DESC
            LIMIT ?3
            "#,
            MERGED_COLUMNS
        );
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(&query)
            .bind(&filter.brand)
            .bind(&filter.model)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(merged_from_row).collect()
    }

    pub async fn fetch_brands(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT brand FROM merged_articles
            WHERE superseded = 0 AND brand IS NOT NULL
            ORDER BY brand
            "#,
        )
        .fetch_all(self.pool())
        .await
    }

    pub async fn fetch_models(&self, brand: Option<&str>) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT model FROM merged_articles
            WHERE superseded = 0 AND model IS NOT NULL
              AND (?1 IS NULL OR brand = ?1 COLLATE NOCASE)
            ORDER BY model
            "#,
        )
        .bind(brand)
        .fetch_all(self.pool())
        .await
    }
}
