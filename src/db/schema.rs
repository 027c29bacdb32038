use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                canonical_url TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                source TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                brands TEXT NOT NULL, -- JSON array of catalogue keys
                models TEXT NOT NULL, -- JSON array of catalogue keys
                scraped_at TEXT NOT NULL,
                published_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_articles_scraped_at ON articles (scraped_at);

            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                status TEXT NOT NULL, -- open, merged, stale
                merged_revision INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                touch INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_touch ON clusters (touch);
            CREATE INDEX IF NOT EXISTS idx_clusters_updated_at ON clusters (updated_at);

            CREATE TABLE IF NOT EXISTS cluster_members (
                cluster_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                canonical_url TEXT NOT NULL UNIQUE,
                PRIMARY KEY (cluster_id, position),
                FOREIGN KEY (cluster_id) REFERENCES clusters (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS merged_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                headline TEXT NOT NULL,
                subheadline TEXT,
                body TEXT NOT NULL,
                brand TEXT,
                model TEXT,
                source_urls TEXT NOT NULL, -- JSON array
                generated_at TEXT NOT NULL,
                superseded INTEGER NOT NULL DEFAULT 0,
                UNIQUE (cluster_id, revision)
            );
            CREATE INDEX IF NOT EXISTS idx_merged_current ON merged_articles (superseded, generated_at);
            CREATE INDEX IF NOT EXISTS idx_merged_brand_model ON merged_articles (brand, model);

            CREATE TABLE IF NOT EXISTS merge_leases (
                cluster_id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                state TEXT NOT NULL, -- in_flight, done
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL, -- unix milliseconds
                result TEXT, -- JSON MergedArticle once done
                PRIMARY KEY (cluster_id, revision)
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
