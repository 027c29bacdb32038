use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::core::Database;
use crate::article::Article;
use crate::clustering::{Cluster, ClusterId};
use crate::merge::MergedArticle;
use crate::repository::{ArticleQuery, ClusterRecord, Repository};

#[async_trait]
impl Repository for Database {
    async fn save_article(&self, article: &Article) -> Result<()> {
        self.insert_article(article)
            .await
            .with_context(|| format!("failed to store article {}", article.canonical_url))?;
        Ok(())
    }

    async fn save_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.upsert_cluster(&ClusterRecord::from(cluster))
            .await
            .with_context(|| format!("failed to store cluster {}", cluster.id))?;
        Ok(())
    }

    async fn save_merged(&self, merged: &MergedArticle) -> Result<bool> {
        self.insert_merged(merged).await.with_context(|| {
            format!(
                "failed to store merged article for cluster {} revision {}",
                merged.cluster_id, merged.revision
            )
        })
    }

    async fn current_merged(&self, cluster_id: ClusterId) -> Result<Option<MergedArticle>> {
        self.fetch_current_merged(cluster_id)
            .await
            .context("failed to load current merged article")
    }

    async fn merged_history(&self, cluster_id: ClusterId) -> Result<Vec<MergedArticle>> {
        self.fetch_merged_history(cluster_id)
            .await
            .context("failed to load merged history")
    }

    async fn find_article(&self, canonical_url: &str) -> Result<Option<Article>> {
        self.fetch_article(canonical_url)
            .await
            .with_context(|| format!("failed to look up article {}", canonical_url))
    }

    async fn load_articles(&self, canonical_urls: &[String]) -> Result<Vec<Article>> {
        self.fetch_articles(canonical_urls)
            .await
            .context("failed to load articles")
    }

    async fn cluster_of_article(&self, canonical_url: &str) -> Result<Option<ClusterId>> {
        self.fetch_article_cluster(canonical_url)
            .await
            .with_context(|| format!("failed to look up cluster of {}", canonical_url))
    }

    async fn load_clusters(&self, since: DateTime<Utc>) -> Result<Vec<ClusterRecord>> {
        self.fetch_clusters(since).await.context("failed to load clusters")
    }

    async fn list_current(&self, query: &ArticleQuery) -> Result<Vec<MergedArticle>> {
        self.fetch_current_articles(query)
            .await
            .context("failed to list merged articles")
    }

    async fn brands(&self) -> Result<Vec<String>> {
        self.fetch_brands().await.context("failed to list brands")
    }

    async fn models(&self, brand: Option<&str>) -> Result<Vec<String>> {
        self.fetch_models(brand).await.context("failed to list models")
    }
}
