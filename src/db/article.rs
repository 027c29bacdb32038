use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

use super::core::{format_time, parse_time, retry_on_lock, Database};
use crate::article::Article;
use crate::TARGET_DB;

const SELECT_ARTICLE: &str = "SELECT canonical_url, url, source, title, body, brands, models, scraped_at, published_at FROM articles";

/// Bound parameters per `IN (...)` lookup, well under SQLite's variable limit.
const URL_CHUNK: usize = 500;

fn encode_tags(tags: &BTreeSet<String>) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn decode_tags(value: &str) -> Result<BTreeSet<String>, sqlx::Error> {
    serde_json::from_str(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

impl Database {
    /// Stores a normalized article. Articles are immutable, so a second insert
    /// of the same canonical URL is ignored.
    #[instrument(target = "db", level = "debug", skip(self, article), fields(url = %article.canonical_url))]
    pub async fn insert_article(&self, article: &Article) -> Result<bool, sqlx::Error> {
        let brands = encode_tags(&article.brands);
        let models = encode_tags(&article.models);
        let scraped_at = format_time(&article.scraped_at);
        let published_at = article.published_at.as_ref().map(format_time);

        let result = retry_on_lock("insert_article", || {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO articles
                    (canonical_url, url, source, title, body, brands, models, scraped_at, published_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(&article.canonical_url)
            .bind(&article.url)
            .bind(&article.source)
            .bind(&article.title)
            .bind(&article.body)
            .bind(&brands)
            .bind(&models)
            .bind(&scraped_at)
            .bind(&published_at)
            .execute(self.pool())
        })
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(target: TARGET_DB, "Article {} stored: {}", article.canonical_url, inserted);
        Ok(inserted)
    }

    /// The stored article for `canonical_url`, if any.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn fetch_article(&self, canonical_url: &str) -> Result<Option<Article>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE canonical_url = ?1", SELECT_ARTICLE))
            .bind(canonical_url)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    /// Stored articles for the given canonical URLs, in no particular order.
    pub async fn fetch_articles(&self, canonical_urls: &[String]) -> Result<Vec<Article>, sqlx::Error> {
        let mut articles = Vec::with_capacity(canonical_urls.len());
        for chunk in canonical_urls.chunks(URL_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new(SELECT_ARTICLE);
            query.push(" WHERE canonical_url IN (");
            let mut urls = query.separated(", ");
            for url in chunk {
                urls.push_bind(url);
            }
            urls.push_unseparated(")");

            let rows = query.build().fetch_all(self.pool()).await?;
            for row in &rows {
                articles.push(article_from_row(row)?);
            }
        }
        Ok(articles)
    }
}

fn article_from_row(row: &SqliteRow) -> Result<Article, sqlx::Error> {
    let published_at: Option<String> = row.try_get("published_at")?;
    Ok(Article {
        canonical_url: row.try_get("canonical_url")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        brands: decode_tags(row.try_get("brands")?)?,
        models: decode_tags(row.try_get("models")?)?,
        scraped_at: parse_time(row.try_get("scraped_at")?)?,
        published_at: published_at.as_deref().map(parse_time).transpose()?,
    })
}
