use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A record as handed over by a scrape adapter.
///
/// Only `source_url`, `title` and `body` are required for normalization; the
/// rest is optional metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawArticle {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "url")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "content")]
    pub body: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// A normalized article. Immutable once built; clusters hold it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// Source identifier, usually the publisher host.
    pub source: String,
    /// URL as scraped.
    pub url: String,
    /// Canonical form of `url`, the deduplication key.
    pub canonical_url: String,
    pub title: String,
    pub body: String,
    /// Catalogue keys of the brands mentioned.
    pub brands: BTreeSet<String>,
    /// Catalogue keys of the models mentioned.
    pub models: BTreeSet<String>,
    pub scraped_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Article {
    pub fn has_tags(&self) -> bool {
        !self.brands.is_empty()
    }
}
