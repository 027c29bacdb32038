use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use url::Url;
use urlnorm::UrlNormalizer;

use super::catalogue::Catalogue;
use super::types::{Article, RawArticle};
use crate::error::{MalformedReason, NormalizeError};
use crate::repository::Repository;
use crate::TARGET_PIPELINE;

/// Titles shorter than this are navigation chrome, not headlines.
pub const MIN_TITLE_CHARS: usize = 10;
/// Bodies shorter than this after cleanup are teasers without content.
pub const MIN_BODY_CHARS: usize = 30;

const GENERIC_TITLES: &[&str] = &[
    "stay updated & make informed decisions",
    "latest news",
    "breaking news",
    "top stories",
    "car news",
    "news",
];

lazy_static! {
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref BOILERPLATE_LINE: Regex = Regex::new(
        r"(?i)^\s*(also read|read more|read also|advertisement|sponsored|subscribe|follow us|click here|share this|share on|watch:|related:|download the app)\b"
    )
    .unwrap();
    static ref INLINE_SPACE: Regex = Regex::new(r"[ \t\u{a0}]+").unwrap();
    /// Motoring vocabulary that marks an untagged article as automotive news.
    static ref AUTOMOTIVE_TERMS: Regex = Regex::new(
        r"(?i)\b(cars?|automobiles?|vehicles?|automotive|hatchbacks?|sedans?|suvs?|mpvs?|coupes?|convertibles?|engines?|transmission|gearbox|fuel|mileage|hybrid|diesel|petrol|cng|ev|launch(?:ed|es)?|test drive|showrooms?|dealers?|dealerships?|bookings?|variants?|airbags?|abs|esp|cruise control|sunroof|touchscreen|two-wheelers?|motorcycles?|scooters?)\b"
    )
    .unwrap();
}

/// Outcome of normalizing one raw record.
#[derive(Debug, Clone)]
pub enum Normalized {
    /// First time this canonical URL was seen.
    Fresh(Arc<Article>),
    /// The URL was already known; the stored article is returned unchanged.
    Existing(Arc<Article>),
}

impl Normalized {
    pub fn article(&self) -> &Arc<Article> {
        match self {
            Normalized::Fresh(article) | Normalized::Existing(article) => article,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Normalized::Fresh(_))
    }
}

/// Turns raw scrape records into articles. Canonical URLs already in the
/// repository come back as the stored article, which makes re-scrapes no-ops.
pub struct Normalizer {
    repository: Arc<dyn Repository>,
    catalogue: &'static Catalogue,
}

impl Normalizer {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            catalogue: Catalogue::global(),
        }
    }

    pub async fn normalize(&self, raw: &RawArticle) -> Result<Normalized, NormalizeError> {
        let url = raw
            .source_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| malformed("", MalformedReason::MissingUrl))?;
        let parsed = Url::parse(url).map_err(|_| malformed(url, MalformedReason::InvalidUrl))?;
        let canonical_url = canonicalize_url(&parsed);

        match self.repository.find_article(&canonical_url).await {
            Ok(Some(existing)) => {
                debug!(target: TARGET_PIPELINE, "Re-scrape of known article {}", canonical_url);
                return Ok(Normalized::Existing(Arc::new(existing)));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(NormalizeError::Lookup {
                    url: canonical_url,
                    message: format!("{:#}", e),
                })
            }
        }

        let article = build_article(raw, url, &parsed, canonical_url, self.catalogue)?;
        Ok(Normalized::Fresh(Arc::new(article)))
    }
}

fn malformed(url: &str, reason: MalformedReason) -> NormalizeError {
    NormalizeError::MalformedSourceRecord {
        url: url.to_string(),
        reason,
    }
}

pub fn canonicalize_url(parsed: &Url) -> String {
    UrlNormalizer::default().compute_normalization_string(parsed)
}

fn build_article(
    raw: &RawArticle,
    url: &str,
    parsed: &Url,
    canonical_url: String,
    catalogue: &Catalogue,
) -> Result<Article, NormalizeError> {
    let title = raw
        .title
        .as_deref()
        .map(clean_title)
        .filter(|t| t.chars().count() >= MIN_TITLE_CHARS)
        .ok_or_else(|| malformed(url, MalformedReason::MissingTitle))?;
    if GENERIC_TITLES.contains(&title.to_lowercase().as_str()) {
        return Err(malformed(url, MalformedReason::GenericTitle));
    }

    let raw_body = raw
        .body
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| malformed(url, MalformedReason::MissingBody))?;
    let body = strip_boilerplate(raw_body);
    let body_len = body.chars().count();
    if body_len < MIN_BODY_CHARS {
        return Err(malformed(url, MalformedReason::DegenerateBody(body_len)));
    }

    let source = raw
        .source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            parsed
                .host_str()
                .map(|h| h.trim_start_matches("www.").to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let text = format!("{}\n{}", title, body);
    let tags = catalogue.extract(&text);
    if tags.brands.is_empty() && tags.models.is_empty() && !AUTOMOTIVE_TERMS.is_match(&text) {
        return Err(malformed(url, MalformedReason::Irrelevant));
    }

    Ok(Article {
        source,
        url: url.to_string(),
        canonical_url,
        title,
        body,
        brands: tags.brands,
        models: tags.models,
        scraped_at: raw.scraped_at.unwrap_or_else(Utc::now),
        published_at: raw.published_at,
    })
}

fn clean_title(title: &str) -> String {
    let text: String = title.nfkc().collect();
    let text = HTML_TAG.replace_all(&text, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes markup, share/subscribe chrome and blank lines from a scraped body.
pub fn strip_boilerplate(body: &str) -> String {
    let text: String = body.nfkc().collect();
    let text = HTML_TAG.replace_all(&text, " ");

    text.lines()
        .filter(|line| !BOILERPLATE_LINE.is_match(line))
        .map(|line| INLINE_SPACE.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn normalizer() -> (Normalizer, Arc<MemoryRepository>) {
        let repository = Arc::new(MemoryRepository::new());
        (Normalizer::new(repository.clone()), repository)
    }

    fn raw(url: &str, title: &str, body: &str) -> RawArticle {
        RawArticle {
            source: None,
            source_url: Some(url.to_string()),
            title: Some(title.to_string()),
            body: Some(body.to_string()),
            scraped_at: None,
            published_at: None,
        }
    }

    #[tokio::test]
    async fn test_normalize_extracts_tags_and_source() {
        let (normalizer, _) = normalizer();
        let result = normalizer
            .normalize(&raw(
                "https://www.rushlane.com/tata-nexon-ev-launch.html",
                "Tata Nexon EV launched at Rs 14.5 lakh",
                "Tata Motors has launched the updated Nexon EV with a larger battery pack.",
            ))
            .await
            .unwrap();

        assert!(result.is_fresh());
        let article = result.article();
        assert_eq!(article.source, "rushlane.com");
        assert!(article.brands.contains("tata"));
        assert!(article.models.contains("nexon"));
    }

    #[tokio::test]
    async fn test_rescrape_returns_stored_article() {
        let (normalizer, repository) = normalizer();
        let record = raw(
            "https://gaadiwaadi.com/hyundai-creta-facelift/",
            "Hyundai Creta facelift bookings open",
            "Hyundai has opened bookings for the Creta facelift across India.",
        );

        let first = normalizer.normalize(&record).await.unwrap();
        assert!(first.is_fresh());
        // Not stored yet, so still fresh.
        assert!(normalizer.normalize(&record).await.unwrap().is_fresh());

        repository.save_article(first.article()).await.unwrap();
        let mut rescrape = record.clone();
        rescrape.title = Some("A different headline for the same page".to_string());
        let second = normalizer.normalize(&rescrape).await.unwrap();

        assert!(!second.is_fresh());
        assert_eq!(second.article().title, first.article().title);
        assert_eq!(second.article().canonical_url, first.article().canonical_url);
    }

    #[tokio::test]
    async fn test_untagged_off_topic_story_is_rejected() {
        let (normalizer, _) = normalizer();
        let record = raw(
            "https://markets.example.com/sensex-closes-higher",
            "Sensex closes 400 points higher on banking rally",
            "Benchmark indices ended higher on Tuesday as banking and IT stocks rallied. \
             The Nifty gained 120 points while the rupee held steady against the dollar.",
        );

        assert!(matches!(
            normalizer.normalize(&record).await,
            Err(NormalizeError::MalformedSourceRecord { reason: MalformedReason::Irrelevant, .. })
        ));
    }

    #[tokio::test]
    async fn test_untagged_motoring_story_is_kept() {
        let (normalizer, _) = normalizer();
        let record = raw(
            "https://motoring.example.com/ev-subsidy",
            "Government extends subsidy for electric two-wheelers",
            "The scheme now covers electric scooters and motorcycles sold through registered dealers.",
        );

        let article = normalizer.normalize(&record).await.unwrap();
        assert!(article.article().brands.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_are_malformed() {
        let (normalizer, _) = normalizer();

        let mut no_url = raw("https://a.example/x", "A perfectly fine headline", "Body text long enough to keep around.");
        no_url.source_url = None;
        assert!(matches!(
            normalizer.normalize(&no_url).await,
            Err(NormalizeError::MalformedSourceRecord { reason: MalformedReason::MissingUrl, .. })
        ));

        let bad_url = raw("not a url", "A perfectly fine headline", "Body text long enough to keep around.");
        assert!(matches!(
            normalizer.normalize(&bad_url).await,
            Err(NormalizeError::MalformedSourceRecord { reason: MalformedReason::InvalidUrl, .. })
        ));

        let mut no_title = raw("https://a.example/y", "", "Body text long enough to keep around.");
        no_title.title = None;
        assert!(matches!(
            normalizer.normalize(&no_title).await,
            Err(NormalizeError::MalformedSourceRecord { reason: MalformedReason::MissingTitle, .. })
        ));

        let generic = raw("https://a.example/z", "Breaking News", "Body text long enough to keep around.");
        assert!(matches!(
            normalizer.normalize(&generic).await,
            Err(NormalizeError::MalformedSourceRecord { reason: MalformedReason::GenericTitle, .. })
        ));

    }

    #[tokio::test]
    async fn test_boilerplate_only_body_is_degenerate() {
        let (normalizer, _) = normalizer();
        let record = raw(
            "https://autocarindia.com/car-news/teaser",
            "Kia Seltos update coming soon",
            "<p>Also read: Kia Sonet review</p>\nAdvertisement\nSubscribe to our newsletter\n  \n",
        );

        match normalizer.normalize(&record).await {
            Err(NormalizeError::MalformedSourceRecord {
                reason: MalformedReason::DegenerateBody(len),
                ..
            }) => assert!(len < MIN_BODY_CHARS),
            other => panic!("expected degenerate body, got {:?}", other),
        }
    }

    #[test]
    fn test_strip_boilerplate_keeps_content() {
        let cleaned = strip_boilerplate(
            "<p>The Thar Roxx gets five doors.</p>\nAlso read: Scorpio N review\n   Prices start at   Rs 12.99 lakh.  ",
        );
        assert_eq!(
            cleaned,
            "The Thar Roxx gets five doors.\nPrices start at Rs 12.99 lakh."
        );
    }
}
