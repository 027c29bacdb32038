use async_trait::async_trait;
use autowire::article::normalizer::canonicalize_url;
use autowire::clustering::ClusterStatus;
use autowire::config::{PipelineConfig, RetryPolicy};
use autowire::db::{Database, SqliteMergeCache};
use autowire::error::ProviderError;
use autowire::llm::{MergeProvider, MergeRequest};
use autowire::merge::{MemoryMergeCache, MergeCache, MergeOutcome};
use autowire::repository::{ArticleQuery, MemoryRepository, Repository};
use autowire::{Pipeline, RawArticle};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

/// Model double that answers with a well-formed merge whose brand follows
/// the prompt and whose body length is adjustable.
struct FakeModel {
    body_len: AtomicUsize,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeModel {
    fn new(body_len: usize) -> Arc<Self> {
        Self::slow(body_len, Duration::ZERO)
    }

    fn slow(body_len: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            body_len: AtomicUsize::new(body_len),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MergeProvider for FakeModel {
    async fn complete(&self, request: &MergeRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let sources = request
            .prompt
            .split("### Source Versions:")
            .nth(1)
            .unwrap_or_default();
        let (brand, model) = if sources.contains("Hyundai") {
            ("Hyundai", "Creta")
        } else {
            ("Tata", "Nexon")
        };
        let sentence = format!("The {} {} story continues with more detail. ", brand, model);
        let len = self.body_len.load(Ordering::SeqCst);
        let mut body: String = sentence.repeat(len / sentence.len() + 1).chars().take(len - 1).collect();
        body.truncate(body.trim_end().len());
        body.push('.');

        Ok(serde_json::json!({
            "headline": format!("{} {} update", brand, model),
            "subheadline": format!("Everything we know about the {}", model),
            "body": body,
            "brand": brand,
            "model": model,
        })
        .to_string())
    }
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

const NEXON_BODY: &str = "Tata Motors has launched the Nexon EV facelift in India at an introductory \
price of Rs 14.74 lakh. The electric SUV gets a larger battery pack, a claimed range of 465 km, \
a new touchscreen and revised styling front and rear.";

const CRETA_BODY: &str = "Hyundai has revealed the Creta N Line ahead of its launch next month. \
The sporty SUV gets red accents, a turbo petrol engine with a manual gearbox and twin exhaust tips.";

fn nexon(n: usize, title: &str) -> RawArticle {
    raw(&format!("https://news{}.example.com/tata-nexon-ev-facelift", n), title, NEXON_BODY)
}

fn nexon_batch() -> Vec<RawArticle> {
    vec![
        nexon(1, "Tata Nexon EV facelift launched at Rs 14.74 lakh"),
        nexon(2, "Tata Nexon EV facelift launched at Rs 14.74 lakh in India"),
        nexon(3, "New Tata Nexon EV facelift launched at Rs 14.74 lakh"),
    ]
}

fn canonical(url: &str) -> String {
    canonicalize_url(&Url::parse(url).unwrap())
}

/// Three outlets reporting the same launch in their own words, plus an
/// unrelated story from the same brand.
fn reworded_batch() -> Vec<RawArticle> {
    vec![
        raw(
            "https://carwale.example.com/tata-nexon-ev-facelift-launched",
            "Tata Nexon EV facelift launched at Rs 14.74 lakh",
            NEXON_BODY,
        ),
        raw(
            "https://autocar.example.com/2024-nexon-ev-price",
            "Tata Nexon EV facelift launched in India at Rs 14.74 lakh",
            "The Nexon EV facelift is here. Tata has priced the electric SUV from Rs 14.74 lakh \
             ex-showroom and fitted a bigger battery rated for a range of 465 km. Inside there is \
             a 12.3-inch touchscreen, while the exterior gets new LED light bars.",
        ),
        raw(
            "https://rushlane.example.com/nexon-ev-facelift-prices",
            "Tata Nexon EV facelift launched, priced from Rs 14.74 lakh",
            "Introductory prices for the Nexon EV facelift begin at Rs 14.74 lakh. Tata Motors \
             claims a 465 km range from the larger battery, and the electric SUV adds a new \
             touchscreen alongside sharper styling.",
        ),
        raw(
            "https://carwale.example.com/tata-punch-cng-launched",
            "Tata Punch CNG launched at Rs 7.10 lakh",
            "Tata Motors has launched the Punch CNG with twin-cylinder technology, priced from \
             Rs 7.10 lakh. The micro SUV keeps a usable boot despite the gas tanks.",
        ),
    ]
}

fn config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

struct Harness {
    pipeline: Pipeline,
    repository: Arc<MemoryRepository>,
    cache: Arc<MemoryMergeCache>,
    model: Arc<FakeModel>,
    _cancel: watch::Sender<bool>,
}

fn harness(model: Arc<FakeModel>) -> Harness {
    let repository = Arc::new(MemoryRepository::new());
    let cache = Arc::new(MemoryMergeCache::new(Duration::from_secs(600)));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pipeline = Pipeline::new(
        &config(),
        cache.clone(),
        model.clone(),
        repository.clone(),
        cancel_rx,
    );
    Harness {
        pipeline,
        repository,
        cache,
        model,
        _cancel: cancel_tx,
    }
}

#[tokio::test]
async fn test_similar_articles_make_one_cluster_and_one_merge() {
    let h = harness(FakeModel::new(2600));

    let summary = h.pipeline.run_once(nexon_batch()).await;

    assert_eq!(summary.received, 3);
    assert_eq!(summary.normalized, 3);
    assert_eq!(summary.new_clusters, 1);
    assert_eq!(summary.joined, 2);
    assert_eq!(summary.merges_succeeded, 1);
    assert_eq!(h.model.calls(), 1);
    assert_eq!(h.pipeline.store().len(), 1);

    let merged = h.repository.list_current(&ArticleQuery::default()).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].revision, 3);
    assert_eq!(merged[0].source_urls.len(), 3);
    assert!(merged[0].body.chars().count() >= 2000);
    assert_eq!(merged[0].brand.as_deref(), Some("Tata"));
}

#[tokio::test]
async fn test_differently_worded_reports_of_one_launch_cluster_together() {
    let h = harness(FakeModel::new(2600));

    let summary = h.pipeline.run_once(reworded_batch()).await;

    assert_eq!(summary.normalized, 4);
    assert_eq!(summary.new_clusters, 2);
    assert_eq!(summary.joined, 2);
    assert_eq!(summary.merges_succeeded, 2);

    let nexon = h
        .pipeline
        .store()
        .cluster_of(&canonical("https://autocar.example.com/2024-nexon-ev-price"))
        .unwrap();
    let punch = h
        .pipeline
        .store()
        .cluster_of(&canonical("https://carwale.example.com/tata-punch-cng-launched"))
        .unwrap();
    assert_ne!(nexon, punch);
    assert_eq!(h.pipeline.store().get(&nexon).await.unwrap().members.len(), 3);
    assert_eq!(h.pipeline.store().get(&punch).await.unwrap().members.len(), 1);
}

#[tokio::test]
async fn test_unrelated_brands_are_merged_separately() {
    let h = harness(FakeModel::new(2600));
    let batch = vec![
        nexon(1, "Tata Nexon EV facelift launched at Rs 14.74 lakh"),
        raw(
            "https://cars.example.com/hyundai-creta-n-line",
            "Hyundai Creta N Line revealed ahead of launch",
            CRETA_BODY,
        ),
    ];

    let summary = h.pipeline.run_once(batch).await;

    assert_eq!(summary.new_clusters, 2);
    assert_eq!(summary.merges_succeeded, 2);
    assert_eq!(h.model.calls(), 2);

    let hyundai = h
        .repository
        .list_current(&ArticleQuery {
            brand: Some("Hyundai".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hyundai.len(), 1);
    assert_eq!(hyundai[0].model.as_deref(), Some("Creta"));
    assert_eq!(
        hyundai[0].source_urls,
        vec!["https://cars.example.com/hyundai-creta-n-line".to_string()]
    );
    assert_eq!(h.repository.brands().await.unwrap(), vec!["Hyundai", "Tata"]);
}

#[tokio::test]
async fn test_late_article_restales_merged_cluster() {
    let h = harness(FakeModel::new(2600));
    h.pipeline.run_once(nexon_batch()).await;
    assert!(h.pipeline.store().dirty_clusters().is_empty());

    let summary = h
        .pipeline
        .run_once(vec![nexon(4, "Tata Nexon EV facelift launched at Rs 14.74 lakh, bookings open")])
        .await;

    assert_eq!(summary.joined, 1);
    assert_eq!(summary.merges_succeeded, 1);
    assert_eq!(h.model.calls(), 2);

    let current = h.repository.list_current(&ArticleQuery::default()).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].revision, 4);
    assert_eq!(current[0].source_urls.len(), 4);

    let history = h.repository.merged_history(current[0].cluster_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].superseded);
    assert_eq!(history[0].revision, 3);

    let cluster = h.pipeline.store().get(&current[0].cluster_id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Merged);
    assert_eq!(cluster.merged_revision, Some(4));
}

#[tokio::test]
async fn test_short_body_fails_and_is_retried_next_run() {
    let h = harness(FakeModel::new(1500));

    let summary = h.pipeline.run_once(nexon_batch()).await;

    assert_eq!(summary.merges_failed, 1);
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.cache.in_flight(), 0);
    assert!(h.repository.list_current(&ArticleQuery::default()).await.unwrap().is_empty());
    let dirty = h.pipeline.store().dirty_clusters();
    assert_eq!(dirty.len(), 1);
    assert_eq!(
        h.pipeline.store().get(&dirty[0]).await.unwrap().status,
        ClusterStatus::Open
    );

    h.model.body_len.store(2600, Ordering::SeqCst);
    let summary = h.pipeline.run_once(Vec::new()).await;

    assert_eq!(summary.merges_succeeded, 1);
    assert_eq!(h.model.calls(), 3);
    assert!(h.pipeline.store().dirty_clusters().is_empty());
}

#[tokio::test]
async fn test_rescraped_urls_do_not_duplicate() {
    let h = harness(FakeModel::new(2600));
    h.pipeline.run_once(nexon_batch()).await;

    let mut again = nexon_batch();
    again[0].source_url = Some("https://NEWS1.EXAMPLE.com/tata-nexon-ev-facelift".to_string());
    let summary = h.pipeline.run_once(again).await;

    assert_eq!(summary.duplicates, 3);
    assert_eq!(summary.new_clusters + summary.joined, 0);
    assert_eq!(summary.merges_attempted, 0);
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn test_malformed_records_are_counted_and_skipped() {
    let h = harness(FakeModel::new(2600));
    let mut batch = nexon_batch();
    batch.push(raw("not a url", "Tata Nexon EV facelift launched", NEXON_BODY));
    batch.push(raw("https://news9.example.com/x", "Latest News", NEXON_BODY));
    batch.push(RawArticle::default());

    let summary = h.pipeline.run_once(batch).await;

    assert_eq!(summary.received, 6);
    assert_eq!(summary.malformed, 3);
    assert_eq!(summary.normalized, 3);
    assert_eq!(summary.merges_succeeded, 1);
}

#[tokio::test]
async fn test_overlapping_runs_call_the_model_once() {
    let h = harness(FakeModel::slow(2600, Duration::from_millis(50)));

    let (first, second) = tokio::join!(
        h.pipeline.run_once(nexon_batch()),
        h.pipeline.run_once(nexon_batch())
    );

    assert_eq!(h.model.calls(), 1);
    assert_eq!(first.merges_succeeded + second.merges_succeeded, 1);
    assert_eq!(h.pipeline.store().len(), 1);
    assert_eq!(h.repository.list_current(&ArticleQuery::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_process_calls_share_one_lease() {
    let h = harness(FakeModel::slow(2600, Duration::from_millis(50)));
    let (cancel_tx, cancel_rx) = watch::channel(true);
    // Cluster the batch without merging, then race the orchestrator directly.
    let pipeline = Pipeline::new(&config(), h.cache.clone(), h.model.clone(), h.repository.clone(), cancel_rx);
    pipeline.run_once(nexon_batch()).await;
    drop(cancel_tx);

    let cluster_id = pipeline.store().dirty_clusters()[0];
    let orchestrator = pipeline.orchestrator().clone();
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.process(cluster_id).await })
        })
        .collect();

    let mut merged = 0;
    for task in tasks {
        match task.await.unwrap() {
            MergeOutcome::Merged(_) => merged += 1,
            MergeOutcome::InProgress | MergeOutcome::Skipped | MergeOutcome::Cached(_) => {}
            MergeOutcome::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }
    assert_eq!(merged, 1);
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn test_cancellation_before_dispatch_leaves_clusters_unmerged() {
    let model = FakeModel::new(2600);
    let repository = Arc::new(MemoryRepository::new());
    let cache = Arc::new(MemoryMergeCache::new(Duration::from_secs(600)));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pipeline = Pipeline::new(&config(), cache.clone(), model.clone(), repository.clone(), cancel_rx);

    cancel_tx.send(true).unwrap();
    let summary = pipeline.run_once(nexon_batch()).await;

    assert!(summary.cancelled);
    assert_eq!(summary.new_clusters, 1);
    assert_eq!(summary.merges_attempted, 0);
    assert_eq!(model.calls(), 0);
    assert_eq!(cache.in_flight(), 0);
    assert_eq!(pipeline.store().dirty_clusters().len(), 1);
    // Clusters are still persisted for the next run.
    assert_eq!(repository.load_clusters(DateTime::<Utc>::MIN_UTC).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_restart_hydrates_from_sqlite() {
    let db = Database::in_memory().await.unwrap();
    let model = FakeModel::new(2600);
    let cache: Arc<dyn MergeCache> = Arc::new(SqliteMergeCache::new(db.clone(), Duration::from_secs(600)));

    let (_tx, rx) = watch::channel(false);
    let first = Pipeline::new(&config(), cache.clone(), model.clone(), Arc::new(db.clone()), rx.clone());
    first.hydrate().await.unwrap();
    first.run_once(nexon_batch()).await;
    drop(first);

    let second = Pipeline::new(&config(), cache, model.clone(), Arc::new(db.clone()), rx);
    second.hydrate().await.unwrap();
    assert_eq!(second.store().len(), 1);
    assert!(second.store().dirty_clusters().is_empty());

    let summary = second
        .run_once(vec![
            nexon(1, "Tata Nexon EV facelift launched at Rs 14.74 lakh"),
            nexon(4, "Tata Nexon EV facelift launched at Rs 14.74 lakh, bookings open"),
        ])
        .await;

    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.new_clusters, 0);
    assert_eq!(summary.joined, 1);
    assert_eq!(summary.merges_succeeded, 1);
    assert_eq!(model.calls(), 2);

    let current = db.list_current(&ArticleQuery::default()).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].revision, 4);
    assert_eq!(db.merged_history(current[0].cluster_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_settled_stories_leave_memory_and_are_not_reopened() {
    let model = FakeModel::new(2600);
    let repository = Arc::new(MemoryRepository::new());
    let cache = Arc::new(MemoryMergeCache::new(Duration::from_secs(600)));
    let (_tx, rx) = watch::channel(false);
    let config = PipelineConfig {
        cluster_window: chrono::Duration::seconds(1),
        ..config()
    };

    let pipeline = Pipeline::new(&config, cache.clone(), model.clone(), repository.clone(), rx.clone());
    pipeline.run_once(nexon_batch()).await;
    assert_eq!(pipeline.store().len(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let summary = pipeline.run_once(Vec::new()).await;
    assert_eq!(summary.evicted, 1);
    assert!(pipeline.store().is_empty());

    // Re-scrapes of the settled story are recognised from storage.
    let summary = pipeline.run_once(nexon_batch()).await;
    assert_eq!(summary.duplicates, 3);
    assert_eq!(summary.new_clusters, 0);
    assert_eq!(summary.merges_attempted, 0);
    assert!(pipeline.store().is_empty());
    assert_eq!(model.calls(), 1);

    // A restart only hydrates clusters inside the window.
    let restarted = Pipeline::new(&config, cache, model.clone(), repository, rx);
    restarted.hydrate().await.unwrap();
    assert!(restarted.store().is_empty());
}
