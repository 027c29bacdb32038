use anyhow::Result;
use autowire::config::{LlmConfig, PipelineConfig};
use autowire::db::{Database, SqliteMergeCache};
use autowire::inbox::Inbox;
use autowire::llm::LlmMergeProvider;
use autowire::logging::configure_logging;
use autowire::repository::{ArticleQuery, Repository};
use autowire::{Pipeline, TARGET_PIPELINE};
use clap::{Parser, Subcommand};
use prettytable::{Cell, Row as PrettyRow, Table};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "autowire", about = "Cluster automotive news and merge each story with a language model")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the inbox on a fixed interval until interrupted
    Run {
        /// Minutes between runs
        #[clap(short, long, default_value = "30")]
        interval_mins: u64,

        /// Directory scrape adapters write JSON batches into
        #[clap(long, default_value = "inbox")]
        inbox: PathBuf,
    },

    /// Process the inbox once and exit
    Once {
        #[clap(long, default_value = "inbox")]
        inbox: PathBuf,
    },

    /// List current merged articles
    Articles {
        #[clap(short, long)]
        brand: Option<String>,

        #[clap(short, long)]
        model: Option<String>,

        /// Number of articles to show
        #[clap(short, long, default_value = "20")]
        limit: usize,
    },

    /// List brands with merged articles
    Brands,

    /// List models with merged articles
    Models {
        #[clap(short, long)]
        brand: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();

    let args = Cli::parse();
    let config = PipelineConfig::from_env();
    let db = Database::new(&config.database_path).await?;

    match args.command {
        Commands::Run {
            interval_mins,
            inbox,
        } => {
            let (pipeline, mut cancel) = start_pipeline(&config, db).await?;
            let inbox = Inbox::new(inbox);
            let interval = Duration::from_secs(interval_mins.max(1) * 60);

            loop {
                process_inbox(&pipeline, &inbox).await;
                if *cancel.borrow() {
                    break;
                }
                tokio::select! {
                    _ = sleep(interval) => {}
                    changed = cancel.changed() => {
                        // Signal listener is gone; fall back to plain sleeping.
                        if changed.is_err() {
                            sleep(interval).await;
                        }
                    }
                }
                if *cancel.borrow() {
                    break;
                }
            }
            info!(target: TARGET_PIPELINE, "Shutting down");
        }
        Commands::Once { inbox } => {
            let (pipeline, _cancel_rx) = start_pipeline(&config, db).await?;
            process_inbox(&pipeline, &Inbox::new(inbox)).await;
        }
        Commands::Articles {
            brand,
            model,
            limit,
        } => {
            let query = ArticleQuery {
                brand,
                model,
                limit: Some(limit),
            };
            list_articles(&db, &query).await?;
        }
        Commands::Brands => {
            print_names("Brand", db.brands().await?);
        }
        Commands::Models { brand } => {
            print_names("Model", db.models(brand.as_deref()).await?);
        }
    }

    Ok(())
}

/// Builds a hydrated pipeline whose cancellation follows ctrl-c.
async fn start_pipeline(
    config: &PipelineConfig,
    db: Database,
) -> Result<(Pipeline, watch::Receiver<bool>)> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            error!(target: TARGET_PIPELINE, "Failed to listen for ctrl-c");
            return;
        }
        info!(target: TARGET_PIPELINE, "Ctrl-C received, finishing in-flight merges");
        let _ = cancel_tx.send(true);
    });

    let llm_config = LlmConfig::from_env();
    let provider = LlmMergeProvider::from_config(&llm_config)?;
    info!(target: TARGET_PIPELINE, "Merging with {}", provider.describe());
    if !config.news_sources.is_empty() {
        info!(target: TARGET_PIPELINE, "Configured sources: {}", config.news_sources.join(", "));
    }

    let cache = Arc::new(SqliteMergeCache::new(db.clone(), config.lease_ttl));
    let pipeline = Pipeline::new(
        config,
        cache,
        Arc::new(provider),
        Arc::new(db),
        cancel_rx.clone(),
    );
    pipeline.hydrate().await?;
    Ok((pipeline, cancel_rx))
}

async fn process_inbox(pipeline: &Pipeline, inbox: &Inbox) {
    let batch = match inbox.read_pending().await {
        Ok(batch) => batch,
        Err(e) => {
            error!(target: TARGET_PIPELINE, "Failed to read inbox {}: {:#}", inbox.dir().display(), e);
            return;
        }
    };

    // Still run with an empty batch: clusters left unmerged by an earlier run
    // are retried.
    pipeline.run_once(batch.articles).await;

    if let Err(e) = inbox.archive(&batch.files).await {
        error!(target: TARGET_PIPELINE, "{:#}", e);
    }
}

async fn list_articles(db: &Database, query: &ArticleQuery) -> Result<()> {
    let articles = db.list_current(query).await?;
    if articles.is_empty() {
        println!("No merged articles found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Generated"),
        Cell::new("Brand"),
        Cell::new("Model"),
        Cell::new("Rev"),
        Cell::new("Sources"),
        Cell::new("Headline"),
    ]));

    for article in &articles {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&article.generated_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(article.brand.as_deref().unwrap_or("-")),
            Cell::new(article.model.as_deref().unwrap_or("-")),
            Cell::new(&article.revision.to_string()),
            Cell::new(&article.source_urls.len().to_string()),
            Cell::new(&article.headline),
        ]));
    }

    table.printstd();
    Ok(())
}

fn print_names(heading: &str, names: Vec<String>) {
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![Cell::new(heading)]));
    for name in &names {
        table.add_row(PrettyRow::new(vec![Cell::new(name)]));
    }
    table.printstd();
}
