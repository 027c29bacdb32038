//! Directory inbox that scrape adapters drop JSON batches into.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::article::RawArticle;
use crate::TARGET_PIPELINE;

const PROCESSED_DIR: &str = "processed";

/// Reads `*.json` files holding arrays of raw articles. Consumed files are
/// moved into `processed/` below the inbox directory.
pub struct Inbox {
    dir: PathBuf,
}

/// Raw articles read from one inbox pass, plus the files they came from.
#[derive(Debug, Default)]
pub struct InboxBatch {
    pub articles: Vec<RawArticle>,
    pub files: Vec<PathBuf>,
}

impl Inbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads every pending file in name order. A file that is not a valid
    /// JSON array is logged and moved aside so it does not block later runs.
    pub async fn read_pending(&self) -> Result<InboxBatch> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create inbox {}", self.dir.display()))?;

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read inbox {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut batch = InboxBatch::default();
        for path in paths {
            let contents = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_json::from_str::<Vec<RawArticle>>(&contents) {
                Ok(articles) => {
                    info!(target: TARGET_PIPELINE, "Read {} raw articles from {}", articles.len(), path.display());
                    batch.articles.extend(articles);
                }
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "Ignoring unreadable batch {}: {}", path.display(), e);
                }
            }
            batch.files.push(path);
        }
        Ok(batch)
    }

    /// Moves consumed files into `processed/`.
    pub async fn archive(&self, files: &[PathBuf]) -> Result<()> {
        let processed = self.dir.join(PROCESSED_DIR);
        fs::create_dir_all(&processed)
            .await
            .with_context(|| format!("failed to create {}", processed.display()))?;

        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            fs::rename(file, processed.join(name))
                .await
                .with_context(|| format!("failed to archive {}", file.display()))?;
        }
        Ok(())
    }
}
