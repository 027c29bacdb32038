use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::output::MergeOutput;
use crate::article::catalogue::{title_case, Catalogue};
use crate::clustering::{Cluster, ClusterId};

/// The published article generated from one cluster revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedArticle {
    pub cluster_id: ClusterId,
    pub revision: u64,
    pub headline: String,
    pub subheadline: Option<String>,
    pub body: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub source_urls: Vec<String>,
    pub generated_at: DateTime<Utc>,
    /// Set once a later revision of the same cluster has been committed.
    #[serde(default)]
    pub superseded: bool,
}

impl MergedArticle {
    /// Combines validated model output with the cluster it was generated from.
    ///
    /// Brand and model fall back to the cluster's own tags when the model
    /// returned none. Names are title-cased.
    pub fn from_output(cluster: &Cluster, output: MergeOutput) -> Self {
        let catalogue = Catalogue::global();
        let brand = output
            .brand
            .map(|b| title_case(&b))
            .or_else(|| dominant_tag(cluster, |a| &a.brands).map(|b| catalogue.display_name(&b)));
        let model = output
            .model
            .map(|m| title_case(&m))
            .or_else(|| dominant_tag(cluster, |a| &a.models).map(|m| title_case(&m)));

        Self {
            cluster_id: cluster.id,
            revision: cluster.revision,
            headline: output.headline,
            subheadline: output.subheadline,
            body: output.body,
            brand,
            model,
            source_urls: cluster.members.iter().map(|a| a.url.clone()).collect(),
            generated_at: Utc::now(),
            superseded: false,
        }
    }
}

/// Most frequent tag across members; ties go to the alphabetically first tag.
fn dominant_tag<F>(cluster: &Cluster, tags: F) -> Option<String>
where
    F: Fn(&crate::Article) -> &std::collections::BTreeSet<String>,
{
    let mut counts = std::collections::BTreeMap::<&str, usize>::new();
    for member in &cluster.members {
        for tag in tags(member) {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(tag, _)| tag.to_string())
}
