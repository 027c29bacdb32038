use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::article::Article;

/// Stable identifier of a story cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(Uuid);

impl ClusterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClusterId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClusterId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Merge state of a cluster relative to its current revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Never merged.
    Open,
    /// Merged at the current revision.
    Merged,
    /// Merged at an older revision; members arrived since.
    Stale,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Open => "open",
            ClusterStatus::Merged => "merged",
            ClusterStatus::Stale => "stale",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ClusterStatus::Open),
            "merged" => Some(ClusterStatus::Merged),
            "stale" => Some(ClusterStatus::Stale),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group of articles believed to report the same story.
///
/// Members are kept in arrival order. `revision` starts at 1 and goes up by
/// exactly one for every member added after creation.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    pub members: Vec<Arc<Article>>,
    pub revision: u64,
    pub status: ClusterStatus,
    /// Revision of the last committed merge.
    pub merged_revision: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store-wide sequence number of the last membership change.
    pub touch: u64,
}

impl Cluster {
    pub fn open(first: Arc<Article>, touch: u64) -> Self {
        let now = Utc::now();
        Self {
            id: ClusterId::new(),
            members: vec![first],
            revision: 1,
            status: ClusterStatus::Open,
            merged_revision: None,
            created_at: now,
            updated_at: now,
            touch,
        }
    }

    /// Appends a member and bumps the revision. A merged cluster becomes stale.
    pub fn add_member(&mut self, article: Arc<Article>, touch: u64) {
        self.members.push(article);
        self.revision += 1;
        self.touch = touch;
        self.updated_at = Utc::now();
        if self.status == ClusterStatus::Merged {
            self.status = ClusterStatus::Stale;
        }
    }

    /// Records a committed merge of `revision`.
    ///
    /// The cluster only becomes `Merged` when nothing joined in the meantime;
    /// otherwise it stays pending a remerge. Older revisions never overwrite a
    /// newer `merged_revision`.
    pub fn mark_merged(&mut self, revision: u64) {
        if revision > self.revision {
            return;
        }
        if self.merged_revision.map_or(true, |current| revision > current) {
            self.merged_revision = Some(revision);
        }
        self.status = if self.merged_revision == Some(self.revision) {
            ClusterStatus::Merged
        } else if self.merged_revision.is_some() {
            ClusterStatus::Stale
        } else {
            ClusterStatus::Open
        };
    }

    pub fn needs_merge(&self) -> bool {
        self.status != ClusterStatus::Merged && !self.members.is_empty()
    }

    pub fn contains(&self, canonical_url: &str) -> bool {
        self.members
            .iter()
            .any(|member| member.canonical_url == canonical_url)
    }

    pub fn member_urls(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|member| member.canonical_url.clone())
            .collect()
    }
}
