//! Pairwise "same story" scoring for normalized articles.
//!
//! The score is a pure function of the two articles' titles, bodies and brand/model
//! tags. Every component is symmetric and iterates ordered collections, so
//! `score(a, b)` and `score(b, a)` are bit-for-bit identical.

use lazy_static::lazy_static;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::{BTreeMap, BTreeSet};
use strsim::normalized_levenshtein;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

use crate::article::Article;

/// Default acceptance threshold for [`SimilarityEngine::similar`].
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.70;

const TITLE_WEIGHT: f64 = 0.6;
const CONTENT_WEIGHT: f64 = 0.3;
const ENTITY_WEIGHT: f64 = 0.1;

lazy_static! {
    static ref STOP_WORDS: BTreeSet<&'static str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did",
        "will", "would", "could", "should", "this", "that", "these", "those", "i", "you", "he",
        "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your", "his", "its",
        "our", "their", "said", "says", "new", "latest", "breaking", "news", "from", "into",
        "also", "than", "then", "there", "which", "who", "what", "when", "where", "while",
    ]
    .into_iter()
    .collect();
    static ref NOISE: Regex = Regex::new(
        r"\b(breaking|latest|update|news|report|article|story|according to|sources say|reports suggest|today|yesterday|recently|currently)\b"
    )
    .unwrap();
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").unwrap();
}

/// Per-component breakdown, mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub title: f64,
    pub content: f64,
    pub entity: f64,
    pub overall: f64,
    /// Both articles name brands and none are shared.
    pub brand_conflict: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityEngine {
    threshold: f64,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl SimilarityEngine {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn score(&self, a: &Article, b: &Article) -> f64 {
        self.breakdown(a, b).overall
    }

    pub fn similar(&self, a: &Article, b: &Article) -> bool {
        let breakdown = self.breakdown(a, b);
        !breakdown.brand_conflict && breakdown.overall >= self.threshold
    }

    pub fn breakdown(&self, a: &Article, b: &Article) -> ScoreBreakdown {
        if has_brand_conflict(a, b) {
            return ScoreBreakdown {
                title: 0.0,
                content: 0.0,
                entity: 0.0,
                overall: 0.0,
                brand_conflict: true,
            };
        }

        let title = title_similarity(&a.title, &b.title);
        let content = content_similarity(&a.body, &b.body);

        let (entity, overall) = if a.has_tags() && b.has_tags() {
            let entity = entity_similarity(a, b);
            (
                entity,
                TITLE_WEIGHT * title + CONTENT_WEIGHT * content + ENTITY_WEIGHT * entity,
            )
        } else {
            // No tags on one side: text-only, reweighted to keep the [0,1] range.
            (
                0.0,
                (TITLE_WEIGHT * title + CONTENT_WEIGHT * content) / (TITLE_WEIGHT + CONTENT_WEIGHT),
            )
        };

        ScoreBreakdown {
            title,
            content,
            entity,
            overall: overall.clamp(0.0, 1.0),
            brand_conflict: false,
        }
    }
}

fn has_brand_conflict(a: &Article, b: &Article) -> bool {
    a.has_tags() && b.has_tags() && a.brands.is_disjoint(&b.brands)
}

/// Lowercased, NFKC-folded text with punctuation and news filler removed.
pub fn preprocess(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    let stripped = NON_WORD.replace_all(&folded, " ");
    let denoised = NOISE.replace_all(&stripped, " ");
    denoised.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stemmed content words: stop words and words of two characters or fewer dropped.
fn meaningful_words(text: &str) -> Vec<String> {
    let stemmer = Stemmer::create(Algorithm::English);
    preprocess(text)
        .unicode_words()
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        .map(|w| stemmer.stem(w).into_owned())
        .collect()
}

fn word_set(text: &str) -> BTreeSet<String> {
    meaningful_words(text).into_iter().collect()
}

fn word_counts(text: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for word in meaningful_words(text) {
        *counts.entry(word).or_insert(0) += 1;
    }
    counts
}

/// 70% character-level edit similarity, 30% content-word overlap.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let clean_a = preprocess(a);
    let clean_b = preprocess(b);
    if clean_a.is_empty() || clean_b.is_empty() {
        return 0.0;
    }

    let sequence = normalized_levenshtein(&clean_a, &clean_b);

    let words_a = word_set(&clean_a);
    let words_b = word_set(&clean_b);
    if words_a.is_empty() || words_b.is_empty() {
        return sequence;
    }

    let shared = words_a.intersection(&words_b).count() as f64;
    let overlap = shared / words_a.len().max(words_b.len()) as f64;
    0.7 * sequence + 0.3 * overlap
}

/// 80% Jaccard over content words, 20% agreement of shared-word frequencies.
pub fn content_similarity(a: &str, b: &str) -> f64 {
    let counts_a = word_counts(a);
    let counts_b = word_counts(b);
    if counts_a.is_empty() || counts_b.is_empty() {
        return 0.0;
    }

    let mut shared = 0usize;
    let mut frequency_sum = 0.0;
    for (word, &count_a) in &counts_a {
        if let Some(&count_b) = counts_b.get(word) {
            shared += 1;
            let diff = count_a.abs_diff(count_b) as f64;
            frequency_sum += 1.0 - diff / count_a.max(count_b) as f64;
        }
    }

    let union = counts_a.len() + counts_b.len() - shared;
    let jaccard = shared as f64 / union as f64;
    let frequency = if shared > 0 {
        frequency_sum / shared as f64
    } else {
        0.0
    };

    0.8 * jaccard + 0.2 * frequency
}

/// Brand overlap weighted 0.6, model overlap 0.4, each normalized by the larger set.
pub fn entity_similarity(a: &Article, b: &Article) -> f64 {
    let brand_overlap = a.brands.intersection(&b.brands).count();
    let model_overlap = a.models.intersection(&b.models).count();
    if brand_overlap == 0 && model_overlap == 0 {
        return 0.0;
    }

    let brand_total = a.brands.len().max(b.brands.len()).max(1) as f64;
    let model_total = a.models.len().max(b.models.len()).max(1) as f64;
    let score = 0.6 * (brand_overlap as f64 / brand_total) + 0.4 * (model_overlap as f64 / model_total);
    score.min(1.0)
}
