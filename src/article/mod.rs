//! Canonical article model and the normalizer that produces it.

pub mod catalogue;
pub mod normalizer;
pub mod types;

pub use catalogue::{Catalogue, Tags};
pub use normalizer::{Normalized, Normalizer};
pub use types::{Article, RawArticle};
