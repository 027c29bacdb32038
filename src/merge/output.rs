//! Parsing and validation of the model's merged-article JSON.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::MergeValidationError;

pub const HEADLINE_MAX: usize = 300;
pub const SUBHEADLINE_MAX: usize = 500;
pub const BODY_MIN: usize = 2000;
pub const BODY_MAX: usize = 5000;

/// A single broken constraint. Lengths are counted in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Malformed(String),
    EmptyHeadline,
    HeadlineTooLong(usize),
    SubheadlineTooLong(usize),
    BodyTooShort(usize),
    BodyTooLong(usize),
}

impl Violation {
    /// Whether truncation alone can fix this violation.
    pub fn is_truncatable(&self) -> bool {
        matches!(
            self,
            Violation::HeadlineTooLong(_) | Violation::SubheadlineTooLong(_)
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Malformed(reason) => write!(f, "malformed output: {}", reason),
            Violation::EmptyHeadline => write!(f, "headline is empty"),
            Violation::HeadlineTooLong(len) => {
                write!(f, "headline is {} chars, limit {}", len, HEADLINE_MAX)
            }
            Violation::SubheadlineTooLong(len) => {
                write!(f, "subheadline is {} chars, limit {}", len, SUBHEADLINE_MAX)
            }
            Violation::BodyTooShort(len) => {
                write!(f, "body is {} chars, minimum {}", len, BODY_MIN)
            }
            Violation::BodyTooLong(len) => {
                write!(f, "body is {} chars, maximum {}", len, BODY_MAX)
            }
        }
    }
}

/// Structured fields of a merged article as produced by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub headline: String,
    pub subheadline: Option<String>,
    pub body: String,
    pub brand: Option<String>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default, alias = "title")]
    headline: Option<Value>,
    #[serde(default, alias = "subtitle")]
    subheadline: Option<Value>,
    #[serde(default, alias = "content")]
    body: Option<Value>,
    #[serde(default, alias = "brand_name")]
    brand: Option<Value>,
    #[serde(default, alias = "model_name")]
    model: Option<Value>,
}

/// Strings, with blanks and the literal `null` treated as absent.
fn text_field(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extracts the outermost JSON object from a model reply that may wrap it in
/// prose or a Markdown code fence.
fn json_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

impl MergeOutput {
    /// Parses a model reply. Anything that is not a JSON object with a
    /// headline and body is a [`Violation::Malformed`].
    pub fn parse(text: &str) -> Result<Self, MergeValidationError> {
        let malformed = |reason: &str| MergeValidationError {
            violations: vec![Violation::Malformed(reason.to_string())],
        };

        let slice = json_slice(text).ok_or_else(|| malformed("no JSON object in response"))?;
        let raw: RawOutput =
            serde_json::from_str(slice).map_err(|e| malformed(&e.to_string()))?;

        let headline = text_field(raw.headline).ok_or_else(|| malformed("missing headline"))?;
        let body = text_field(raw.body).ok_or_else(|| malformed("missing body"))?;

        Ok(Self {
            headline,
            subheadline: text_field(raw.subheadline),
            body,
            brand: text_field(raw.brand),
            model: text_field(raw.model),
        })
    }

    pub fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        let headline_len = self.headline.chars().count();
        if headline_len == 0 {
            violations.push(Violation::EmptyHeadline);
        } else if headline_len > HEADLINE_MAX {
            violations.push(Violation::HeadlineTooLong(headline_len));
        }

        if let Some(subheadline) = &self.subheadline {
            let len = subheadline.chars().count();
            if len > SUBHEADLINE_MAX {
                violations.push(Violation::SubheadlineTooLong(len));
            }
        }

        let body_len = self.body.chars().count();
        if body_len < BODY_MIN {
            violations.push(Violation::BodyTooShort(body_len));
        } else if body_len > BODY_MAX {
            violations.push(Violation::BodyTooLong(body_len));
        }

        violations
    }

    pub fn validate(&self) -> Result<(), MergeValidationError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(MergeValidationError { violations })
        }
    }

    /// Shortens an over-long headline or subheadline on a word boundary.
    ///
    /// Returns `None` when some violation cannot be fixed by truncation.
    pub fn truncated(&self) -> Option<Self> {
        let violations = self.violations();
        if violations.is_empty() || !violations.iter().all(Violation::is_truncatable) {
            return None;
        }

        let repaired = Self {
            headline: truncate_on_word(&self.headline, HEADLINE_MAX),
            subheadline: self
                .subheadline
                .as_deref()
                .map(|s| truncate_on_word(s, SUBHEADLINE_MAX)),
            ..self.clone()
        };
        repaired.validate().ok().map(|_| repaired)
    }
}

/// Cuts `text` to at most `max` characters, backing off to the last
/// whitespace so no word is split.
pub fn truncate_on_word(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut.as_str(),
    };
    trimmed
        .trim_end_matches(|c: char| c.is_whitespace() || c == ',' || c == ';' || c == ':')
        .to_string()
}
