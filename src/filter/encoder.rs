//! Feature encoding of documents against a query
//!
//! A document is encoded relative to one [`QuerySet`]:
//!
//! 1. text tokens with `@`/`#` entities and stop words removed (`T`)
//! 2. one indicator per token of `T`: is it a query keyword?
//! 3. one indicator per mention: is the mentioned author tracked?
//! 4. the missed ratio: share of `T` that is not a query keyword
//!
//! The vector length varies with the document, so classifiers work on the
//! fixed-width [`FeatureVector::summary`].

use crate::text::Tokenizer;
use crate::types::{Document, QuerySet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Width of [`FeatureVector::summary`]
pub const SUMMARY_WIDTH: usize = 4;

/// Per-document feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    keyword_flags: Vec<f64>,
    author_flags: Vec<f64>,
    missed_ratio: f64,
}

impl FeatureVector {
    pub fn keyword_flags(&self) -> &[f64] {
        &self.keyword_flags
    }

    pub fn author_flags(&self) -> &[f64] {
        &self.author_flags
    }

    pub fn missed_ratio(&self) -> f64 {
        self.missed_ratio
    }

    /// Number of components in the literal encoding
    pub fn dimension(&self) -> usize {
        self.keyword_flags.len() + self.author_flags.len() + 1
    }

    /// Literal encoding: keyword flags, author flags, missed ratio
    pub fn to_vec(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.dimension());
        out.extend_from_slice(&self.keyword_flags);
        out.extend_from_slice(&self.author_flags);
        out.push(self.missed_ratio);
        out
    }

    /// Fixed-width pooling of the literal encoding
    ///
    /// `[keyword hit rate, author hit rate, missed ratio, any tracked mention]`
    pub fn summary(&self) -> [f64; SUMMARY_WIDTH] {
        let any_author = self.author_flags.iter().any(|f| *f > 0.0);
        [
            mean(&self.keyword_flags),
            mean(&self.author_flags),
            self.missed_ratio,
            if any_author { 1.0 } else { 0.0 },
        ]
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Encodes documents relative to a query
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    tokenizer: Arc<Tokenizer>,
}

impl FeatureEncoder {
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self { tokenizer }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn encode(&self, doc: &Document, query: &QuerySet) -> FeatureVector {
        let tokens = self.tokenizer.tokens(&doc.text);

        let keyword_flags: Vec<f64> = tokens
            .iter()
            .map(|t| if query.contains_keyword(t) { 1.0 } else { 0.0 })
            .collect();

        let author_flags = doc
            .entities
            .mentions
            .iter()
            .map(|m| if query.contains_author(m) { 1.0 } else { 0.0 })
            .collect();

        let missed_ratio = if tokens.is_empty() {
            0.0
        } else {
            let hits = keyword_flags.iter().filter(|f| **f > 0.0).count();
            (tokens.len() - hits) as f64 / tokens.len() as f64
        };

        FeatureVector {
            keyword_flags,
            author_flags,
            missed_ratio,
        }
    }

    pub fn encode_all(&self, docs: &[Document], query: &QuerySet) -> Vec<FeatureVector> {
        docs.iter().map(|doc| self.encode(doc, query)).collect()
    }
}
