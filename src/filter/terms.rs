//! TF-IDF selection of query expansion terms
//!
//! Term statistics are rebuilt from the positive corpus on every cycle:
//! `frequency` counts every occurrence of a term, `doc_frequency` the number
//! of documents containing it. A term scores
//! `frequency * ln(total_occurrences / doc_frequency)`.

use crate::text::Tokenizer;
use crate::types::{AuthorId, Document, QuerySet};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// How the next query is derived from the selected terms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionPolicy {
    /// Next query = current query ∪ selected terms
    #[default]
    Expand,
    /// Next query = seed query ∪ selected terms
    Replace,
}

/// Occurrence counts of one term in the positive corpus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermStats {
    pub frequency: usize,
    pub doc_frequency: usize,
}

/// Term and author counts over one corpus, in first-seen order
#[derive(Debug, Clone, Default)]
pub struct TermIndex {
    terms: IndexMap<String, TermStats>,
    authors: IndexMap<AuthorId, usize>,
    total_occurrences: usize,
    documents: usize,
}

impl TermIndex {
    pub fn build(tokenizer: &Tokenizer, docs: &[Document]) -> Self {
        let mut index = Self::default();
        for doc in docs {
            index.add_document(tokenizer, doc);
        }
        index
    }

    pub fn add_document(&mut self, tokenizer: &Tokenizer, doc: &Document) {
        let terms = tokenizer.terms(doc);
        let mut seen = IndexSet::with_capacity(terms.len());

        for term in terms {
            self.total_occurrences += 1;
            let stats = self.terms.entry(term.clone()).or_default();
            stats.frequency += 1;
            if seen.insert(term) {
                stats.doc_frequency += 1;
            }
        }

        // The author and everyone mentioned count once per document
        let participants: IndexSet<&AuthorId> = std::iter::once(&doc.author_id)
            .chain(doc.entities.mentions.iter())
            .collect();
        for author in participants {
            *self.authors.entry(author.clone()).or_default() += 1;
        }

        self.documents += 1;
    }

    pub fn stats(&self, term: &str) -> Option<TermStats> {
        self.terms.get(term).copied()
    }

    /// Number of positive documents `author` wrote or was mentioned in
    pub fn author_documents(&self, author: &AuthorId) -> usize {
        self.authors.get(author).copied().unwrap_or(0)
    }

    pub fn total_occurrences(&self) -> usize {
        self.total_occurrences
    }

    pub fn document_count(&self) -> usize {
        self.documents
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// TF-IDF score of a term; `None` for terms never seen
    pub fn score(&self, term: &str) -> Option<f64> {
        self.stats(term).and_then(|stats| self.score_stats(stats))
    }

    fn score_stats(&self, stats: TermStats) -> Option<f64> {
        if stats.doc_frequency == 0 {
            return None;
        }
        let idf = (self.total_occurrences as f64 / stats.doc_frequency as f64).ln();
        Some(stats.frequency as f64 * idf)
    }

    /// Every term with its score, in first-seen order
    pub fn scored_terms(&self) -> impl Iterator<Item = (&str, f64)> {
        self.terms
            .iter()
            .filter_map(|(term, stats)| self.score_stats(*stats).map(|s| (term.as_str(), s)))
    }
}

/// Terms chosen for the next query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub keywords: Vec<String>,
    pub authors: Vec<AuthorId>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.authors.is_empty()
    }

    pub fn to_query(&self) -> QuerySet {
        QuerySet::new(&self.keywords, self.authors.iter().map(AuthorId::as_str))
    }
}

/// Picks expansion keywords and authors from a [`TermIndex`]
#[derive(Debug, Clone)]
pub struct TermSelector {
    top_k: usize,
    min_author_documents: usize,
    policy: ExpansionPolicy,
}

impl TermSelector {
    pub fn new(top_k: usize, min_author_documents: usize, policy: ExpansionPolicy) -> Self {
        Self {
            top_k,
            min_author_documents,
            policy,
        }
    }

    pub fn policy(&self) -> ExpansionPolicy {
        self.policy
    }

    /// Top-K new keywords by score plus frequently seen authors
    ///
    /// Keywords already in `current` are skipped. Equal scores keep the
    /// order in which the terms were first seen. Terms with a non-positive
    /// score carry no signal and are never picked.
    pub fn select(&self, index: &TermIndex, current: &QuerySet) -> Selection {
        let mut candidates: Vec<(&str, f64)> = index
            .scored_terms()
            .filter(|(term, score)| *score > 0.0 && !current.contains_keyword(term))
            .collect();

        // Stable sort keeps first-seen order among ties
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let keywords: Vec<String> = candidates
            .into_iter()
            .take(self.top_k)
            .map(|(term, _)| term.to_string())
            .collect();

        let authors: Vec<AuthorId> = index
            .authors
            .iter()
            .filter(|(author, count)| **count > self.min_author_documents && !current.contains_author(author))
            .map(|(author, _)| author.clone())
            .collect();

        debug!(
            "Selected {} keywords and {} authors from {} terms over {} documents",
            keywords.len(),
            authors.len(),
            index.term_count(),
            index.document_count()
        );

        Selection { keywords, authors }
    }

    /// The query the next classifier generation is trained against
    pub fn next_query(&self, seed: &QuerySet, current: &QuerySet, selection: &Selection) -> QuerySet {
        let base = match self.policy {
            ExpansionPolicy::Expand => current,
            ExpansionPolicy::Replace => seed,
        };
        base.union(&selection.to_query())
    }
}
