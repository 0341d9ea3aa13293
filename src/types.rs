//! Core data types for dynhashtag
//!
//! Documents and authors as delivered by the stream, the keyword/author
//! [`QuerySet`] that defines a topic, and the immutable [`ModelSnapshot`]
//! handed from the retrain worker to the ingestion loop.

use crate::filter::classifier::Classifier;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifier of a document (post) as assigned by the upstream service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an author (user account)
///
/// Kept as the decimal string form the upstream API uses, so ids never lose
/// precision on the way through JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(pub String);

impl AuthorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AuthorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AuthorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Structured entities extracted by the upstream service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entities {
    /// Hashtag texts without the leading `#`
    pub hashtags: Vec<String>,

    /// Ids of mentioned users, in order of appearance
    pub mentions: Vec<AuthorId>,

    /// Expanded URLs
    pub urls: Vec<String>,
}

/// Engagement counters at the time the document was received
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub favorite_count: u64,
    pub retweet_count: u64,
}

/// A single post from the stream
///
/// Immutable once received. The ingestion loop either drops it or hands it
/// to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub author_id: AuthorId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entities: Entities,
    #[serde(default)]
    pub engagement: Engagement,
    #[serde(default)]
    pub in_reply_to_user: Option<AuthorId>,
    #[serde(default)]
    pub in_reply_to_document: Option<DocumentId>,
    #[serde(default)]
    pub source: Option<String>,
}

impl Document {
    /// Minimal document, mostly useful for tests and fixtures
    pub fn new(id: &str, author_id: &str, text: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: DocumentId::from(id),
            author_id: AuthorId::from(author_id),
            text: text.to_string(),
            created_at,
            entities: Entities::default(),
            engagement: Engagement::default(),
            in_reply_to_user: None,
            in_reply_to_document: None,
            source: None,
        }
    }

    pub fn with_hashtags(mut self, hashtags: &[&str]) -> Self {
        self.entities.hashtags = hashtags.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_mentions(mut self, mentions: &[&str]) -> Self {
        self.entities.mentions = mentions.iter().map(|m| AuthorId::from(*m)).collect();
        self
    }
}

/// Author profile, upserted alongside each kept document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub screen_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub followers_count: u64,
    pub friends_count: u64,
    pub statuses_count: u64,
    pub favourites_count: u64,
    pub listed_count: u64,
    pub verified: bool,
    pub lang: Option<String>,
    pub location: Option<String>,
}

impl Author {
    pub fn new(id: &str, screen_name: &str) -> Self {
        Self {
            id: AuthorId::from(id),
            screen_name: screen_name.to_string(),
            created_at: None,
            description: None,
            followers_count: 0,
            friends_count: 0,
            statuses_count: 0,
            favourites_count: 0,
            listed_count: 0,
            verified: false,
            lang: None,
            location: None,
        }
    }
}

/// Keywords and authors that define the followed topic
///
/// Both sets keep insertion order so expansions append after the seed.
/// Keywords are stored lowercase; matching is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySet {
    keywords: IndexSet<String>,
    authors: IndexSet<AuthorId>,
}

impl QuerySet {
    /// Build a query from seed keywords and author ids
    pub fn new<K, A>(keywords: K, authors: A) -> Self
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        let mut query = Self::default();
        for keyword in keywords {
            query.insert_keyword(keyword.as_ref());
        }
        for author in authors {
            query.insert_author(AuthorId::from(author.as_ref()));
        }
        query
    }

    fn insert_keyword(&mut self, keyword: &str) -> bool {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            return false;
        }
        self.keywords.insert(keyword)
    }

    fn insert_author(&mut self, author: AuthorId) -> bool {
        if author.0.is_empty() {
            return false;
        }
        self.authors.insert(author)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }

    pub fn authors(&self) -> impl Iterator<Item = &AuthorId> {
        self.authors.iter()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    pub fn author_count(&self) -> usize {
        self.authors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.authors.is_empty()
    }

    /// Case-insensitive keyword membership
    pub fn contains_keyword(&self, term: &str) -> bool {
        if self.keywords.contains(term) {
            return true;
        }
        self.keywords.contains(&term.to_lowercase())
    }

    pub fn contains_author(&self, author: &AuthorId) -> bool {
        self.authors.contains(author)
    }

    /// New query holding every term of `self` followed by the new terms of `other`
    pub fn union(&self, other: &QuerySet) -> QuerySet {
        let mut merged = self.clone();
        for keyword in &other.keywords {
            merged.insert_keyword(keyword);
        }
        for author in &other.authors {
            merged.insert_author(author.clone());
        }
        merged
    }

    pub fn is_superset_of(&self, other: &QuerySet) -> bool {
        other.keywords.iter().all(|k| self.keywords.contains(k))
            && other.authors.iter().all(|a| self.authors.contains(a))
    }

    /// Server-side filter predicate: any keyword in the text or hashtags, or
    /// a tracked author writing or being mentioned.
    pub fn matches(&self, doc: &Document) -> bool {
        if self.contains_author(&doc.author_id)
            || doc.entities.mentions.iter().any(|m| self.contains_author(m))
        {
            return true;
        }
        if doc
            .entities
            .hashtags
            .iter()
            .any(|h| self.contains_keyword(h))
        {
            return true;
        }
        doc.text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .any(|w| self.contains_keyword(w))
    }

    /// Subscription predicate derived from this query
    pub fn to_filter(&self) -> StreamFilter {
        StreamFilter {
            track: self.keywords.iter().cloned().collect(),
            follow: self.authors.iter().cloned().collect(),
        }
    }
}

impl std::fmt::Display for QuerySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keywords: Vec<&str> = self.keywords().collect();
        let authors: Vec<&str> = self.authors().map(AuthorId::as_str).collect();
        write!(
            f,
            "keywords=[{}] authors=[{}]",
            keywords.join(","),
            authors.join(",")
        )
    }
}

/// Keyword/author predicate sent to the subscription client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFilter {
    pub track: Vec<String>,
    pub follow: Vec<AuthorId>,
}

/// Monotonically increasing classifier generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Output of one completed retraining cycle
///
/// The classifier and the query it was trained against always travel
/// together; the ingestion loop encodes with `query` whenever it predicts
/// with `classifier`.
#[derive(Clone)]
pub struct ModelSnapshot {
    pub generation: Generation,
    pub classifier: Arc<dyn Classifier>,
    pub query: Arc<QuerySet>,
    pub trained_at: DateTime<Utc>,
    pub positives: usize,
    pub negatives: usize,
}

impl std::fmt::Debug for ModelSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSnapshot")
            .field("generation", &self.generation)
            .field("classifier", &self.classifier.name())
            .field("query", &self.query)
            .field("trained_at", &self.trained_at)
            .field("positives", &self.positives)
            .field("negatives", &self.negatives)
            .finish()
    }
}
