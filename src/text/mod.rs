//! Tokenization and stop-word removal
//!
//! Splits post text into lowercase content tokens. `@mention` and `#hashtag`
//! tokens are dropped from the text because the stream already delivers them
//! as structured entities; URLs are removed before splitting.

mod stopwords;

use crate::types::Document;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bhttps?://\S+").expect("valid url regex"));

static WORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[#@]?[\p{L}\p{N}_]+(?:['’\-][\p{L}\p{N}_]+)*").expect("valid word regex")
});

/// Stop-word language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    German,
    French,
}

impl Language {
    fn stop_words(self) -> &'static [&'static str] {
        match self {
            Language::English => stopwords::ENGLISH,
            Language::German => stopwords::GERMAN,
            Language::French => stopwords::FRENCH,
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "english" | "en" => Ok(Language::English),
            "german" | "de" => Ok(Language::German),
            "french" | "fr" => Ok(Language::French),
            other => Err(format!("unsupported stop-word language: {}", other)),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::English => write!(f, "english"),
            Language::German => write!(f, "german"),
            Language::French => write!(f, "french"),
        }
    }
}

/// Lowercasing tokenizer with a fixed stop-word set
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    stop_words: HashSet<String>,
}

impl Tokenizer {
    /// Tokenizer removing the stop words of every given language
    pub fn new(languages: &[Language]) -> Self {
        let stop_words = languages
            .iter()
            .flat_map(|lang| lang.stop_words().iter())
            .map(|w| w.to_string())
            .collect();
        Self { stop_words }
    }

    /// Tokenizer with an explicit stop-word list
    pub fn with_stop_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stop_words: words.into_iter().map(|w| w.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn is_stop_word(&self, token: &str) -> bool {
        self.stop_words.contains(&token.to_lowercase())
    }

    /// Content tokens of `text` in order of appearance
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let without_urls = URL_PATTERN.replace_all(text, " ");
        WORD_PATTERN
            .find_iter(&without_urls)
            .map(|m| m.as_str())
            .filter(|word| !word.starts_with('#') && !word.starts_with('@'))
            .map(str::to_lowercase)
            .filter(|word| !self.stop_words.contains(word))
            .collect()
    }

    /// Content tokens followed by the document's hashtags
    ///
    /// This is the vocabulary the term selector counts and the negative
    /// sampler checks for overlap.
    pub fn terms(&self, doc: &Document) -> Vec<String> {
        let mut terms = self.tokens(&doc.text);
        terms.extend(
            doc.entities
                .hashtags
                .iter()
                .map(|h| h.trim_start_matches('#').to_lowercase())
                .filter(|h| !h.is_empty() && !self.stop_words.contains(h)),
        );
        terms
    }
}
