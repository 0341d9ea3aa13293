//! Decoding of Twitter-style status payloads
//!
//! Payloads missing an id, an author, text or a parseable timestamp are
//! malformed and decode to `None`; they never reach the encoder.

use crate::types::{Author, AuthorId, Document, DocumentId, Engagement, Entities};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Classic streaming API timestamp, e.g. `Wed Aug 27 13:08:45 +0000 2008`
const CLASSIC_TIMESTAMP: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(default)]
    id_str: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    entities: Option<RawEntities>,
    #[serde(default)]
    favorite_count: Option<u64>,
    #[serde(default)]
    retweet_count: Option<u64>,
    #[serde(default)]
    in_reply_to_user_id_str: Option<String>,
    #[serde(default)]
    in_reply_to_status_id_str: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(default)]
    id_str: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    screen_name: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    followers_count: Option<u64>,
    #[serde(default)]
    friends_count: Option<u64>,
    #[serde(default)]
    statuses_count: Option<u64>,
    #[serde(default)]
    favourites_count: Option<u64>,
    #[serde(default)]
    listed_count: Option<u64>,
    #[serde(default)]
    verified: Option<bool>,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntities {
    #[serde(default)]
    hashtags: Vec<RawHashtag>,
    #[serde(default)]
    user_mentions: Vec<RawMention>,
    #[serde(default)]
    urls: Vec<RawUrl>,
}

#[derive(Debug, Deserialize)]
struct RawHashtag {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawMention {
    #[serde(default)]
    id_str: Option<String>,
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawUrl {
    #[serde(default)]
    expanded_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Ids arrive as `id_str`, as a JSON number, or as a numeric string
fn pick_id(id_str: Option<String>, id: Option<Value>) -> Option<String> {
    id_str.filter(|s| !s.is_empty()).or_else(|| match id {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, CLASSIC_TIMESTAMP))
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

fn convert_user(user: RawUser) -> Option<Author> {
    let id = pick_id(user.id_str, user.id)?;
    Some(Author {
        id: AuthorId(id),
        screen_name: user.screen_name.unwrap_or_default(),
        created_at: user.created_at.as_deref().and_then(parse_created_at),
        description: user.description,
        followers_count: user.followers_count.unwrap_or_default(),
        friends_count: user.friends_count.unwrap_or_default(),
        statuses_count: user.statuses_count.unwrap_or_default(),
        favourites_count: user.favourites_count.unwrap_or_default(),
        listed_count: user.listed_count.unwrap_or_default(),
        verified: user.verified.unwrap_or(false),
        lang: user.lang,
        location: user.location,
    })
}

/// Decode one status payload into a document and its author profile
pub fn decode_status(json: &str) -> Option<(Document, Author)> {
    let raw: RawStatus = serde_json::from_str(json).ok()?;

    let id = pick_id(raw.id_str, raw.id)?;
    let text = raw.full_text.or(raw.text).filter(|t| !t.trim().is_empty())?;
    let created_at = parse_created_at(raw.created_at.as_deref()?)?;
    let author = convert_user(raw.user?)?;

    let entities = raw.entities.unwrap_or_default();
    let entities = Entities {
        hashtags: entities.hashtags.into_iter().map(|h| h.text).collect(),
        mentions: entities
            .user_mentions
            .into_iter()
            .filter_map(|m| pick_id(m.id_str, m.id))
            .map(AuthorId)
            .collect(),
        urls: entities
            .urls
            .into_iter()
            .filter_map(|u| u.expanded_url.or(u.url))
            .collect(),
    };

    let document = Document {
        id: DocumentId(id),
        author_id: author.id.clone(),
        text,
        created_at,
        entities,
        engagement: Engagement {
            favorite_count: raw.favorite_count.unwrap_or_default(),
            retweet_count: raw.retweet_count.unwrap_or_default(),
        },
        in_reply_to_user: raw.in_reply_to_user_id_str.map(AuthorId),
        in_reply_to_document: raw.in_reply_to_status_id_str.map(DocumentId),
        source: raw.source,
    };

    Some((document, author))
}
