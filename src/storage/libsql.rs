//! LibSQL document store
//!
//! Persists kept documents and author profiles in a local file, an in-memory
//! database, or a remote libSQL server.

use crate::error::{DynHashtagError, Result};
use crate::storage::DocumentStore;
use crate::types::{Author, AuthorId, Document, DocumentId, Engagement, Entities};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Builder, Connection, Database};
use tracing::{debug, info};

const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/libsql/001_initial_schema.sql"),
)];

const DOCUMENT_COLUMNS: &str = "id, author_id, created_at, in_reply_to_user, \
     in_reply_to_document, favorite_count, retweet_count, source, text, urls, hashtags, mentions";

/// Split a migration file into statements, skipping comment-only lines
fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        if trimmed.ends_with(';') {
            statements.push(std::mem::take(&mut current));
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// Timestamps are stored in one fixed RFC 3339 shape so `>` compares correctly
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DynHashtagError::InvalidRecord(format!("{}: {}", column, e)))
}

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// In-memory database (for testing)
    InMemory,
    /// Remote libSQL server
    Remote { url: String, token: String },
}

/// LibSQL-backed [`DocumentStore`]
pub struct LibsqlDocumentStore {
    _db: Database,
    // In-memory databases are private to a connection, so one is kept open
    // for the lifetime of the store.
    conn: Connection,
}

impl LibsqlDocumentStore {
    /// Open (and optionally create) the database, then apply migrations
    ///
    /// # Example
    /// ```ignore
    /// let store = LibsqlDocumentStore::new_with_validation(
    ///     ConnectionMode::Local("dynhashtag.db".into()),
    ///     true,
    /// ).await?;
    /// ```
    pub async fn new_with_validation(mode: ConnectionMode, create_if_missing: bool) -> Result<Self> {
        info!(
            "Connecting to LibSQL database: {} (create_if_missing: {})",
            describe(&mode),
            create_if_missing
        );

        let db = match mode {
            ConnectionMode::Local(ref path) => {
                let exists = std::path::Path::new(path).exists();
                if !exists && !create_if_missing {
                    return Err(DynHashtagError::Database(format!(
                        "Database file not found at '{}'. Run 'dynhashtag run' once or set database.path.",
                        path
                    )));
                }
                if create_if_missing {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                DynHashtagError::Database(format!(
                                    "Failed to create database directory {}: {}",
                                    parent.display(),
                                    e
                                ))
                            })?;
                        }
                    }
                }

                Builder::new_local(path).build().await.map_err(|e| {
                    DynHashtagError::Database(format!("Failed to create local database: {}", e))
                })?
            }
            ConnectionMode::InMemory => Builder::new_local(":memory:").build().await.map_err(|e| {
                DynHashtagError::Database(format!("Failed to create in-memory database: {}", e))
            })?,
            ConnectionMode::Remote { ref url, ref token } => {
                Builder::new_remote(url.clone(), token.clone())
                    .build()
                    .await
                    .map_err(|e| {
                        DynHashtagError::Database(format!("Failed to create remote database: {}", e))
                    })?
            }
        };

        let conn = db
            .connect()
            .map_err(|e| DynHashtagError::Database(format!("Failed to get connection: {}", e)))?;

        let store = Self { _db: db, conn };
        store.check_database_health().await?;
        store.run_migrations().await?;

        info!("LibSQL document store ready");
        Ok(store)
    }

    /// Open an existing database (fails if a local file is missing)
    pub async fn new(mode: ConnectionMode) -> Result<Self> {
        Self::new_with_validation(mode, false).await
    }

    /// Check that the connection can execute a trivial query
    pub async fn check_database_health(&self) -> Result<()> {
        self.conn.query("SELECT 1", ()).await.map_err(|e| {
            DynHashtagError::Database(format!("Health check failed: {}", e))
        })?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Apply embedded migrations that have not run yet
    pub async fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS _migrations_applied (
                    migration_name TEXT PRIMARY KEY,
                    applied_at INTEGER NOT NULL
                )",
                params![],
            )
            .await
            .map_err(|e| {
                DynHashtagError::Migration(format!("Failed to create migrations table: {}", e))
            })?;

        for (name, sql) in MIGRATIONS {
            let mut rows = self
                .conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await?;
            let applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => 0,
            };
            if applied > 0 {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            for (i, statement) in parse_sql_statements(sql).iter().enumerate() {
                self.conn.execute(statement, params![]).await.map_err(|e| {
                    DynHashtagError::Migration(format!(
                        "Failed to execute statement #{} in {}: {}",
                        i + 1,
                        name,
                        e
                    ))
                })?;
            }

            self.conn
                .execute(
                    "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                    params![*name, Utc::now().timestamp()],
                )
                .await
                .map_err(|e| {
                    DynHashtagError::Migration(format!("Failed to record migration: {}", e))
                })?;

            info!("Executed migration: {}", name);
        }

        Ok(())
    }

    fn row_to_document(row: &libsql::Row) -> Result<Document> {
        let id: String = row.get(0)?;
        let author_id: String = row.get(1)?;
        let created_at: String = row.get(2)?;
        let in_reply_to_user: Option<String> = row.get(3)?;
        let in_reply_to_document: Option<String> = row.get(4)?;
        let favorite_count: i64 = row.get(5)?;
        let retweet_count: i64 = row.get(6)?;
        let source: Option<String> = row.get(7)?;
        let text: String = row.get(8)?;
        let urls_json: String = row.get(9)?;
        let hashtags_json: String = row.get(10)?;
        let mentions_json: String = row.get(11)?;

        Ok(Document {
            id: DocumentId(id),
            author_id: AuthorId(author_id),
            text,
            created_at: parse_timestamp("documents.created_at", &created_at)?,
            entities: Entities {
                hashtags: serde_json::from_str(&hashtags_json)?,
                mentions: serde_json::from_str(&mentions_json)?,
                urls: serde_json::from_str(&urls_json)?,
            },
            engagement: Engagement {
                favorite_count: favorite_count.max(0) as u64,
                retweet_count: retweet_count.max(0) as u64,
            },
            in_reply_to_user: in_reply_to_user.map(AuthorId),
            in_reply_to_document: in_reply_to_document.map(DocumentId),
            source,
        })
    }
}

fn describe(mode: &ConnectionMode) -> String {
    match mode {
        ConnectionMode::Local(path) => format!("local:{}", path),
        ConnectionMode::InMemory => "memory".to_string(),
        // Never log the token
        ConnectionMode::Remote { url, .. } => format!("remote:{}", url),
    }
}

#[async_trait]
impl DocumentStore for LibsqlDocumentStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO documents ({}, stored_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    DOCUMENT_COLUMNS
                ),
                params![
                    doc.id.0.clone(),
                    doc.author_id.0.clone(),
                    format_timestamp(&doc.created_at),
                    doc.in_reply_to_user.as_ref().map(|a| a.0.clone()),
                    doc.in_reply_to_document.as_ref().map(|d| d.0.clone()),
                    doc.engagement.favorite_count as i64,
                    doc.engagement.retweet_count as i64,
                    doc.source.clone(),
                    doc.text.clone(),
                    serde_json::to_string(&doc.entities.urls)?,
                    serde_json::to_string(&doc.entities.hashtags)?,
                    serde_json::to_string(&doc.entities.mentions)?,
                    Utc::now().timestamp()
                ],
            )
            .await?;

        if inserted == 0 {
            debug!("Document {} already stored", doc.id);
        }
        Ok(())
    }

    async fn insert_author(&self, author: &Author) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO authors (id, screen_name, created_at, description, followers_count, \
                 friends_count, statuses_count, favourites_count, listed_count, verified, lang, \
                 location, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET screen_name = excluded.screen_name, \
                 description = excluded.description, followers_count = excluded.followers_count, \
                 friends_count = excluded.friends_count, statuses_count = excluded.statuses_count, \
                 favourites_count = excluded.favourites_count, listed_count = excluded.listed_count, \
                 verified = excluded.verified, lang = excluded.lang, location = excluded.location, \
                 updated_at = excluded.updated_at",
                params![
                    author.id.0.clone(),
                    author.screen_name.clone(),
                    author.created_at.as_ref().map(format_timestamp),
                    author.description.clone(),
                    author.followers_count as i64,
                    author.friends_count as i64,
                    author.statuses_count as i64,
                    author.favourites_count as i64,
                    author.listed_count as i64,
                    author.verified as i64,
                    author.lang.clone(),
                    author.location.clone(),
                    Utc::now().timestamp()
                ],
            )
            .await?;
        Ok(())
    }

    async fn documents_since(&self, since: DateTime<Utc>) -> Result<Vec<Document>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {} FROM documents WHERE created_at > ? ORDER BY created_at ASC, id ASC",
                    DOCUMENT_COLUMNS
                ),
                params![format_timestamp(&since)],
            )
            .await?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(Self::row_to_document(&row)?);
        }

        debug!("Loaded {} documents created after {}", documents.len(), since);
        Ok(documents)
    }

    async fn count_documents(&self) -> Result<usize> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM documents", ()).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count.max(0) as usize)
    }
}
