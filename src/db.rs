use crate::auth::Principal;
use crate::config::Config;
use crate::error::PersistenceError;
use crate::feed::FeedHub;
use crate::model::{Bookmark, BookmarkId, ChangeEvent, OwnerId};
use crate::store::BookmarkStore;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database as LibsqlDatabase, Row};
use std::path::Path;
use std::time::Duration;

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[
    ("001_schema.sql", include_str!("migrations/001_schema.sql")),
    ("002_sessions.sql", include_str!("migrations/002_sessions.sql")),
];

const BOOKMARK_COLUMNS: &str = "id, user_id, title, url, created_at";

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {s}"))?
        .with_timezone(&Utc))
}

pub struct Database {
    db: LibsqlDatabase,
    conn: Connection,
    feed: FeedHub,
    turso_url: Option<String>,
    turso_auth_token: Option<String>,
}

impl Database {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    pub fn is_replica(turso_url: &Option<String>, turso_auth_token: &Option<String>) -> bool {
        turso_url.is_some() && turso_auth_token.is_some()
    }

    pub async fn sync(&self) -> Result<()> {
        if Self::is_replica(&self.turso_url, &self.turso_auth_token) {
            self.db
                .sync()
                .await
                .map_err(|e| anyhow::anyhow!("sync failed: {}", e))?;
        }
        Ok(())
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    pub async fn new(cfg: &Config, data_dir: &Path, feed: FeedHub) -> Result<Self> {
        let path = data_dir.join(cfg.app.get_db());
        let turso_url = cfg.app.turso_url.clone();
        let turso_auth_token = cfg.app.turso_auth_token.clone();

        let db = match (&turso_url, &turso_auth_token) {
            (Some(url), Some(token)) => {
                tracing::info!("[db] running in synced database mode (offline writes)");
                let sync_interval = Duration::from_secs(cfg.app.sync_interval_seconds);
                Builder::new_synced_database(&path, url.clone(), token.clone())
                    .sync_interval(sync_interval)
                    .build()
                    .await?
            }
            _ => Builder::new_local(&path).build().await?,
        };

        Self::setup(db, feed, turso_url, turso_auth_token).await
    }

    /// Opens a plain local database file, without replication.
    pub async fn open_local(path: &Path, feed: FeedHub) -> Result<Self> {
        let db = Builder::new_local(path).build().await?;
        Self::setup(db, feed, None, None).await
    }

    async fn setup(
        db: LibsqlDatabase,
        feed: FeedHub,
        turso_url: Option<String>,
        turso_auth_token: Option<String>,
    ) -> Result<Self> {
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        Ok(Database {
            db,
            conn,
            feed,
            turso_url,
            turso_auth_token,
        })
    }

    fn row_to_bookmark(row: &Row) -> Result<Bookmark> {
        let id: String = row.get(0)?;
        let owner_id: String = row.get(1)?;
        let created_at: String = row.get(4)?;

        Ok(Bookmark {
            id: id.parse().with_context(|| format!("bad bookmark id {id}"))?,
            owner_id: owner_id.parse().with_context(|| format!("bad user id {owner_id}"))?,
            title: row.get(2)?,
            url: row.get(3)?,
            created_at: from_db_time(&created_at)?,
        })
    }

    pub async fn list_bookmarks(&self, owner: OwnerId) -> Result<Vec<Bookmark>> {
        let query = format!(
            "SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE user_id = ? ORDER BY created_at DESC, rowid DESC"
        );
        let mut rows = self.conn.query(&query, libsql::params![owner.to_string()]).await?;

        let mut bookmarks = vec![];
        while let Some(row) = rows.next().await? {
            bookmarks.push(Self::row_to_bookmark(&row)?);
        }

        Ok(bookmarks)
    }

    pub async fn get_bookmark(&self, id: BookmarkId, owner: OwnerId) -> Result<Option<Bookmark>> {
        let query = format!("SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE id = ? AND user_id = ?");
        let mut rows = self
            .conn
            .query(&query, libsql::params![id.to_string(), owner.to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::row_to_bookmark(&row)?)),
            None => Ok(None),
        }
    }

    /// Inserts the bookmark unless its id is already taken, by any owner.
    /// Returns false, and publishes nothing, when the id exists.
    pub async fn insert_bookmark(&self, bookmark: &Bookmark) -> Result<bool> {
        let query = r#"
            INSERT INTO bookmarks (id, user_id, title, url, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
        "#;

        let inserted = self
            .conn
            .execute(
                query,
                libsql::params![
                    bookmark.id.to_string(),
                    bookmark.owner_id.to_string(),
                    bookmark.title.as_str(),
                    bookmark.url.as_str(),
                    to_db_time(&bookmark.created_at)
                ],
            )
            .await
            .with_context(|| format!("failed to insert bookmark {}", bookmark.id))?;
        if inserted == 0 {
            return Ok(false);
        }

        self.feed.publish(
            bookmark.owner_id,
            ChangeEvent::Insert {
                record: bookmark.clone(),
            },
        );
        Ok(true)
    }

    /// Rewrites title and url of an owned bookmark. `created_at` and the
    /// owner never change.
    pub async fn update_bookmark(
        &self,
        id: BookmarkId,
        owner: OwnerId,
        title: &str,
        url: &str,
    ) -> Result<Option<Bookmark>> {
        let query = format!(
            "UPDATE bookmarks SET title = ?, url = ? WHERE id = ? AND user_id = ? RETURNING {BOOKMARK_COLUMNS}"
        );
        let mut rows = self
            .conn
            .query(&query, libsql::params![title, url, id.to_string(), owner.to_string()])
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let updated = Self::row_to_bookmark(&row)?;

        self.feed.publish(
            owner,
            ChangeEvent::Update {
                record: updated.clone(),
            },
        );
        Ok(Some(updated))
    }

    pub async fn delete_bookmark(&self, id: BookmarkId, owner: OwnerId) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM bookmarks WHERE id = ? AND user_id = ?",
                libsql::params![id.to_string(), owner.to_string()],
            )
            .await?;

        if removed == 0 {
            return Ok(false);
        }

        self.feed.publish(owner, ChangeEvent::Delete { id });
        Ok(true)
    }

    /// Creates the user on first sign-in, keyed by the provider's subject.
    pub async fn upsert_user(&self, subject: &str, email: &str) -> Result<Principal> {
        let query = r#"
            INSERT INTO users (id, subject, email)
            VALUES (?, ?, ?)
            ON CONFLICT (subject) DO UPDATE SET email = excluded.email
            RETURNING id, email
        "#;

        let mut rows = self
            .conn
            .query(query, libsql::params![OwnerId::new().to_string(), subject, email])
            .await?;

        if let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            Ok(Principal {
                id: id.parse().with_context(|| format!("bad user id {id}"))?,
                email: row.get(1)?,
            })
        } else {
            anyhow::bail!("Failed to upsert user {}", subject)
        }
    }

    pub async fn create_session(
        &self,
        token_hash: &str,
        owner: OwnerId,
        created_at: &DateTime<Utc>,
        expires_at: &DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
                libsql::params![
                    token_hash,
                    owner.to_string(),
                    to_db_time(created_at),
                    to_db_time(expires_at)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn find_session_user(&self, token_hash: &str, now: &DateTime<Utc>) -> Result<Option<Principal>> {
        let query = r#"
            SELECT users.id, users.email
            FROM sessions
            JOIN users ON users.id = sessions.user_id
            WHERE sessions.token_hash = ? AND sessions.expires_at > ?
        "#;

        let mut rows = self
            .conn
            .query(query, libsql::params![token_hash, to_db_time(now)])
            .await?;

        if let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            Ok(Some(Principal {
                id: id.parse().with_context(|| format!("bad user id {id}"))?,
                email: row.get(1)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM sessions WHERE token_hash = ?", libsql::params![token_hash])
            .await?;
        Ok(removed > 0)
    }

    pub async fn purge_expired_sessions(&self, now: &DateTime<Utc>) -> Result<u64> {
        let purged = self
            .conn
            .execute("DELETE FROM sessions WHERE expires_at <= ?", libsql::params![to_db_time(now)])
            .await?;
        Ok(purged)
    }
}

impl BookmarkStore for Database {
    async fn list(&self, owner: OwnerId) -> Result<Vec<Bookmark>, PersistenceError> {
        Ok(self.list_bookmarks(owner).await?)
    }

    async fn insert(&self, record: &Bookmark) -> Result<(), PersistenceError> {
        if !self.insert_bookmark(record).await? {
            return Err(anyhow::anyhow!("bookmark {} already exists", record.id).into());
        }
        Ok(())
    }

    async fn delete(&self, id: BookmarkId, owner: OwnerId) -> Result<bool, PersistenceError> {
        Ok(self.delete_bookmark(id, owner).await?)
    }
}
