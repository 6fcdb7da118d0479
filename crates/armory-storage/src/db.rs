//! SQLite-backed registry and key/value state.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use armory_core::{ArmigerEntry, ArmigerRecord, IdentityId, RecordId};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

fn db_err(op: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |source| PersistenceError::Database { op, source }
}

/// Point operations the reconciler and resolver need from the registry table.
#[async_trait]
pub trait ArmigerStore: Send + Sync {
    async fn record_ids(&self) -> Result<Vec<RecordId>, PersistenceError>;
    async fn get(&self, record_id: RecordId) -> Result<Option<ArmigerRecord>, PersistenceError>;
    /// Returns whether a row was removed.
    async fn delete(&self, record_id: RecordId) -> Result<bool, PersistenceError>;
    /// Insert or refresh the document-owned columns. Never touches the identity link.
    async fn upsert(&self, entry: &ArmigerEntry) -> Result<(), PersistenceError>;
    /// Set the identity link only if it is currently unset. Returns whether it was set.
    async fn link_identity(
        &self,
        record_id: RecordId,
        identity: IdentityId,
    ) -> Result<bool, PersistenceError>;
    async fn unlinked(&self) -> Result<Vec<ArmigerRecord>, PersistenceError>;
}

/// String-keyed scalar persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    async fn set_value(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        if let Some(parent) = sqlite_file_path(database_url).and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database with migrations applied.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ArmigerRecord>, PersistenceError> {
        sqlx::query(
            "SELECT record_id, qualified_name, qualified_discriminator, blazon, linked_identity_id
             FROM armigers ORDER BY record_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list"))?
        .iter()
        .map(row_to_record)
        .collect()
    }

    pub async fn find_by_identity(
        &self,
        identity: IdentityId,
    ) -> Result<Option<ArmigerRecord>, PersistenceError> {
        sqlx::query(
            "SELECT record_id, qualified_name, qualified_discriminator, blazon, linked_identity_id
             FROM armigers WHERE linked_identity_id = ?1",
        )
        .bind(identity.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find_by_identity"))?
        .as_ref()
        .map(row_to_record)
        .transpose()
    }

    /// Case-insensitive lookup: exact name when a discriminator is given, substring otherwise.
    pub async fn search_by_name(
        &self,
        name: &str,
        discriminator: Option<&str>,
    ) -> Result<Vec<ArmigerRecord>, PersistenceError> {
        let rows = match discriminator {
            Some(discriminator) => sqlx::query(
                "SELECT record_id, qualified_name, qualified_discriminator, blazon, linked_identity_id
                 FROM armigers WHERE qualified_name LIKE ?1 ESCAPE '\\'
                 AND qualified_discriminator = ?2 ORDER BY record_id",
            )
            .bind(escape_like(name))
            .bind(discriminator)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT record_id, qualified_name, qualified_discriminator, blazon, linked_identity_id
                 FROM armigers WHERE qualified_name LIKE ?1 ESCAPE '\\' ORDER BY record_id",
            )
            .bind(format!("%{}%", escape_like(name)))
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(db_err("search_by_name"))?;
        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl ArmigerStore for SqliteStore {
    async fn record_ids(&self) -> Result<Vec<RecordId>, PersistenceError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT record_id FROM armigers ORDER BY record_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("record_ids"))?;
        Ok(ids.into_iter().map(RecordId).collect())
    }

    async fn get(&self, record_id: RecordId) -> Result<Option<ArmigerRecord>, PersistenceError> {
        sqlx::query(
            "SELECT record_id, qualified_name, qualified_discriminator, blazon, linked_identity_id
             FROM armigers WHERE record_id = ?1",
        )
        .bind(record_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get"))?
        .as_ref()
        .map(row_to_record)
        .transpose()
    }

    async fn delete(&self, record_id: RecordId) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM armigers WHERE record_id = ?1")
            .bind(record_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, entry: &ArmigerEntry) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO armigers (record_id, qualified_name, qualified_discriminator, blazon)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(record_id) DO UPDATE SET
                qualified_name = excluded.qualified_name,
                qualified_discriminator = excluded.qualified_discriminator,
                blazon = excluded.blazon",
        )
        .bind(entry.record_id.0)
        .bind(&entry.qualified_name)
        .bind(&entry.qualified_discriminator)
        .bind(&entry.blazon)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert"))?;
        Ok(())
    }

    async fn link_identity(
        &self,
        record_id: RecordId,
        identity: IdentityId,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE armigers SET linked_identity_id = ?1
             WHERE record_id = ?2 AND linked_identity_id IS NULL",
        )
        .bind(identity.0)
        .bind(record_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err("link_identity"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn unlinked(&self) -> Result<Vec<ArmigerRecord>, PersistenceError> {
        sqlx::query(
            "SELECT record_id, qualified_name, qualified_discriminator, blazon, linked_identity_id
             FROM armigers WHERE linked_identity_id IS NULL ORDER BY record_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("unlinked"))?
        .iter()
        .map(row_to_record)
        .collect()
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_value"))
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err("set_value"))?;
        Ok(())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ArmigerRecord, PersistenceError> {
    let map = db_err("decode_row");
    Ok(ArmigerRecord {
        record_id: RecordId(row.try_get("record_id").map_err(&map)?),
        qualified_name: row.try_get("qualified_name").map_err(&map)?,
        qualified_discriminator: row.try_get("qualified_discriminator").map_err(&map)?,
        blazon: row.try_get("blazon").map_err(&map)?,
        linked_identity_id: row
            .try_get::<Option<i64>, _>("linked_identity_id")
            .map_err(&map)?
            .map(IdentityId),
    })
}

fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let rest = rest.split_once('?').map(|(path, _)| path).unwrap_or(rest);
    if rest.is_empty() || rest == ":memory:" {
        return None;
    }
    Some(Path::new(rest))
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
