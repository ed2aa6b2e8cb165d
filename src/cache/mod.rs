use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Maps sanitized instance names to user-maintained aliases.
pub trait AliasCache: Send + Sync {
    /// Returns the alias for `instance`, registering an identity alias on
    /// first sight.
    fn resolve(&self, instance: &str) -> Result<String>;
}

/// SQLite-backed alias cache shared between agents through the file.
///
/// Several processes may register the same instance at once; the insert
/// is `OR IGNORE`, so whichever row lands first wins and later inserts are
/// no-ops.
pub struct SqliteAliasCache {
    conn: Mutex<Connection>,
}

impl SqliteAliasCache {
    /// Opens (or creates) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening alias cache {}", path.display()))?;
        Self::init(conn)
    }

    /// Opens a private in-memory cache.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory alias cache")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS cache (
                instance TEXT NOT NULL UNIQUE,
                alias TEXT NOT NULL
            );
            ",
        )
        .context("initializing alias cache schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stores an explicit alias, replacing any existing mapping.
    pub fn set_alias(&self, instance: &str, alias: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO cache (instance, alias) VALUES (?1, ?2)",
                params![instance, alias],
            )
            .context("storing alias")?;
        Ok(())
    }
}

impl AliasCache for SqliteAliasCache {
    fn resolve(&self, instance: &str) -> Result<String> {
        let conn = self.conn.lock();

        let existing: Option<String> = conn
            .query_row(
                "SELECT alias FROM cache WHERE instance = ?1",
                params![instance],
                |row| row.get(0),
            )
            .optional()
            .context("querying alias")?;

        if let Some(alias) = existing {
            return Ok(alias);
        }

        conn.execute(
            "INSERT OR IGNORE INTO cache (instance, alias) VALUES (?1, ?1)",
            params![instance],
        )
        .context("registering identity alias")?;

        // Another writer may have won the race with a different alias.
        let alias: String = conn
            .query_row(
                "SELECT alias FROM cache WHERE instance = ?1",
                params![instance],
                |row| row.get(0),
            )
            .context("reading registered alias")?;

        tracing::debug!(instance, alias = %alias, "registered instance in alias cache");

        Ok(alias)
    }
}
