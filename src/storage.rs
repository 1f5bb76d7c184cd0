use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Small keyed blobs that must survive an app restart.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }
}

impl BlobStore for Store {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM blobs WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("storage: query blob")
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            bail!("storage: blob key required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO blobs (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, Utc::now().timestamp()],
        )
        .context("storage: write blob")?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])
            .context("storage: delete blob")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
    failing: Mutex<bool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail, to exercise I/O error paths.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    fn check(&self) -> Result<()> {
        if *self.failing.lock() {
            bail!("storage: simulated I/O failure");
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Applies pending schema versions, each in its own transaction.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
    )
    .context("storage: create migrations table")?;

    let applied: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("storage: read schema version")?;

    for (version, sql) in (1i64..).zip(migrations()) {
        if version <= applied {
            continue;
        }
        let tx = conn.transaction().context("storage: begin migration")?;
        tx.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
        tx.commit().context("storage: commit migration")?;
    }
    Ok(())
}

fn migrations() -> [&'static str; 1] {
    [r#"
CREATE TABLE IF NOT EXISTS blobs (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("homefeed").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        store.put("comment_likes:l1", "{}").unwrap();
        store.put("comment_likes:l1", r#"{"c1":{"liked":true,"count":1}}"#).unwrap();
        store.close().unwrap();

        let store = Store::open(Options { path: Some(path) }).unwrap();
        assert_eq!(
            store.get("comment_likes:l1").unwrap().as_deref(),
            Some(r#"{"c1":{"liked":true,"count":1}}"#)
        );
        store.remove("comment_likes:l1").unwrap();
        assert_eq!(store.get("comment_likes:l1").unwrap(), None);
    }

    #[test]
    fn empty_key_rejected() {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        assert!(store.put("", "x").is_err());
    }

    #[test]
    fn memory_store_can_fail() {
        let store = MemoryBlobStore::new();
        store.put("k", "v").unwrap();
        store.set_failing(true);
        assert!(store.get("k").is_err());
        store.set_failing(false);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }
}
