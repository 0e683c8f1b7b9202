use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument};

use super::kv::{check_value_size, KvError, KvKey, KvStore, StorageErrorCode};

/// SQLite-backed device store: one table, one row per key.
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    #[instrument(skip(path), fields(db = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqlite_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(map_sqlite_error)?;
        let store = Self::init(conn)?;
        info!("Opened SQLite key-value store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(map_sqlite_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection lock poisoned"))?;
            f(&guard).map_err(map_sqlite_error)
        })
        .await
        .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![raw],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        let raw = key.raw();
        let now = crate::model::UnixTimeMs::now().0 as i64;
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![raw, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![raw])
                .map(|n| n > 0)
        })
        .await
    }

    async fn clear(&self) -> Result<(), KvError> {
        self.with_conn(|conn| conn.execute("DELETE FROM kv_entries", []).map(|_| ()))
            .await
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> KvError {
    use rusqlite::ErrorCode;

    let code = match &e {
        rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
            ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
            ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
            ErrorCode::DiskFull => StorageErrorCode::DiskFull,
            ErrorCode::PermissionDenied | ErrorCode::ReadOnly => StorageErrorCode::PermissionDenied,
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StorageErrorCode::Corrupted,
            ErrorCode::CannotOpen => StorageErrorCode::Unavailable,
            _ => StorageErrorCode::IoError,
        },
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::KeyNamespace;
    use tempfile::tempdir;

    #[tokio::test]
    async fn in_memory_roundtrip() {
        let kv = SqliteKv::open_in_memory().unwrap();
        let key = KvKey::new(KeyNamespace::Journeys, "all").unwrap();

        assert_eq!(kv.get(&key).await.unwrap(), None);
        kv.set(&key, b"one".to_vec()).await.unwrap();
        kv.set(&key, b"two".to_vec()).await.unwrap();
        assert_eq!(kv.get(&key).await.unwrap(), Some(b"two".to_vec()));
        assert!(kv.delete(&key).await.unwrap());
        assert_eq!(kv.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.db");
        let key = KvKey::new(KeyNamespace::Tablet, "identity").unwrap();

        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.set(&key, vec![9, 9]).await.unwrap();
        }

        let reopened = SqliteKv::open(&path).unwrap();
        assert_eq!(reopened.get(&key).await.unwrap(), Some(vec![9, 9]));

        reopened.clear().await.unwrap();
        assert_eq!(reopened.get(&key).await.unwrap(), None);
    }
}
