use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use outpost_crypto::cipher::{CryptoError, DatabaseCipher, ServerKey};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{instrument, warn};

/// Errors produced by the settings store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested key does not exist.
    #[error("setting not found: {key}")]
    NotFound { key: String },
    /// The stored envelope failed to open under the current server key.
    /// Treat as data-loss risk (key rotated without re-encrypting rows),
    /// not as an ignorable miss.
    #[error("value authentication failed for key: {key}")]
    Auth { key: String },
    /// Cipher construction was refused; the store must not open.
    #[error("server key rejected: {0}")]
    Key(#[source] CryptoError),
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

/// Result of a bulk read: decrypted values plus the keys whose envelopes
/// failed to open. One corrupt row must not take down the whole surface, but
/// callers get to see exactly what was skipped.
#[derive(Debug, Default)]
pub struct Settings {
    pub values: BTreeMap<String, String>,
    pub skipped: Vec<String>,
}

/// Row timestamps, refreshed by upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
";

/// Durable, encrypted key-value store for opaque string settings. All access
/// serializes through one connection guarded by a writer lock; encryption and
/// decryption happen entirely inside the store.
pub struct SettingsStore {
    conn: Mutex<Connection>,
    cipher: DatabaseCipher,
}

impl SettingsStore {
    /// Open (or create) the settings database at `path`, sealed under the
    /// given server key. A rejected key fails construction; the store never
    /// operates unencrypted.
    pub fn open(path: impl AsRef<Path>, key: ServerKey) -> Result<Self, StoreError> {
        let cipher = DatabaseCipher::new(key).map_err(StoreError::Key)?;

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panicked transaction body poisons the lock after rusqlite has
        // already rolled back; the connection itself is still consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch and decrypt the value for `key`.
    #[instrument(skip(self))]
    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        let envelope = {
            let conn = self.lock();
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        };

        let envelope = envelope.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        open_value(&self.cipher, key, &envelope)
    }

    /// Seal and upsert a value. Replaces any existing row for `key` and
    /// refreshes `updated_at`; the plaintext is sealed before the write and
    /// is never logged.
    #[instrument(skip(self, value))]
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let envelope = seal_value(&self.cipher, value)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = CURRENT_TIMESTAMP",
            params![key, envelope],
        )?;
        Ok(())
    }

    /// Remove a setting. Deleting an absent key is an error, matching `get`.
    #[instrument(skip(self))]
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Whether a setting exists, without decrypting it.
    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Decrypt every setting. Rows that fail to open are reported in
    /// `skipped` and logged, not fatal: partial results keep the rest of the
    /// surface usable when a single row is corrupt.
    #[instrument(skip(self))]
    pub fn list_all(&self) -> Result<Settings, StoreError> {
        let rows = {
            let conn = self.lock();
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut settings = Settings::default();
        for (key, envelope) in rows {
            match open_value(&self.cipher, &key, &envelope) {
                Ok(value) => {
                    settings.values.insert(key, value);
                }
                Err(err) => {
                    warn!(key, error = %err, "skipping undecryptable setting");
                    settings.skipped.push(key);
                }
            }
        }
        Ok(settings)
    }

    /// Row timestamps for `key`.
    pub fn metadata(&self, key: &str) -> Result<SettingMeta, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT created_at, updated_at FROM settings WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let (created, updated) = row.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(SettingMeta {
            created_at: parse_timestamp(&created)?,
            updated_at: parse_timestamp(&updated)?,
        })
    }

    /// Run `body` inside one atomic unit. An error from the body rolls the
    /// transaction back and propagates unchanged; a panic unwinds through the
    /// transaction's drop (which also rolls back) before propagating.
    pub fn run_in_transaction<F>(&self, body: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SettingsTx<'_>) -> Result<(), StoreError>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut handle = SettingsTx {
            tx: &tx,
            cipher: &self.cipher,
        };
        body(&mut handle)?;
        tx.commit()?;
        Ok(())
    }
}

/// Transaction-scoped handle: the same operations, one atomic unit.
pub struct SettingsTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    cipher: &'a DatabaseCipher,
}

impl SettingsTx<'_> {
    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        let envelope = self
            .tx
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        open_value(self.cipher, key, &envelope)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let envelope = seal_value(self.cipher, value)?;
        self.tx.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = CURRENT_TIMESTAMP",
            params![key, envelope],
        )?;
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let affected = self
            .tx
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let exists = self.tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn seal_value(cipher: &DatabaseCipher, value: &str) -> Result<String, StoreError> {
    cipher
        .seal(value.as_bytes())
        .map_err(|e| StoreError::Storage {
            reason: format!("seal failed: {e}"),
        })
}

fn open_value(cipher: &DatabaseCipher, key: &str, envelope: &str) -> Result<String, StoreError> {
    let plaintext = cipher.open(envelope).map_err(|_| StoreError::Auth {
        key: key.to_string(),
    })?;
    String::from_utf8(plaintext).map_err(|_| StoreError::Storage {
        reason: format!("setting {key} decrypted to non-UTF-8 data"),
    })
}

/// SQLite's CURRENT_TIMESTAMP renders as `YYYY-MM-DD HH:MM:SS` in UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Storage {
            reason: format!("unparseable row timestamp {raw:?}: {e}"),
        })
}
